//! File-backed transcript persister.
//!
//! Lines are appended as JSONL under `<tasks_dir>/<task_id>/transcript.jsonl`.
//! Sequence ids are assigned here, at write time, strictly increasing per
//! task; retrieval sorts by sequence id so round-trips preserve write order.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{TranscriptLine, TranscriptSink};

pub struct FileTranscriptStore {
    tasks_dir: PathBuf,
    /// Next sequence id per task, lazily initialized from disk
    next_seq: Mutex<HashMap<String, u64>>,
}

impl FileTranscriptStore {
    pub fn new(tasks_dir: &Path) -> Self {
        Self {
            tasks_dir: tasks_dir.to_path_buf(),
            next_seq: Mutex::new(HashMap::new()),
        }
    }

    fn transcript_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id).join("transcript.jsonl")
    }

    /// Highest sequence id already on disk for a task, or 0.
    fn last_seq_on_disk(&self, task_id: &str) -> u64 {
        let path = self.transcript_file(task_id);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return 0;
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str::<TranscriptLine>(line).ok())
            .map(|l| l.seq)
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl TranscriptSink for FileTranscriptStore {
    async fn add_batch(&self, mut lines: Vec<TranscriptLine>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        // Assign sequence ids per task under the counter lock, then write.
        {
            let mut counters = self.next_seq.lock().unwrap();
            for line in &mut lines {
                let next = counters
                    .entry(line.task_id.clone())
                    .or_insert_with(|| self.last_seq_on_disk(&line.task_id) + 1);
                line.seq = *next;
                *next += 1;
            }
        }

        // Batches are homogeneous per task in practice, but group anyway so
        // a mixed batch lands in the right files.
        let mut by_task: HashMap<String, Vec<&TranscriptLine>> = HashMap::new();
        for line in &lines {
            by_task.entry(line.task_id.clone()).or_default().push(line);
        }

        for (task_id, task_lines) in by_task {
            let path = self.transcript_file(&task_id);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create transcript directory: {}", parent.display())
                })?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open transcript file: {}", path.display()))?;
            for line in task_lines {
                let json = serde_json::to_string(line).context("Failed to serialize line")?;
                writeln!(file, "{}", json)
                    .with_context(|| format!("Failed to append to {}", path.display()))?;
            }
        }

        Ok(())
    }

    async fn get_transcripts(&self, task_id: &str) -> Result<Vec<TranscriptLine>> {
        let path = self.transcript_file(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read transcript file: {}", path.display()))?;
        let mut lines: Vec<TranscriptLine> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .with_context(|| format!("Corrupt transcript line in {}", path.display()))
            })
            .collect::<Result<_>>()?;
        lines.sort_by_key(|l| l.seq);
        Ok(lines)
    }
}
