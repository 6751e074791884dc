//! Version-control collaborator.
//!
//! The driver and executor consume VCS operations through the [`Vcs`]
//! trait; [`GitVcs`] implements it with libgit2. A repository handle is
//! opened per operation so the implementation stays `Sync` and safe to
//! share across driver tasks.
//!
//! Worktrees live under `.orc/worktrees/<taskID>` on a branch named
//! `orc/<taskID>`. Checkpoints are whole-tree commits in the task's
//! working copy, one per completed phase.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use git2::{
    BranchType, Cred, PushOptions, RebaseOptions, RemoteCallbacks, Repository, Signature,
    WorktreeAddOptions, WorktreePruneOptions, build::CheckoutBuilder,
};
use tracing::debug;

/// VCS operations the core consumes.
pub trait Vcs: Send + Sync {
    /// The branch a task's work lands on.
    fn branch_name(&self, task_id: &str) -> String;
    /// Create (or reuse) the task's worktree rooted at `base`.
    fn create_worktree(&self, task_id: &str, base: &str) -> Result<PathBuf>;
    /// Remove the task's worktree and prune its administrative files.
    fn cleanup_worktree(&self, task_id: &str) -> Result<()>;
    /// Commit everything in the task's working copy; returns the SHA.
    fn create_checkpoint(&self, task_id: &str, phase: &str, message: &str) -> Result<String>;
    fn fetch(&self) -> Result<()>;
    /// Rebase `branch` onto `onto`.
    fn rebase(&self, branch: &str, onto: &str) -> Result<()>;
    fn checkout(&self, branch: &str) -> Result<()>;
    /// Merge `branch` into the current HEAD.
    fn merge(&self, branch: &str, no_ff: bool) -> Result<()>;
    fn push(&self, branch: &str) -> Result<()>;
    fn delete_branch(&self, branch: &str) -> Result<()>;
}

pub struct GitVcs {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitVcs {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            worktrees_dir: repo_root.join(".orc").join("worktrees"),
        }
    }

    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktrees_dir.join(task_id)
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.repo_root).context("Failed to open git repository")
    }

    /// The repository for checkpoints: the task's worktree if it exists,
    /// otherwise the main working copy.
    fn open_for_task(&self, task_id: &str) -> Result<Repository> {
        let worktree = self.worktree_path(task_id);
        if worktree.exists() {
            Repository::open(&worktree).context("Failed to open task worktree")
        } else {
            self.open()
        }
    }

    fn signature() -> Result<Signature<'static>> {
        Signature::now("orc", "orc@localhost").context("Failed to create git signature")
    }
}

fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

impl Vcs for GitVcs {
    fn branch_name(&self, task_id: &str) -> String {
        format!("orc/{}", task_id)
    }

    fn create_worktree(&self, task_id: &str, base: &str) -> Result<PathBuf> {
        let path = self.worktree_path(task_id);
        if path.exists() {
            debug!(task = task_id, path = %path.display(), "reusing existing worktree");
            return Ok(path);
        }

        let repo = self.open()?;
        std::fs::create_dir_all(&self.worktrees_dir).with_context(|| {
            format!(
                "Failed to create worktrees directory: {}",
                self.worktrees_dir.display()
            )
        })?;

        let branch = self.branch_name(task_id);
        let branch_ref = match repo.find_branch(&branch, BranchType::Local) {
            Ok(existing) => existing,
            Err(_) => {
                let base_commit = repo
                    .revparse_single(base)
                    .with_context(|| format!("Base branch '{}' not found", base))?
                    .peel_to_commit()
                    .context("Base does not point at a commit")?;
                repo.branch(&branch, &base_commit, false)
                    .with_context(|| format!("Failed to create branch '{}'", branch))?
            }
        };

        let reference = branch_ref.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(task_id, &path, Some(&opts))
            .with_context(|| format!("Failed to create worktree for task '{}'", task_id))?;

        Ok(path)
    }

    fn cleanup_worktree(&self, task_id: &str) -> Result<()> {
        let repo = self.open()?;
        if let Ok(worktree) = repo.find_worktree(task_id) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            worktree
                .prune(Some(&mut opts))
                .with_context(|| format!("Failed to prune worktree '{}'", task_id))?;
        }
        let path = self.worktree_path(task_id);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove worktree dir: {}", path.display()))?;
        }
        Ok(())
    }

    fn create_checkpoint(&self, task_id: &str, phase: &str, message: &str) -> Result<String> {
        let repo = self.open_for_task(task_id)?;

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature()?;

        let commit_id = if let Some(parent) = head_commit(&repo) {
            // Nothing changed since the parent: reuse it as the checkpoint
            if parent.tree_id() == tree_id {
                debug!(task = task_id, phase, "no changes to checkpoint");
                return Ok(parent.id().to_string());
            }
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        Ok(commit_id.to_string())
    }

    fn fetch(&self) -> Result<()> {
        let repo = self.open()?;
        let mut remote = repo
            .find_remote("origin")
            .context("Remote 'origin' not found")?;
        remote
            .fetch(&[] as &[&str], None, None)
            .context("Failed to fetch from origin")?;
        Ok(())
    }

    fn rebase(&self, branch: &str, onto: &str) -> Result<()> {
        let repo = self.open()?;
        let branch_ref = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", branch))?;
        let branch_commit = repo.reference_to_annotated_commit(branch_ref.get())?;
        let onto_ref = repo
            .find_branch(onto, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", onto))?;
        let onto_commit = repo.reference_to_annotated_commit(onto_ref.get())?;

        let mut opts = RebaseOptions::new();
        let mut rebase = repo
            .rebase(Some(&branch_commit), Some(&onto_commit), None, Some(&mut opts))
            .context("Failed to start rebase")?;

        let sig = Self::signature()?;
        while let Some(op) = rebase.next() {
            op.context("Rebase operation failed")?;
            if repo.index()?.has_conflicts() {
                rebase.abort().ok();
                bail!("Rebase of '{}' onto '{}' hit conflicts", branch, onto);
            }
            rebase.commit(None, &sig, None).context("Failed to commit rebase step")?;
        }
        rebase.finish(Some(&sig)).context("Failed to finish rebase")?;
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let repo = self.open()?;
        let refname = format!("refs/heads/{}", branch);
        let obj = repo
            .revparse_single(&refname)
            .with_context(|| format!("Branch '{}' not found", branch))?;
        repo.checkout_tree(&obj, Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to checkout '{}'", branch))?;
        repo.set_head(&refname)?;
        Ok(())
    }

    fn merge(&self, branch: &str, no_ff: bool) -> Result<()> {
        let repo = self.open()?;
        let branch_ref = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", branch))?;
        let annotated = repo.reference_to_annotated_commit(branch_ref.get())?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(());
        }

        if analysis.is_fast_forward() && !no_ff {
            let mut head = repo.head()?;
            head.set_target(annotated.id(), "fast-forward merge")?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            return Ok(());
        }

        repo.merge(&[&annotated], None, Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to merge '{}'", branch))?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            repo.cleanup_state().ok();
            bail!("Merge of '{}' hit conflicts", branch);
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let head = repo.head()?.peel_to_commit()?;
        let theirs = repo.find_commit(annotated.id())?;
        let sig = Self::signature()?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Merge branch '{}'", branch),
            &tree,
            &[&head, &theirs],
        )?;
        repo.cleanup_state()?;
        Ok(())
    }

    fn push(&self, branch: &str) -> Result<()> {
        let repo = self.open()?;
        let mut remote = repo
            .find_remote("origin")
            .context("Remote 'origin' not found")?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|url, username, _allowed| {
            let config = git2::Config::open_default()?;
            Cred::credential_helper(&config, url, username).or_else(|_| Cred::default())
        });
        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[&refspec], Some(&mut opts))
            .with_context(|| format!("Failed to push '{}'", branch))?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.open()?;
        let mut branch_ref = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", branch))?;
        branch_ref
            .delete()
            .with_context(|| format!("Failed to delete branch '{}'", branch))?;
        Ok(())
    }
}
