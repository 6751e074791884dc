use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use orc::config::{self, OrcConfig};
use orc::driver::TaskDriver;
use orc::plan::{Plan, default_phases};
use orc::task::{FileTaskStore, Task, TaskStore, TaskWeight};

#[derive(Parser)]
#[command(name = "orc")]
#[command(version, about = "Workflow orchestrator - drive tasks through gated phases")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new task
    New {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "standard")]
        weight: TaskWeight,
        #[arg(long)]
        initiative: Option<String>,
    },
    /// Run a task through its phase pipeline
    Run {
        task_id: String,
    },
    /// Show a task's status
    Status {
        task_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let project_dir = match cli.project_dir {
        Some(dir) => dir.canonicalize().context("Failed to resolve project directory")?,
        None => std::env::current_dir()?,
    };

    let orc_config = OrcConfig::load_or_default(&project_dir)?;
    let store = FileTaskStore::new(&config::orc_dir(&project_dir));

    match cli.command {
        Commands::New {
            title,
            description,
            weight,
            initiative,
        } => {
            let id = format!("T-{}", &uuid::Uuid::new_v4().to_string()[..8]);
            let mut task = Task::new(&id, &title, &description, weight);
            task.initiative_id = initiative;
            store.save_task(&task)?;

            let plan = Plan::new(&id, default_phases());
            let task_dir = config::task_dir(&project_dir, &id);
            std::fs::create_dir_all(&task_dir)?;
            plan.save(&task_dir.join("plan.json"))?;

            println!("Created task {} ({})", console::style(&id).cyan(), title);
        }
        Commands::Run { task_id } => {
            let mut task = store
                .get_task(&task_id)?
                .with_context(|| format!("Task '{}' not found", task_id))?;
            let plan_path = config::task_dir(&project_dir, &task_id).join("plan.json");
            let mut plan = Plan::load(&plan_path)?;

            let mut driver = TaskDriver::with_default_services(&project_dir, orc_config);

            // Ctrl-C turns into a cooperative cancellation signal
            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel_tx.send(true).ok();
                }
            });

            driver.execute_task(&mut task, &mut plan, cancel_rx).await?;
            println!("Task {} completed", task_id);
        }
        Commands::Status { task_id } => {
            let task = store
                .get_task(&task_id)?
                .with_context(|| format!("Task '{}' not found", task_id))?;
            println!("{} - {}", console::style(&task.id).cyan(), task.title);
            println!("  status: {:?}", task.status);

            let plan_path = config::task_dir(&project_dir, &task_id).join("plan.json");
            if let Ok(plan) = Plan::load(&plan_path) {
                for phase in &plan.phases {
                    let commit = phase.commit.as_deref().unwrap_or("-");
                    println!(
                        "  {:12} {:?} ({})",
                        phase.id,
                        phase.status,
                        console::style(commit).dim()
                    );
                }
            }
        }
    }

    Ok(())
}
