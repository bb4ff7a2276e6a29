//! GeoFlow CLI - operator interface for the engine
//!
//! Embeds the engine client against the shared database: submission and
//! status queries go straight through the StateStore/MessageBroker
//! adapters, no RPC server involved.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::{Table, Tabled};

use geoflow_core::application::{builtin, SubmissionService, SubmissionStatus, WorkflowRegistry};
use geoflow_core::application::HandlerRegistry;
use geoflow_core::domain::JobStatus;
use geoflow_core::port::{
    Maintenance, MessageBroker, StateStore, SystemTimeProvider, UuidProvider,
};
use geoflow_infra_sqlite::{
    create_pool, run_migrations, BrokerConfig, PoolHandle, SqliteMaintenance,
    SqliteMessageBroker, SqliteStateStore,
};

const DEFAULT_DB: &str = "~/.geoflow/engine.db";
const DEFAULT_JOB_QUEUE: &str = "jobs";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "geoflow")]
#[command(about = "GeoFlow engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine database path
    #[arg(long, env = "GEOFLOW_DB", default_value = DEFAULT_DB)]
    db: String,

    /// Job queue name
    #[arg(long, env = "GEOFLOW_JOB_QUEUE", default_value = DEFAULT_JOB_QUEUE)]
    job_queue: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit {
        /// Job type (e.g. echo)
        #[arg(short, long)]
        job_type: String,

        /// Parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Poll until the job reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a job's status and stage results
    Status {
        /// Job ID
        job_id: String,
    },

    /// List a job's tasks
    Tasks {
        /// Job ID
        job_id: String,
    },

    /// List dead-lettered messages of a queue
    DeadLetters {
        /// Queue name
        queue: String,
    },

    /// Show store statistics
    Stats,
}

struct Engine {
    store: Arc<SqliteStateStore>,
    broker: Arc<SqliteMessageBroker>,
    maintenance: SqliteMaintenance,
    submission: SubmissionService,
}

async fn open_engine(db: &str, job_queue: &str) -> Result<Engine> {
    let path = shellexpand::tilde(db).into_owned();
    let url = if path.starts_with("sqlite:") {
        path
    } else {
        format!("sqlite://{path}")
    };

    let pool = PoolHandle::new(
        create_pool(&url, 2)
            .await
            .with_context(|| format!("cannot open engine database at {url}"))?,
    );
    run_migrations(&pool.current().await).await?;

    let time = Arc::new(SystemTimeProvider);
    let ids = Arc::new(UuidProvider);
    let store = Arc::new(SqliteStateStore::new(pool.clone(), time.clone()));
    let broker = Arc::new(SqliteMessageBroker::new(
        pool.clone(),
        time.clone(),
        ids.clone(),
        BrokerConfig::default(),
    ));

    let mut workflows = WorkflowRegistry::new();
    let mut handlers = HandlerRegistry::new();
    builtin::register_builtin(&mut workflows, &mut handlers);

    let submission = SubmissionService::new(
        store.clone(),
        broker.clone(),
        Arc::new(workflows),
        job_queue,
        time.clone(),
        ids,
    );
    let maintenance = SqliteMaintenance::new(pool, time);

    Ok(Engine {
        store,
        broker,
        maintenance,
        submission,
    })
}

fn status_colored(status: JobStatus) -> String {
    let text = status.to_string();
    match status {
        JobStatus::Completed => text.green().to_string(),
        JobStatus::CompletedWithErrors => text.yellow().to_string(),
        JobStatus::Failed => text.red().to_string(),
        _ => text.cyan().to_string(),
    }
}

#[derive(Tabled)]
struct TaskLine {
    stage: u32,
    index: u32,
    task_type: String,
    status: String,
    retries: i32,
    checkpoint: u32,
    queue: String,
}

#[derive(Tabled)]
struct StageLine {
    stage: u32,
    total: i64,
    succeeded: i64,
    failed: i64,
}

#[derive(Tabled)]
struct DeadLetterLine {
    message_id: String,
    deliveries: u32,
    reason: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let engine = open_engine(&cli.db, &cli.job_queue).await?;

    match cli.command {
        Commands::Submit {
            job_type,
            params,
            wait,
        } => {
            let parameters: serde_json::Value =
                serde_json::from_str(&params).context("params must be a JSON object")?;
            let receipt = engine.submission.submit(&job_type, &parameters).await?;

            match receipt.status {
                SubmissionStatus::Created => {
                    println!("{} job {}", "created".green().bold(), receipt.job_id);
                }
                SubmissionStatus::InProgress => {
                    println!(
                        "{} job {} ({})",
                        "in-progress".cyan().bold(),
                        receipt.job_id,
                        receipt.job_status
                    );
                }
                SubmissionStatus::AlreadyCompleted => {
                    println!(
                        "{} job {}",
                        "already-completed".yellow().bold(),
                        receipt.job_id
                    );
                    if let Some(result) = &receipt.result_data {
                        println!("{}", serde_json::to_string_pretty(result)?);
                    }
                    return Ok(());
                }
            }

            if wait {
                loop {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    let job = engine.submission.status(&receipt.job_id).await?;
                    if job.status.is_terminal() {
                        println!("{}", status_colored(job.status));
                        if let Some(result) = &job.result_data {
                            println!("{}", serde_json::to_string_pretty(result)?);
                        }
                        if let Some(errors) = &job.error_details {
                            eprintln!("{} {errors}", "errors:".red());
                        }
                        break;
                    }
                    println!(
                        "stage {}/{} ({})",
                        job.stage,
                        job.total_stages,
                        status_colored(job.status)
                    );
                }
            }
        }

        Commands::Status { job_id } => {
            let job = engine.submission.status(&job_id).await?;
            println!("job:      {}", job.job_id);
            println!("type:     {}", job.job_type);
            println!("status:   {}", status_colored(job.status));
            println!("stage:    {}/{}", job.stage, job.total_stages);
            if !job.stage_results.is_empty() {
                let lines: Vec<StageLine> = job
                    .stage_results
                    .iter()
                    .map(|(stage, s)| StageLine {
                        stage: *stage,
                        total: s.total,
                        succeeded: s.succeeded,
                        failed: s.failed,
                    })
                    .collect();
                println!("{}", Table::new(lines));
            }
            if let Some(result) = &job.result_data {
                println!("result:\n{}", serde_json::to_string_pretty(result)?);
            }
            if let Some(errors) = &job.error_details {
                eprintln!("{} {errors}", "errors:".red());
            }
        }

        Commands::Tasks { job_id } => {
            let tasks = engine.store.list_tasks(&job_id).await?;
            if tasks.is_empty() {
                println!("no tasks for job {job_id}");
                return Ok(());
            }
            let lines: Vec<TaskLine> = tasks
                .iter()
                .map(|t| TaskLine {
                    stage: t.stage,
                    index: t.task_index,
                    task_type: t.task_type.clone(),
                    status: t.status.to_string(),
                    retries: t.retry_count,
                    checkpoint: t.checkpoint_phase,
                    queue: t.target_queue.clone(),
                })
                .collect();
            println!("{}", Table::new(lines));
        }

        Commands::DeadLetters { queue } => {
            let parked = engine.broker.dead_letters(&queue).await?;
            if parked.is_empty() {
                println!("dead-letter queue for {queue} is empty");
                return Ok(());
            }
            let lines: Vec<DeadLetterLine> = parked
                .iter()
                .map(|m| DeadLetterLine {
                    message_id: m.message_id.clone(),
                    deliveries: m.delivery_count,
                    reason: m.reason.clone(),
                })
                .collect();
            println!("{}", Table::new(lines));
        }

        Commands::Stats => {
            let stats = engine.maintenance.get_stats().await?;
            println!("db size:             {} bytes", stats.db_size_bytes);
            println!("jobs in flight:      {}", stats.jobs_in_flight);
            println!("jobs finished:       {}", stats.jobs_finished);
            println!("tasks processing:    {}", stats.tasks_processing);
            println!("tasks checkpointed:  {}", stats.tasks_checkpointed);
            println!("queue backlog:       {}", stats.queue_backlog);
            println!("dead letters:        {}", stats.dead_letter_count);
        }
    }

    Ok(())
}
