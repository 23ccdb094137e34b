use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskloom::config::EngineConfig;
use taskloom::definition::loader::{load_pipeline, load_pipeline_dir};
use taskloom::runtime::engine::Engine;
use taskloom::runtime::lifecycle::WorkerResult;
use taskloom::runtime::redis_storage::{RedisAssignmentFeed, RedisBacking};
use taskloom::runtime::storage::Stores;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline end to end in memory, with an inline worker
    Run {
        /// Path to the pipeline YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Tenant the instance is created for
        #[arg(long, default_value = "local")]
        tenant: String,
    },

    /// Start the dispatcher against Redis and feed workers over a task list
    Serve {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Key prefix for all dispatcher state
        #[arg(long, default_value = "taskloom")]
        prefix: String,

        /// Directory of pipeline YAML files to register
        #[arg(long)]
        pipelines: PathBuf,
    },

    /// Create and start an instance against a running dispatcher's Redis
    Submit {
        /// Path to the pipeline YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Key prefix for all dispatcher state
        #[arg(long, default_value = "taskloom")]
        prefix: String,

        /// Tenant the instance is created for
        #[arg(long, default_value = "default")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, tenant } => run_standalone(file, tenant).await,
        Commands::Serve { redis, prefix, pipelines } => serve(redis, prefix, pipelines).await,
        Commands::Submit { file, redis, prefix, tenant } => {
            submit(file, redis, prefix, tenant).await
        }
    }
}

/// Standalone mode: everything in one process, results reported by an
/// inline worker that succeeds every task. Cache checks come back as
/// misses since no cache backend is attached.
async fn run_standalone(file: PathBuf, tenant: String) -> Result<()> {
    info!("Running in standalone memory mode");
    let engine = Engine::new(EngineConfig::default(), Stores::in_memory());

    let definition = load_pipeline(&file)?;
    let pipeline_id = definition.id.clone();
    engine.register_pipeline(definition);

    let runner = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Dispatcher loop failed: {}", e);
        }
    });

    let instance_id = engine.create_and_start(&pipeline_id, &tenant).await?;
    info!(instance_id = %instance_id, "Instance started");

    loop {
        for entry in engine.eligible_tasks(instance_id) {
            let task = match engine.claim_task(entry.task_id, "inline").await {
                Ok(t) => t,
                Err(_) => continue, // raced with another pass
            };
            engine.report_transfer_started(task.id).await?;
            engine
                .report_worker_result(WorkerResult {
                    task_id: task.id,
                    success: true,
                    retryable: false,
                    worker_id: "inline".to_string(),
                    outputs: Vec::new(),
                })
                .await?;
            info!(task_id = %task.id, process = %task.process_code, "Task done");
        }
        for entry in engine.queued_cache_checks(instance_id) {
            engine.report_cache_result(entry.task_id, false).await?;
        }

        match engine.instance(instance_id).await? {
            Some(instance) if instance.state.is_terminal() => {
                info!(state = ?instance.state, "Instance finished");
                break;
            }
            Some(_) => {}
            None => break,
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn serve(redis: String, prefix: String, pipelines: PathBuf) -> Result<()> {
    info!("Starting dispatcher, redis: {}", redis);
    let client = redis::Client::open(redis).context("invalid redis URL")?;
    let stores = RedisBacking::stores(client.clone(), prefix.clone());
    let engine = Engine::new(EngineConfig::default(), stores);

    let definitions = load_pipeline_dir(&pipelines)?;
    let registered = definitions.len();
    for definition in definitions {
        info!(pipeline = %definition.id, "Registered pipeline");
        engine.register_pipeline(definition);
    }
    info!("Dispatcher ready, {} pipelines registered", registered);

    let runner = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Dispatcher loop failed: {}", e);
        }
    });

    // Forward freshly queued tasks onto the shared worker feed. No cache
    // backend is attached in serve mode, so cache checks come back misses.
    let feed = RedisAssignmentFeed::new(client, format!("{}:assign", prefix));
    let mut pushed: HashSet<Uuid> = HashSet::new();
    loop {
        match engine.started_instances().await {
            Ok(instances) => {
                for instance in instances {
                    for entry in engine.eligible_tasks(instance.id) {
                        if pushed.insert(entry.task_id) {
                            if let Err(e) = feed.push(entry.task_id).await {
                                error!(task_id = %entry.task_id, "Feed push failed: {}", e);
                                pushed.remove(&entry.task_id);
                            }
                        }
                    }
                    for entry in engine.queued_cache_checks(instance.id) {
                        if let Err(e) = engine.report_cache_result(entry.task_id, false).await {
                            error!(task_id = %entry.task_id, "Cache miss report failed: {}", e);
                        }
                    }
                }
            }
            Err(e) => error!("Instance scan failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn submit(file: PathBuf, redis: String, prefix: String, tenant: String) -> Result<()> {
    let client = redis::Client::open(redis).context("invalid redis URL")?;
    let stores = RedisBacking::stores(client, prefix);
    let engine = Engine::new(EngineConfig::default(), stores);

    let definition = load_pipeline(&file)?;
    let pipeline_id = definition.id.clone();
    engine.register_pipeline(definition);

    let instance_id = engine.create_and_start(&pipeline_id, &tenant).await?;
    info!(instance_id = %instance_id, "Instance submitted");
    println!("{}", instance_id);
    Ok(())
}
