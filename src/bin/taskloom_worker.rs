use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taskloom::config::EngineConfig;
use taskloom::definition::loader::load_pipeline_dir;
use taskloom::runtime::engine::Engine;
use taskloom::runtime::lifecycle::{OutputUpload, WorkerResult};
use taskloom::runtime::redis_storage::{RedisAssignmentFeed, RedisBacking};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
    redis: String,

    /// Key prefix shared with the dispatcher
    #[arg(long, default_value = "taskloom")]
    prefix: String,

    /// Worker name, reported back with every result
    #[arg(long, default_value = "worker")]
    name: String,

    /// Directory of pipeline YAML files (must match the dispatcher's)
    #[arg(long)]
    pipelines: PathBuf,

    /// Simulated execution time per task, in milliseconds
    #[arg(long, default_value_t = 200)]
    work_millis: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    info!("[{}] Starting worker, redis: {}", args.name, args.redis);

    let client = redis::Client::open(args.redis.clone()).context("invalid redis URL")?;
    let stores = RedisBacking::stores(client.clone(), args.prefix.clone());
    let engine = Engine::new(EngineConfig::default(), stores);

    for definition in load_pipeline_dir(&args.pipelines)? {
        engine.register_pipeline(definition);
    }

    let runner = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Engine loop failed: {}", e);
        }
    });

    let feed = RedisAssignmentFeed::new(client, format!("{}:assign", args.prefix));
    info!("[{}] Ready, waiting for tasks", args.name);

    loop {
        let task_id = match feed.pop().await {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                error!("Feed pop failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if let Err(e) = engine.report_transfer_started(task_id).await {
            warn!(task_id = %task_id, "Task gone before pickup: {}", e);
            continue;
        }
        info!(task_id = %task_id, "Executing");

        // Simulated execution. A real worker would run the process binary
        // and stream its declared outputs to storage here.
        tokio::time::sleep(Duration::from_millis(args.work_millis)).await;

        let result = WorkerResult {
            task_id,
            success: true,
            retryable: false,
            worker_id: args.name.clone(),
            outputs: Vec::<OutputUpload>::new(),
        };
        if let Err(e) = engine.report_worker_result(result).await {
            error!(task_id = %task_id, "Result report failed: {}", e);
        } else {
            info!(task_id = %task_id, "Done");
        }
    }
}
