use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use corral::{
    DefineOptions, JobProcessor, JobRecord, JobRegistry, JobRepository, JobStore, MemoryStore,
    ProcessorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(about = "Persistent job scheduler worker (in-memory demo)")]
struct Args {
    /// Queue name, used in logs and the status snapshot
    #[arg(long, default_value = "demo")]
    queue: String,

    /// Discovery scan cadence in milliseconds
    #[arg(long, default_value = "1000")]
    process_every_ms: u64,

    /// Maximum number of handlers running at once
    #[arg(long, default_value = "20")]
    max_concurrency: usize,

    /// How many greeting jobs to seed
    #[arg(long, default_value = "10")]
    seed_jobs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(JobRepository::new(
        Arc::clone(&store) as Arc<dyn JobStore>
    ));

    let registry = Arc::new(JobRegistry::new());
    registry.define_fn("greet", DefineOptions::default(), |job| async move {
        tracing::info!(job_id = %job.id(), data = %job.data(), "hello from the greet handler");
        Ok(())
    });
    registry.define_fn(
        "heartbeat",
        DefineOptions {
            lock_lifetime: Duration::from_secs(30),
            ..Default::default()
        },
        |job| async move {
            job.touch(Some(100)).await?;
            tracing::info!(job_id = %job.id(), "heartbeat");
            Ok(())
        },
    );

    for n in 0..args.seed_jobs {
        repository
            .save_new(JobRecord::new("greet", serde_json::json!({ "n": n })))
            .await?;
    }
    repository
        .save_new(
            JobRecord::single("heartbeat", serde_json::Value::Null)
                .repeat_every(Duration::from_secs(2)),
        )
        .await?;

    let config = ProcessorConfig::new(args.queue)
        .with_process_every(Duration::from_millis(args.process_every_ms))
        .with_max_concurrency(args.max_concurrency);
    let processor = Arc::new(JobProcessor::new(registry, Arc::clone(&repository), config));
    processor.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    let claimed = processor.stop();
    let ids: Vec<_> = claimed.iter().map(|job| job.id()).collect();
    repository.release_many(&ids).await?;

    println!("{}", serde_json::to_string_pretty(&processor.status(true))?);
    Ok(())
}
