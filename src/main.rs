mod browser;
mod config;
mod detail;
mod error;
mod locator;
mod metering;
mod normalize;
mod orchestrator;
mod queue;
mod records;
mod search;
mod shard;
mod sink;
mod state;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::browser::{ChromeSession, PageSession};
use crate::config::CrawlInput;
use crate::metering::{LogMeter, Meter};
use crate::orchestrator::Orchestrator;
use crate::queue::TaskQueue;
use crate::sink::JsonlSink;
use crate::state::CrawlState;
use crate::worker::SessionFactory;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let input = CrawlInput::load()?;
    let shard_step = match input.price_shard_step {
        Some(step) => step,
        None => config::derive_shard_step(&input.currency).await,
    };
    tracing::info!(
        currency = %input.currency,
        shard_step,
        fast_mode = input.fast_mode,
        target = ?input.target(),
        "starting crawl"
    );

    let output_path = std::env::var("OUTPUT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("dataset/results.jsonl"));
    let sink = Arc::new(JsonlSink::open(&output_path)?);

    let queue = Arc::new(TaskQueue::new());
    let state = Arc::new(CrawlState::new());
    let meter = Arc::new(LogMeter::new());

    let worker_count = input.max_concurrency.max(1);
    let orchestrator = Arc::new(Orchestrator::new(
        input,
        queue.clone(),
        state.clone(),
        meter.clone() as Arc<dyn Meter>,
        sink,
    ));
    orchestrator.seed_initial_tasks(shard_step);

    let sessions: SessionFactory =
        Arc::new(|| ChromeSession::launch().map(|s| Box::new(s) as Box<dyn PageSession>));
    worker::run_pool(orchestrator, queue, sessions, worker_count, worker::TASK_TIMEOUT).await?;

    let snapshot = state.snapshot();
    tracing::info!(
        scraped = snapshot.scraped_count,
        pushed = snapshot.pushed_count,
        seen = snapshot.seen_count,
        output = %output_path.display(),
        "crawl finished"
    );
    for (event, total) in meter.totals() {
        tracing::info!(event = %event, total, "charged events");
    }
    Ok(())
}
