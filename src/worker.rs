//! Bounded worker pool draining the task queue.
//!
//! Each worker owns one browser session and polls the shared queue until
//! the crawl is drained. Session calls are blocking CDP operations, so each
//! task runs on the blocking pool under a hard timeout; a task that
//! overruns it fails alone and its session is abandoned for a fresh one.
//! A metering failure flips the shared fatal flag and every worker exits on
//! its next poll; all other task errors are logged and scoped to the task
//! that hit them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::browser::PageSession;
use crate::error::CrawlError;
use crate::orchestrator::Orchestrator;
use crate::queue::TaskQueue;

const IDLE_POLL: Duration = Duration::from_millis(200);

/// Hard bound on one task: navigation, page settling, and extraction
/// included. A stuck CDP call fails only the task holding it.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(120);

/// Builds one page session per worker. Injectable so pool logic tests run
/// without a browser.
pub type SessionFactory = Arc<dyn Fn() -> Result<Box<dyn PageSession>> + Send + Sync>;

pub async fn run_pool(
    orchestrator: Arc<Orchestrator>,
    queue: Arc<TaskQueue>,
    sessions: SessionFactory,
    worker_count: usize,
    task_timeout: Duration,
) -> Result<()> {
    let fatal = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let orchestrator = orchestrator.clone();
        let queue = queue.clone();
        let sessions = sessions.clone();
        let fatal = fatal.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, orchestrator, queue, sessions, fatal, task_timeout).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    if fatal.load(Ordering::SeqCst) {
        anyhow::bail!("crawl aborted by metering failure");
    }
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<TaskQueue>,
    sessions: SessionFactory,
    fatal: Arc<AtomicBool>,
    task_timeout: Duration,
) {
    let mut session: Arc<dyn PageSession> = match sessions() {
        Ok(session) => Arc::from(session),
        Err(err) => {
            tracing::error!(worker_id, error = %err, "session launch failed, worker exiting");
            return;
        }
    };

    loop {
        if fatal.load(Ordering::SeqCst) {
            return;
        }
        let Some(task) = queue.pop() else {
            if queue.is_idle() {
                tracing::debug!(worker_id, "queue drained, worker exiting");
                return;
            }
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        let url = task.url.clone();
        let outcome = tokio::time::timeout(
            task_timeout,
            tokio::task::spawn_blocking({
                let orchestrator = orchestrator.clone();
                let session = session.clone();
                move || orchestrator.process_task(session.as_ref(), task)
            }),
        )
        .await;
        queue.task_done();

        match outcome {
            Err(_) => {
                // The blocking call may still hold the old session; abandon
                // it rather than reuse a tab in an unknown state.
                tracing::warn!(worker_id, %url, "task timed out, replacing session");
                match sessions() {
                    Ok(fresh) => session = Arc::from(fresh),
                    Err(err) => {
                        tracing::error!(worker_id, error = %err, "session relaunch failed, worker exiting");
                        return;
                    }
                }
            }
            Ok(Err(join_err)) => {
                tracing::warn!(worker_id, %url, error = %join_err, "task aborted");
            }
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(CrawlError::Metering(msg)))) => {
                tracing::error!(worker_id, %msg, "metering failure, aborting run");
                fatal.store(true, Ordering::SeqCst);
                return;
            }
            Ok(Ok(Err(err))) => {
                tracing::warn!(worker_id, %url, error = %err, "task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlInput;
    use crate::metering::{FailingMeter, NoopMeter};
    use crate::queue::{CrawlTask, TaskLabel, TaskPayload};
    use crate::records::ShardTask;
    use crate::sink::MemorySink;
    use crate::state::CrawlState;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeSession {
        pages: HashMap<String, String>,
        current: Mutex<String>,
    }

    impl PageSession for FakeSession {
        fn navigate(&self, url: &str) -> Result<()> {
            *self.current.lock().unwrap() = url.to_string();
            Ok(())
        }
        fn content(&self) -> Result<String> {
            let current = self.current.lock().unwrap();
            Ok(self.pages.get(current.as_str()).cloned().unwrap_or_default())
        }
        fn current_url(&self) -> String {
            self.current.lock().unwrap().clone()
        }
        fn evaluate(&self, _: &str, _: bool) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
        fn click_and_wait(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn rotate(&self) -> Result<()> {
            Ok(())
        }
        fn save_debug_snapshot(&self, _: &str) {}
    }

    /// Models a CDP call that never comes back within the task timeout.
    struct StallingSession;

    impl PageSession for StallingSession {
        fn navigate(&self, _: &str) -> Result<()> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }
        fn content(&self) -> Result<String> {
            Ok(String::new())
        }
        fn current_url(&self) -> String {
            String::new()
        }
        fn evaluate(&self, _: &str, _: bool) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
        fn click_and_wait(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn rotate(&self) -> Result<()> {
            Ok(())
        }
        fn save_debug_snapshot(&self, _: &str) {}
    }

    fn fixture_pages() -> HashMap<String, String> {
        let mut pages = HashMap::new();
        pages.insert(
            "https://x/s/q/homes?price_min=0&price_max=100".to_string(),
            r#"<html><head><script data-deferred-state="true" type="application/json">
            {"niobeClientData":[["q",{"results":[
                {"listing":{"id":"11","name":"First"},"structuredDisplayPrice":{"primaryLine":{"price":"$50","qualifier":"night"}}},
                {"listing":{"id":"22","name":"Second"},"structuredDisplayPrice":{"primaryLine":{"price":"$70","qualifier":"night"}}}
            ],"totalCount":2}]]}
            </script></head><body></body></html>"#
                .to_string(),
        );
        pages
    }

    fn pool_fixture(
        meter: Arc<dyn crate::metering::Meter>,
    ) -> (Arc<Orchestrator>, Arc<TaskQueue>, Arc<MemorySink>, SessionFactory) {
        let mut input = CrawlInput::default();
        input.location_queries = vec!["q".into()];
        input.fast_mode = true;
        let queue = Arc::new(TaskQueue::new());
        let state = Arc::new(CrawlState::new());
        let sink = Arc::new(MemorySink::new());
        let orchestrator = Arc::new(Orchestrator::new(
            input,
            queue.clone(),
            state,
            meter,
            sink.clone(),
        ));
        let factory: SessionFactory = Arc::new(|| {
            Ok(Box::new(FakeSession { pages: fixture_pages(), current: Mutex::new(String::new()) })
                as Box<dyn PageSession>)
        });
        (orchestrator, queue, sink, factory)
    }

    fn seed_task(queue: &TaskQueue) {
        queue.enqueue(
            CrawlTask {
                url: "https://x/s/q/homes?price_min=0&price_max=100".to_string(),
                label: TaskLabel::Search,
                payload: TaskPayload::Search(ShardTask::new(0, 100)),
            },
            false,
        );
    }

    #[tokio::test]
    async fn pool_drains_queue_and_emits() {
        let (orchestrator, queue, sink, factory) = pool_fixture(Arc::new(NoopMeter));
        seed_task(&queue);
        run_pool(orchestrator, queue.clone(), factory, 4, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(queue.is_idle());
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn metering_failure_aborts_pool() {
        let meter = Arc::new(FailingMeter { remaining: Mutex::new(1) });
        let (orchestrator, queue, _, factory) = pool_fixture(meter);
        seed_task(&queue);
        let result = run_pool(orchestrator, queue, factory, 2, Duration::from_secs(30)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stuck_task_times_out_without_stalling_pool() {
        let (orchestrator, queue, sink, _) = pool_fixture(Arc::new(NoopMeter));
        let factory: SessionFactory =
            Arc::new(|| Ok(Box::new(StallingSession) as Box<dyn PageSession>));
        seed_task(&queue);
        run_pool(orchestrator, queue.clone(), factory, 1, Duration::from_millis(50))
            .await
            .unwrap();
        // The timed-out task is dropped, the queue still drains, and no
        // record was emitted for it.
        assert!(queue.is_idle());
        assert!(sink.records().is_empty());
    }
}
