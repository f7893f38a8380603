//! In-process task queue for page-visit tasks.
//!
//! Detail visits are enqueued at high priority so claimed listings are
//! drained before new search pages fan out more work. The queue also tracks
//! in-flight tasks so the worker pool can tell an empty queue from a
//! finished crawl.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::records::{ListingSummary, ShardTask};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TaskLabel {
    Search,
    Detail,
}

/// Task-scoped payload; never reaches the output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskPayload {
    Search(ShardTask),
    Detail { summary: ListingSummary },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub url: String,
    pub label: TaskLabel,
    pub payload: TaskPayload,
}

#[derive(Debug, Default)]
struct QueueInner {
    high: VecDeque<CrawlTask>,
    normal: VecDeque<CrawlTask>,
    in_flight: usize,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: CrawlTask, high_priority: bool) {
        let mut inner = self.inner.lock().unwrap();
        if high_priority {
            inner.high.push_back(task);
        } else {
            inner.normal.push_back(task);
        }
    }

    /// Pop the next task, high-priority class first. The task counts as
    /// in-flight until [`TaskQueue::task_done`] is called.
    pub fn pop(&self) -> Option<CrawlTask> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.high.pop_front().or_else(|| inner.normal.pop_front());
        if task.is_some() {
            inner.in_flight += 1;
        }
        task
    }

    pub fn task_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// True when nothing is queued and nothing is in flight — the crawl is
    /// drained and workers can exit.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.high.is_empty() && inner.normal.is_empty() && inner.in_flight == 0
    }

    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.high.len() + inner.normal.len() + inner.in_flight
    }
}
