//! Process-lifetime crawl state shared across worker tasks.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct StateInner {
    scraped_count: u64,
    pushed_count: u64,
    seen_listing_ids: HashSet<String>,
}

/// Global counters and the seen-id set. The seen-set grows monotonically
/// within a run; [`CrawlState::reset`] exists only for test isolation.
#[derive(Debug, Default)]
pub struct CrawlState {
    inner: Mutex<StateInner>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    pub scraped_count: u64,
    pub pushed_count: u64,
    pub seen_count: u64,
}

impl CrawlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-claim of a listing id. Two concurrent tasks from
    /// overlapping shard boundaries can race on the same id; the single
    /// locked insert guarantees exactly one of them wins.
    pub fn claim(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.seen_listing_ids.insert(id.to_string())
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.inner.lock().unwrap().seen_listing_ids.contains(id)
    }

    /// Count a claimed listing toward the scrape target. Returns the new
    /// total.
    pub fn record_scraped(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.scraped_count += 1;
        inner.scraped_count
    }

    pub fn record_pushed(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.pushed_count += 1;
        inner.pushed_count
    }

    /// Whether the global target is met. `None` (or zero, normalized by the
    /// config layer) means unlimited.
    pub fn target_met(&self, target: Option<u64>) -> bool {
        match target {
            Some(t) => self.inner.lock().unwrap().scraped_count >= t,
            None => false,
        }
    }

    pub fn push_target_met(&self, target: Option<u64>) -> bool {
        match target {
            Some(t) => self.inner.lock().unwrap().pushed_count >= t,
            None => false,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        StateSnapshot {
            scraped_count: inner.scraped_count,
            pushed_count: inner.pushed_count,
            seen_count: inner.seen_listing_ids.len() as u64,
        }
    }

    /// Test isolation only — a live run never loses seen-set members.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = StateInner::default();
    }
}
