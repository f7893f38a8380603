//! Per-event billing port.
//!
//! The orchestrator charges at defined decision points: one event per
//! emitted record, per in-page duplicate, per skipped id (skips still cost,
//! preventing free probing), and one per enabled enrichment category on a
//! detail emit. A metering failure aborts the entire run with no partial
//! credit, so `charge` is the only call allowed to surface
//! [`CrawlError::Metering`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::CrawlError;

pub const EVENT_LISTING_PUSHED: &str = "listing-pushed";
pub const EVENT_DUPLICATE: &str = "duplicate-listing";
pub const EVENT_SKIPPED: &str = "skipped-listing";
pub const EVENT_DETAIL_IMAGES: &str = "detail-images";
pub const EVENT_DETAIL_REVIEWS: &str = "detail-reviews";
pub const EVENT_DETAIL_EXTRAS: &str = "detail-extras";
pub const EVENT_DETAIL_HOST: &str = "detail-host";

pub trait Meter: Send + Sync {
    /// Charge `count` units of `event`. Called synchronously at orchestrator
    /// decision points; an error here is fatal to the run.
    fn charge(&self, event: &str, count: u64) -> Result<(), CrawlError>;
}

/// Default meter: accumulates totals and logs them. Stands in for the
/// platform billing API; swap the implementation, keep the call sites.
#[derive(Debug, Default)]
pub struct LogMeter {
    totals: Mutex<HashMap<String, u64>>,
}

impl LogMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> HashMap<String, u64> {
        self.totals.lock().unwrap().clone()
    }
}

impl Meter for LogMeter {
    fn charge(&self, event: &str, count: u64) -> Result<(), CrawlError> {
        if count == 0 {
            return Ok(());
        }
        let mut totals = self.totals.lock().unwrap();
        *totals.entry(event.to_string()).or_insert(0) += count;
        tracing::debug!(event, count, "charged");
        Ok(())
    }
}

/// No-op meter for core-logic tests.
#[derive(Debug, Default)]
pub struct NoopMeter;

impl Meter for NoopMeter {
    fn charge(&self, _event: &str, _count: u64) -> Result<(), CrawlError> {
        Ok(())
    }
}

/// Test meter that fails after a credit limit, modelling exhausted credits.
#[cfg(test)]
pub struct FailingMeter {
    pub remaining: Mutex<u64>,
}

#[cfg(test)]
impl Meter for FailingMeter {
    fn charge(&self, event: &str, count: u64) -> Result<(), CrawlError> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining < count {
            return Err(CrawlError::Metering(format!("credits exhausted at {event}")));
        }
        *remaining -= count;
        Ok(())
    }
}
