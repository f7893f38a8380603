use thiserror::Error;

/// Failure taxonomy for a crawl run. Extraction misses are never errors —
/// they surface as unset fields and are handled by fallback chains.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Anti-bot challenge detected in rendered content. Recovered by
    /// retiring the browser session and retrying under a new one.
    #[error("blocked by anti-bot challenge")]
    Blocked,

    /// Navigation or page-load failure. Scoped to one task, never retried
    /// beyond the task boundary.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Metering failure (credits exhausted or billing API error). Fatal to
    /// the entire run, no partial credit.
    #[error("metering failure: {0}")]
    Metering(String),
}
