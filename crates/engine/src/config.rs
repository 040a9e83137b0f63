//! Tuning knobs for the run engine.

use std::time::Duration;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A claimed or running Run with no activity for this long is marked lost.
    pub lost_timeout: Duration,
    /// How often the background sweeper looks for lost Runs.
    pub sweep_interval: Duration,
    /// Cap applied when neither the workflow nor its project sets one.
    /// `None` means unlimited.
    pub project_concurrency: Option<u32>,
    /// Workflow queue heads fetched per page while `claim` looks for a free slot.
    pub claim_scan_limit: usize,
    /// Buffered lines per Run for slow log subscribers.
    pub log_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lost_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(30),
            project_concurrency: None,
            claim_scan_limit: 50,
            log_channel_capacity: 1024,
        }
    }
}
