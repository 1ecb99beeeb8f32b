use serde::{Deserialize, Serialize};

/// What to do with an image that completes while an earlier one is still being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Start another request; the single outbound slot rejects whichever audio loses the race.
    Concurrent,
    /// Drop the new image.
    DropWhileBusy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub concurrency: ConcurrencyPolicy,
    /// How long the host keeps a background lease before revoking it.
    pub lease_budget_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            concurrency: ConcurrencyPolicy::Concurrent,
            lease_budget_secs: 30,
        }
    }
}
