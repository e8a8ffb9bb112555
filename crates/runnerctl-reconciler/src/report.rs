use runnerctl_domain::{ImageId, RunnerId};
use serde::{Deserialize, Serialize};

/// One change the Pool Controller made (or, in a dry run, would make) during
/// a single reconcile cycle (§4.5, §8 "Pool reconciliation is a fixed
/// point").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PoolChange {
    LaunchRequested { image_id: ImageId },
    ScaleDownEnqueued { image_id: ImageId, runner_id: RunnerId },
    IdleReclaimed { runner_id: RunnerId },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolReconcileReport {
    pub changes: Vec<PoolChange>,
}

impl PoolReconcileReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fixed_point(&self) -> bool {
        self.changes.is_empty()
    }
}
