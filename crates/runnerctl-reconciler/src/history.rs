//! Append-only history writes (§3 RunnerHistory). Never influences state —
//! every call here is a fire-and-persist observation.

use std::sync::Arc;

use runnerctl_domain::{RunnerHistory, RunnerId};
use runnerctl_store::RunnerStore;
use serde_json::Value;

use crate::error::PipelineError;

pub async fn record(
    store: &Arc<dyn RunnerStore>,
    runner_id: &RunnerId,
    event_name: &str,
    event_data: Value,
    created_by: &str,
) -> Result<(), PipelineError> {
    let entry = RunnerHistory {
        id: uuid::Uuid::new_v4(),
        runner_id: runner_id.clone(),
        event_name: event_name.to_string(),
        event_data,
        created_by: created_by.to_string(),
        created_at: chrono::Utc::now(),
    };
    store.insert_history(&entry).await?;
    Ok(())
}
