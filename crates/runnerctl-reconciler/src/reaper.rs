//! Expiry Reaper (C10, §4.6): sweeps runners whose session has outlived
//! `session_end` and hands them to the Termination Pipeline.

use chrono::Utc;
use runnerctl_domain::RunnerState;
use serde_json::json;
use tracing::warn;

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::history;
use crate::termination;

/// One sweep. Returns the runner ids enqueued for termination this cycle.
pub async fn reap_expired(engine: &Engine) -> Result<Vec<runnerctl_domain::RunnerId>, PipelineError> {
    let now = Utc::now();
    let expired = engine.store.list_expired(now).await?;
    let initiated_by = format!("cleanup_job_{}", now.timestamp());
    let mut enqueued = Vec::with_capacity(expired.len());

    for runner in expired {
        // Non-alive or already-`ready`/`closed` runners never reach
        // `list_expired` (the store filters on alive state), but a `ready`
        // runner past its session belongs to the idle-pool job, not the
        // reaper — guard against a future store change quietly widening the
        // filter.
        if matches!(runner.state, RunnerState::Ready | RunnerState::Closed | RunnerState::Terminated) {
            continue;
        }

        let minutes_expired = runner
            .session_end
            .map(|end| (now - end).num_minutes())
            .unwrap_or(0);
        history::record(
            &engine.store,
            &runner.id,
            "session_expired",
            json!({ "minutes_expired": minutes_expired }),
            &initiated_by,
        )
        .await?;

        enqueued.push(runner.id.clone());
        let engine = engine.clone();
        let initiated_by = initiated_by.clone();
        tokio::spawn(async move {
            if let Err(e) = termination::run(&engine, runner.id.clone(), initiated_by, RunnerState::Terminated).await
            {
                warn!(runner_id = %runner.id, error = %e, "expiry reaper termination failed");
            }
        });
    }

    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use runnerctl_domain::{MachineId, Runner, RunnerId, RunnerState};
    use runnerctl_driver::{DriverRegistry, LocalDriver};
    use runnerctl_store::{InMemoryStore, RunnerStore};
    use std::sync::Arc;

    fn expired_runner(id: &str) -> Runner {
        let now = Utc::now();
        Runner {
            id: RunnerId::new(id),
            cloud_instance_id: Some("i-1".into()),
            external_hash: "h".into(),
            image_id: runnerctl_domain::ImageId::new("img-1"),
            machine_id: MachineId::new("m1"),
            key_id: None,
            user_id: None,
            state: RunnerState::Active,
            public_ip: Some("10.0.0.1".into()),
            user_ip: None,
            lifecycle_token: None,
            terminal_token: None,
            session_start: Some(now - chrono::Duration::hours(2)),
            session_end: Some(now - chrono::Duration::minutes(30)),
            ended_on: None,
            env_data: Default::default(),
            created_at: now - chrono::Duration::hours(2),
            updated_on: now - chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn sweeps_runners_past_their_session_end() {
        let store: Arc<dyn RunnerStore> = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        registry.register(runnerctl_domain::CloudProvider::Local, Arc::new(LocalDriver::new()));
        let engine = Engine::new(
            store,
            Arc::new(registry),
            runnerctl_crypto::EncryptionKey::from_str("0123456789abcdef").unwrap(),
            EngineConfig::default(),
        );
        let r = expired_runner("r1");
        engine.store.insert_runner(&r).await.unwrap();

        let enqueued = reap_expired(&engine).await.unwrap();
        assert_eq!(enqueued, vec![RunnerId::new("r1")]);

        let history = engine.store.list_history(&RunnerId::new("r1")).await.unwrap();
        assert!(history.iter().any(|h| h.event_name == "session_expired"));
    }

    #[tokio::test]
    async fn runners_not_yet_expired_are_left_alone() {
        let store: Arc<dyn RunnerStore> = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        registry.register(runnerctl_domain::CloudProvider::Local, Arc::new(LocalDriver::new()));
        let engine = Engine::new(
            store,
            Arc::new(registry),
            runnerctl_crypto::EncryptionKey::from_str("0123456789abcdef").unwrap(),
            EngineConfig::default(),
        );
        let mut r = expired_runner("r1");
        r.session_end = Some(Utc::now() + chrono::Duration::hours(1));
        engine.store.insert_runner(&r).await.unwrap();

        let enqueued = reap_expired(&engine).await.unwrap();
        assert!(enqueued.is_empty());
    }
}
