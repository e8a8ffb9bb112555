//! Termination Pipeline (C7, §4.3): cleanup-script → stop → terminate →
//! confirm → metrics purge → SG GC. Every step is gated on the runner's
//! current stored state, so re-entering the pipeline (concurrent callers,
//! a resumed background task) picks up wherever the last successful step
//! left off instead of repeating cloud calls.

use std::sync::Arc;
use std::time::Duration;

use runnerctl_domain::{Runner, RunnerId, RunnerState, ScriptEvent};
use runnerctl_driver::TerminationOutcome;
use serde_json::json;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::scripts::{find_script, render};
use crate::{history, security_group};

const TERMINATE_WAIT_TIMEOUT: Duration = Duration::from_secs(100);
const MAX_STOPPING_RETRIES: u32 = 3;
const STOPPING_BACKOFF: Duration = Duration::from_secs(120);

fn is_fully_done(state: RunnerState) -> bool {
    matches!(state, RunnerState::Terminated | RunnerState::ClosedPool | RunnerState::Error)
}

/// Drives `runner_id` to `target_terminal_state` (`Terminated` for a normal
/// termination, `ClosedPool` for the idle warm-pool reclaim job, §4.6).
/// Idempotent: re-invoking on an already-terminal runner is a no-op that
/// issues no cloud call and writes no history.
pub async fn run(
    engine: &Engine,
    runner_id: RunnerId,
    initiated_by: String,
    target_terminal_state: RunnerState,
) -> Result<Runner, PipelineError> {
    let _guard = engine.locks.acquire(&runner_id).await;

    let Some(mut runner) = engine.store.get_runner(&runner_id).await? else {
        return Err(PipelineError::NotFound(format!("runner {runner_id}")));
    };

    if is_fully_done(runner.state) {
        return Ok(runner);
    }

    // Step 1: best-effort cleanup script, gated on the *pre-terminating* state.
    if runner.state.is_alive() && runner.state.should_run_terminate_script() {
        if let Err(e) = run_cleanup_script(engine, &runner).await {
            warn!(runner_id = %runner_id, error = %e, "on_terminate script failed, continuing");
            history::record(
                &engine.store,
                &runner_id,
                "terminate_script_failed",
                json!({ "error": e.to_string() }),
                &initiated_by,
            )
            .await?;
        } else {
            history::record(&engine.store, &runner_id, "terminate_script_ok", json!({}), &initiated_by)
                .await?;
        }
    }

    // Step 2: alive → terminating.
    if runner.state.is_alive() {
        runner = engine
            .store
            .conditional_update(
                &runner_id,
                runner.state,
                Box::new(|r| r.state = RunnerState::Terminating),
            )
            .await?;
        history::record(&engine.store, &runner_id, "runner_terminating", json!({}), &initiated_by).await?;
    }

    let connector_provider = resolve_provider(engine, &runner).await?;
    let driver = engine.registry.for_provider(connector_provider)?;

    // Step 3: terminating → closed (best-effort stop; failures don't block
    // the rest of the pipeline — §9 "spec codifies this as intentional").
    if runner.state == RunnerState::Terminating {
        if let Some(instance_id) = runner.cloud_instance_id.clone() {
            if let Err(e) = driver.stop_instance(&instance_id).await {
                warn!(runner_id = %runner_id, error = %e, "stop_instance failed, proceeding to terminate anyway");
            }
        }
        runner = engine
            .store
            .conditional_update(
                &runner_id,
                RunnerState::Terminating,
                Box::new(|r| r.state = RunnerState::Closed),
            )
            .await?;
        history::record(&engine.store, &runner_id, "runner_closed", json!({}), &initiated_by).await?;
    }

    // Step 4: closed → target terminal state.
    if runner.state == RunnerState::Closed {
        if let Some(instance_id) = runner.cloud_instance_id.clone() {
            driver.terminate_instance(&instance_id).await?;
            let mut outcome = driver
                .wait_terminated(&instance_id, TERMINATE_WAIT_TIMEOUT)
                .await?;
            let mut retries = 0;
            while matches!(outcome, TerminationOutcome::StillStopping) && retries < MAX_STOPPING_RETRIES {
                retries += 1;
                tokio::time::sleep(STOPPING_BACKOFF).await;
                outcome = driver.wait_terminated(&instance_id, TERMINATE_WAIT_TIMEOUT).await?;
            }
        }
        runner = engine
            .store
            .conditional_update(
                &runner_id,
                RunnerState::Closed,
                Box::new(move |r| {
                    r.state = target_terminal_state;
                    r.ended_on = Some(chrono::Utc::now());
                }),
            )
            .await?;
        history::record(
            &engine.store,
            &runner_id,
            "runner_terminated",
            json!({ "final_state": target_terminal_state.to_string() }),
            &initiated_by,
        )
        .await?;
        info!(runner_id = %runner_id, state = %target_terminal_state, "termination pipeline complete");

        // Step 5: metrics purge (best-effort).
        if let Some(ip) = &runner.public_ip {
            purge_metrics(engine, ip).await;
        }

        // Step 6: security-group reference-counted GC.
        if let Err(e) = security_group::gc_for_runner(&engine.store, &driver, &runner_id).await {
            warn!(runner_id = %runner_id, error = %e, "security group gc failed");
        }
    }

    Ok(runner)
}

async fn resolve_provider(
    engine: &Engine,
    runner: &Runner,
) -> Result<runnerctl_domain::CloudProvider, PipelineError> {
    let image = engine
        .store
        .get_image(&runner.image_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("image {}", runner.image_id)))?;
    let connector = engine
        .store
        .get_cloud_connector(&image.cloud_connector_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("cloud connector {}", image.cloud_connector_id)))?;
    Ok(connector.provider)
}

async fn run_cleanup_script(engine: &Engine, runner: &Runner) -> Result<(), PipelineError> {
    let Some(ip) = &runner.public_ip else {
        return Ok(());
    };
    let image = engine
        .store
        .get_image(&runner.image_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("image {}", runner.image_id)))?;
    let scripts = engine.store.scripts_for_image(&image.id).await?;
    let Some(script) = find_script(&scripts, ScriptEvent::OnTerminate, &image.id) else {
        return Ok(());
    };
    let connector = engine
        .store
        .get_cloud_connector(&image.cloud_connector_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("cloud connector {}", image.cloud_connector_id)))?;
    let driver = engine.registry.for_provider(connector.provider)?;
    let (_key, pem) =
        crate::key_registry::get_daily_key(&engine.store, &driver, &engine.encryption_key, &connector)
            .await?;
    let rendered = render(&script.template_body, &runner.env_data);
    let out = driver.ssh_run_script(ip, &pem, &rendered).await?;
    if !out.success() {
        return Err(PipelineError::ScriptFailed(format!(
            "on_terminate exited {}: {}",
            out.exit_code, out.stderr
        )));
    }
    Ok(())
}

async fn purge_metrics(engine: &Engine, runner_ip: &str) {
    let Some(base) = &engine.config.prometheus_pushgateway_url else {
        return;
    };
    let url = format!("{base}/metrics/job/{runner_ip}");
    match engine.http.delete(&url).send().await {
        Ok(resp) if resp.status().as_u16() == 200 || resp.status().as_u16() == 202 => {}
        Ok(resp) => warn!(status = %resp.status(), url, "metrics purge returned unexpected status"),
        Err(e) => warn!(error = %e, url, "metrics purge request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use runnerctl_domain::{
        CloudConnector, CloudConnectorId, CloudProvider, Image, ImageId, ImageStatus, MachineId,
    };
    use runnerctl_driver::{DriverRegistry, LocalDriver};
    use runnerctl_store::InMemoryStore;

    fn test_engine() -> (Engine, CloudConnectorId, ImageId) {
        let store: Arc<dyn runnerctl_store::RunnerStore> = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        registry.register(CloudProvider::Local, Arc::new(LocalDriver::new()));
        let engine = Engine::new(
            store,
            Arc::new(registry),
            runnerctl_crypto::EncryptionKey::from_str("0123456789abcdef").unwrap(),
            EngineConfig::default(),
        );
        (engine, CloudConnectorId::new("conn-1"), ImageId::new("img-1"))
    }

    async fn seed_image_and_connector(engine: &Engine, image_id: &ImageId, connector_id: &CloudConnectorId) {
        engine
            .store
            .upsert_cloud_connector(&CloudConnector {
                id: connector_id.clone(),
                provider: CloudProvider::Local,
                region: "local".into(),
                encrypted_access_key: String::new(),
                encrypted_secret_key: String::new(),
            })
            .await
            .unwrap();
        engine
            .store
            .upsert_image(&Image {
                id: image_id.clone(),
                identifier: "ubuntu-22-04".into(),
                machine_id: MachineId::new("m1"),
                cloud_connector_id: connector_id.clone(),
                pool_size: 1,
                status: ImageStatus::Active,
                tags: vec![],
            })
            .await
            .unwrap();
    }

    async fn seed_running_runner(engine: &Engine, image_id: &ImageId, state: RunnerState) -> Runner {
        let driver = engine.registry.for_provider(CloudProvider::Local).unwrap();
        let instance_id = driver
            .create_instance("key-0", "ubuntu-22-04", "m1", &[], &Default::default())
            .await
            .unwrap();
        driver.wait_running(&instance_id).await.unwrap();
        let now = chrono::Utc::now();
        let runner = Runner {
            id: RunnerId::new(uuid::Uuid::new_v4().to_string()),
            cloud_instance_id: Some(instance_id),
            external_hash: "h".into(),
            image_id: image_id.clone(),
            machine_id: MachineId::new("m1"),
            key_id: None,
            user_id: None,
            state,
            public_ip: Some("10.0.0.5".into()),
            user_ip: None,
            lifecycle_token: None,
            terminal_token: None,
            session_start: None,
            session_end: None,
            ended_on: None,
            env_data: Default::default(),
            created_at: now,
            updated_on: now,
        };
        engine.store.insert_runner(&runner).await.unwrap();
        runner
    }

    #[tokio::test]
    async fn drives_an_active_runner_to_terminated() {
        let (engine, connector_id, image_id) = test_engine();
        seed_image_and_connector(&engine, &image_id, &connector_id).await;
        let runner = seed_running_runner(&engine, &image_id, RunnerState::Active).await;

        let terminated = run(&engine, runner.id.clone(), "user-1".into(), RunnerState::Terminated)
            .await
            .unwrap();

        assert_eq!(terminated.state, RunnerState::Terminated);
        assert!(terminated.ended_on.is_some());
    }

    #[tokio::test]
    async fn is_a_no_op_on_an_already_terminated_runner() {
        let (engine, connector_id, image_id) = test_engine();
        seed_image_and_connector(&engine, &image_id, &connector_id).await;
        let runner = seed_running_runner(&engine, &image_id, RunnerState::Terminated).await;

        let result = run(&engine, runner.id.clone(), "user-1".into(), RunnerState::Terminated)
            .await
            .unwrap();

        assert_eq!(result.state, RunnerState::Terminated);
        assert!(engine.store.list_history(&runner.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_reclaim_targets_closed_pool_instead_of_terminated() {
        let (engine, connector_id, image_id) = test_engine();
        seed_image_and_connector(&engine, &image_id, &connector_id).await;
        let runner = seed_running_runner(&engine, &image_id, RunnerState::Ready).await;

        let reclaimed = run(&engine, runner.id.clone(), "idle-pool-job".into(), RunnerState::ClosedPool)
            .await
            .unwrap();

        assert_eq!(reclaimed.state, RunnerState::ClosedPool);
    }
}
