//! Readiness Pipeline (C6, §4.2): wait_running → assign_ip → liveness_probe
//! → bootstrap_scripts → finalize. Each stage is conditional on the
//! runner's stored state (idempotent re-entry), appends a history record,
//! and emits a typed event under the runner's lifecycle token if it has
//! one (pool-replenishment launches usually don't).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use runnerctl_domain::{CloudConnector, Image, Runner, RunnerId, RunnerState, Script, ScriptEvent};
use runnerctl_events::{Event, EventKind};
use serde_json::json;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::scripts::{find_script, render};
use crate::{history, key_registry, termination};

const IP_POLL_RETRIES: u32 = 5;
const IP_POLL_SPACING: Duration = Duration::from_secs(2);
const SSH_PROBE_BUDGET: Duration = Duration::from_secs(60);
const SSH_PROBE_SPACING: Duration = Duration::from_secs(1);

async fn emit(engine: &Engine, runner: &Runner, kind: EventKind, message: impl Into<String>) {
    if let Some(token) = &runner.lifecycle_token {
        engine.bus.emit(token, Event::new(kind, message)).await;
    }
}

/// Drives `runner_id` from `runner_starting[_claimed]` through to
/// `ready`/`ready_claimed`. On any stage failure, transitions the runner to
/// `error`, emits a terminal `ERROR` event, and enqueues termination.
pub async fn run(
    engine: &Engine,
    runner_id: RunnerId,
    image: Image,
    connector: CloudConnector,
    scripts: Vec<Script>,
    initiated_by: String,
) -> Result<Runner, PipelineError> {
    let _guard = engine.locks.acquire(&runner_id).await;

    match run_inner(engine, &runner_id, &image, &connector, &scripts).await {
        Ok(runner) => Ok(runner),
        Err(e) => {
            warn!(runner_id = %runner_id, error = %e, "readiness pipeline failed");
            if let Ok(Some(runner)) = engine.store.get_runner(&runner_id).await {
                let _ = history::record(
                    &engine.store,
                    &runner_id,
                    "runner_provisioning_failed",
                    json!({ "error": e.to_string() }),
                    &initiated_by,
                )
                .await;
                emit(engine, &runner, EventKind::Error, e.to_string()).await;
                // Tear the cloud instance (and its security group) down
                // *while the runner is still alive*, landing on `Error` as
                // the termination pipeline's final state. Marking `Error`
                // first and terminating second would have the termination
                // pipeline see an already-terminal runner and no-op out
                // (`termination::is_fully_done`), leaking the instance.
                drop(_guard);
                let _ = termination::run(engine, runner.id.clone(), initiated_by, RunnerState::Error).await;
            }
            Err(e)
        }
    }
}

async fn run_inner(
    engine: &Engine,
    runner_id: &RunnerId,
    image: &Image,
    connector: &CloudConnector,
    scripts: &[Script],
) -> Result<Runner, PipelineError> {
    let runner = engine
        .store
        .get_runner(runner_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("runner {runner_id}")))?;
    let instance_id = runner
        .cloud_instance_id
        .clone()
        .ok_or_else(|| PipelineError::Internal("runner has no cloud instance id".into()))?;
    let driver = engine.registry.for_provider(connector.provider)?;

    emit(engine, &runner, EventKind::InstanceBooting, "instance requested").await;

    // ── wait_running ──────────────────────────────────────────────────
    emit(engine, &runner, EventKind::InstanceStarting, "waiting for instance to run").await;
    driver.wait_running(&instance_id).await?;
    history::record(&engine.store, runner_id, "instance_running", json!({}), "system").await?;
    emit(engine, &runner, EventKind::InstanceRunning, "instance is running").await;

    // ── assign_ip ─────────────────────────────────────────────────────
    emit(engine, &runner, EventKind::InstanceIpAssigning, "polling for a public IP").await;
    let ip = poll_for_ip(driver.as_ref(), &instance_id).await?;
    let runner = engine
        .store
        .conditional_update(runner_id, runner.state, Box::new({
            let ip = ip.clone();
            move |r| r.public_ip = Some(ip)
        }))
        .await?;
    history::record(&engine.store, runner_id, "ip_assigned", json!({ "ip": ip }), "system").await?;
    emit(engine, &runner, EventKind::InstanceIpAssigned, "public ip assigned")
        .await;

    // ── liveness_probe ────────────────────────────────────────────────
    emit(engine, &runner, EventKind::InstanceSshWaiting, "waiting for ssh + app liveness").await;
    let (_key, private_key_pem) =
        key_registry::get_daily_key(&engine.store, &driver, &engine.encryption_key, connector)
            .await?;
    probe_liveness(driver.as_ref(), &ip, &private_key_pem).await?;
    history::record(&engine.store, runner_id, "ssh_alive", json!({}), "system").await?;
    emit(engine, &runner, EventKind::InstanceSshAvailable, "ssh and app are reachable").await;

    // ── bootstrap_scripts ─────────────────────────────────────────────
    emit(
        engine,
        &runner,
        EventKind::InstanceStartupProcessStarted,
        "running bootstrap scripts",
    )
    .await;
    match run_bootstrap(driver.as_ref(), &ip, &private_key_pem, &runner, image, scripts).await {
        Ok(()) => {
            history::record(&engine.store, runner_id, "bootstrap_ok", json!({}), "system").await?;
            emit(
                engine,
                &runner,
                EventKind::InstanceStartupProcessComplete,
                "bootstrap complete",
            )
            .await;
        }
        Err(e) => {
            history::record(
                &engine.store,
                runner_id,
                "bootstrap_failed",
                json!({ "error": e.to_string() }),
                "system",
            )
            .await?;
            emit(
                engine,
                &runner,
                EventKind::InstanceStartupProcessFailed,
                e.to_string(),
            )
            .await;
            return Err(e);
        }
    }

    // ── finalize ──────────────────────────────────────────────────────
    let final_state = match runner.state {
        RunnerState::RunnerStartingClaimed => RunnerState::ReadyClaimed,
        _ => RunnerState::Ready,
    };
    let runner = engine
        .store
        .conditional_update(
            runner_id,
            runner.state,
            Box::new(move |r| r.state = final_state),
        )
        .await?;
    history::record(
        &engine.store,
        runner_id,
        "runner_ready",
        json!({ "state": final_state.to_string() }),
        "system",
    )
    .await?;
    emit(engine, &runner, EventKind::RunnerReady, "runner is ready").await;
    info!(runner_id = %runner_id, state = %final_state, "readiness pipeline complete");
    Ok(runner)
}

async fn poll_for_ip(
    driver: &dyn runnerctl_driver::Driver,
    instance_id: &str,
) -> Result<String, PipelineError> {
    for attempt in 0..IP_POLL_RETRIES {
        match driver.describe_ip(instance_id).await? {
            runnerctl_driver::IpStatus::Assigned(ip) if ip.parse::<std::net::Ipv4Addr>().is_ok() => {
                return Ok(ip)
            }
            runnerctl_driver::IpStatus::Assigned(_) | runnerctl_driver::IpStatus::Pending => {
                if attempt + 1 < IP_POLL_RETRIES {
                    tokio::time::sleep(IP_POLL_SPACING).await;
                }
            }
        }
    }
    Err(PipelineError::ProvisioningFailed(format!(
        "instance {instance_id} did not report a valid IPv4 address within {IP_POLL_RETRIES} polls"
    )))
}

async fn probe_liveness(
    driver: &dyn runnerctl_driver::Driver,
    ip: &str,
    private_key_pem: &str,
) -> Result<(), PipelineError> {
    let deadline = tokio::time::Instant::now() + SSH_PROBE_BUDGET;
    loop {
        let probe = "curl --max-time 5 localhost:3000";
        match driver.ssh_run_script(ip, private_key_pem, probe).await {
            Ok(out) if out.stdout.trim() == "OK" => return Ok(()),
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PipelineError::ProvisioningFailed(format!(
                "ssh/app liveness probe against {ip} did not succeed within {SSH_PROBE_BUDGET:?}"
            )));
        }
        tokio::time::sleep(SSH_PROBE_SPACING).await;
    }
}

async fn run_bootstrap(
    driver: &dyn runnerctl_driver::Driver,
    ip: &str,
    private_key_pem: &str,
    runner: &Runner,
    image: &Image,
    scripts: &[Script],
) -> Result<(), PipelineError> {
    let context: HashMap<String, String> = runner.env_data.clone();

    if let Some(script) = find_script(scripts, ScriptEvent::MetricsAgent, &image.id) {
        let rendered = render(&script.template_body, &context);
        if let Err(e) = driver.ssh_run_script(ip, private_key_pem, &rendered).await {
            warn!(runner_id = %runner.id, error = %e, "metrics-agent bootstrap script failed, continuing");
        }
    } else {
        warn!(runner_id = %runner.id, "no metrics-agent script configured; this is a config error");
    }

    if let Some(script) = find_script(scripts, ScriptEvent::OnStartup, &image.id) {
        let rendered = render(&script.template_body, &context);
        let out = driver.ssh_run_script(ip, private_key_pem, &rendered).await?;
        if !out.success() {
            return Err(PipelineError::ScriptFailed(format!(
                "on_startup exited {}: {}",
                out.exit_code, out.stderr
            )));
        }
    }

    Ok(())
}
