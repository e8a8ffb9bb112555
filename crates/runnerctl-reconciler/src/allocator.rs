//! Allocator (C8, §4.4): per-request decision tree — existing runner wins
//! over warm pool, warm pool wins over a cold launch. Binds the runner to
//! the caller, sets the session window, and runs the claim script before
//! handing back a URL.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use runnerctl_domain::{
    CloudConnector, Image, ImageId, LifecycleToken, Machine, Runner, RunnerId, RunnerState,
    ScriptEvent, TerminalToken, UserId,
};
use runnerctl_events::{AllocationKind, DiscoveryKind, Event, EventKind, Phase};
use serde_json::json;
use tracing::warn;

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::scripts::{find_script, render};
use crate::{history, key_registry, readiness, security_group, termination};

pub struct AllocateRequest {
    pub image_id: ImageId,
    pub user_id: UserId,
    pub session_minutes: i64,
    pub env_data: HashMap<String, String>,
    pub client_ip: Option<String>,
    pub lifecycle_token: Option<LifecycleToken>,
}

pub struct AllocateResult {
    pub runner: Runner,
    pub url: String,
}

fn runner_url(runner: &Runner) -> String {
    match &runner.public_ip {
        Some(ip) => format!("https://{ip}/"),
        None => String::new(),
    }
}

async fn emit_discovery(engine: &Engine, token: Option<&LifecycleToken>, kind: DiscoveryKind) {
    if let Some(token) = token {
        engine
            .bus
            .emit(token, Event::new(EventKind::ResourceDiscovery(kind), format!("resource discovery: {kind}")))
            .await;
    }
}

async fn emit_allocation(engine: &Engine, token: Option<&LifecycleToken>, kind: AllocationKind, phase: Phase) {
    if let Some(token) = token {
        engine
            .bus
            .emit(
                token,
                Event::new(EventKind::ResourceAllocation { kind, phase }, format!("{kind}: {phase}")),
            )
            .await;
    }
}

/// Resolves one allocation request end to end (§4.4 steps 1-4).
pub async fn allocate(engine: &Engine, req: AllocateRequest) -> Result<AllocateResult, PipelineError> {
    let image = engine
        .store
        .get_image(&req.image_id)
        .await?
        .ok_or_else(|| PipelineError::InvalidRequest(format!("unknown image {}", req.image_id)))?;
    if !image.eligible_for_allocation() {
        return Err(PipelineError::InvalidRequest(format!("image {} is not active", image.id)));
    }
    if req.session_minutes <= 0 || req.session_minutes > engine.config.max_runner_lifetime_minutes {
        return Err(PipelineError::InvalidRequest(format!(
            "session_minutes must be within (0, {}]",
            engine.config.max_runner_lifetime_minutes
        )));
    }

    if let Some(token) = &req.lifecycle_token {
        engine.bus.register(token.clone()).await;
        engine.bus.emit(token, Event::new(EventKind::RequestReceived, "allocation request received")).await;
        engine
            .bus
            .emit(token, Event::new(EventKind::RequestProcessing, "resolving allocation strategy"))
            .await;
    }

    // ── 2. Existing ───────────────────────────────────────────────────
    if let Some(existing) = engine.store.find_existing_for_user(&image.id, &req.user_id).await? {
        emit_discovery(engine, req.lifecycle_token.as_ref(), DiscoveryKind::Existing).await;
        emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::ClaimExisting, Phase::InProgress).await;
        history::record(
            &engine.store,
            &existing.id,
            "existing_runner_reused",
            json!({}),
            req.user_id.as_str(),
        )
        .await?;

        let session_end = Utc::now() + ChronoDuration::minutes(req.session_minutes);
        let client_ip = req.client_ip.clone();
        let mut runner = engine
            .store
            .conditional_update(
                &existing.id,
                existing.state,
                Box::new(move |r| {
                    r.session_end = Some(session_end);
                    if client_ip.is_some() {
                        r.user_ip = client_ip;
                    }
                }),
            )
            .await?;

        runner = run_claim_script(engine, runner, &image, &req.env_data, req.user_id.as_str()).await?;
        emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::ClaimExisting, Phase::Succeeded).await;
        let url = runner_url(&runner);
        return Ok(AllocateResult { runner, url });
    }

    // ── 3. Pool ───────────────────────────────────────────────────────
    if let Some(claimed) = engine.store.claim_ready_for_image(&image.id, &req.user_id).await? {
        emit_discovery(engine, req.lifecycle_token.as_ref(), DiscoveryKind::Pool).await;
        emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::ClaimPool, Phase::InProgress).await;
        history::record(&engine.store, &claimed.id, "pool_runner_claimed", json!({}), req.user_id.as_str())
            .await?;

        let now = Utc::now();
        let session_end = now + ChronoDuration::minutes(req.session_minutes);
        let client_ip = req.client_ip.clone();
        let mut runner = engine
            .store
            .conditional_update(
                &claimed.id,
                claimed.state,
                Box::new(move |r| {
                    r.session_start = Some(now);
                    r.session_end = Some(session_end);
                    r.user_ip = client_ip;
                }),
            )
            .await?;

        if image.pool_size > 0 {
            let engine = engine.clone();
            let image = image.clone();
            tokio::spawn(async move {
                if let Err(e) = launch_pool_runner(&engine, &image).await {
                    warn!(image_id = %image.id, error = %e, "pool replenishment launch failed");
                }
            });
        }

        runner = run_claim_script(engine, runner, &image, &req.env_data, req.user_id.as_str()).await?;
        emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::ClaimPool, Phase::Succeeded).await;
        let url = runner_url(&runner);
        return Ok(AllocateResult { runner, url });
    }

    // ── 4. Cold launch ───────────────────────────────────────────────
    emit_discovery(engine, req.lifecycle_token.as_ref(), DiscoveryKind::None).await;
    emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::LaunchNew, Phase::InProgress).await;

    let connector = engine
        .store
        .get_cloud_connector(&image.cloud_connector_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("cloud connector {}", image.cloud_connector_id)))?;
    let machine = engine
        .store
        .get_machine(&image.machine_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("machine {}", image.machine_id)))?;
    let scripts = engine.store.scripts_for_image(&image.id).await?;

    let runner = launch_runner(
        engine,
        &image,
        &connector,
        &machine,
        RunnerState::RunnerStartingClaimed,
        Some(req.user_id.clone()),
        req.client_ip.clone(),
        req.env_data.clone(),
        Some(req.session_minutes),
        req.lifecycle_token.clone(),
    )
    .await?;

    let runner_id = runner.id.clone();
    let engine_bg = engine.clone();
    let image_bg = image.clone();
    let connector_bg = connector.clone();
    let scripts_bg = scripts.clone();
    let initiated_by = req.user_id.to_string();
    let handle = tokio::spawn(async move {
        readiness::run(&engine_bg, runner_id, image_bg, connector_bg, scripts_bg, initiated_by).await
    });

    match tokio::time::timeout(engine.config.allocate_wait_timeout, handle).await {
        Ok(Ok(Ok(ready_runner))) => {
            let runner = run_claim_script(engine, ready_runner, &image, &req.env_data, req.user_id.as_str()).await?;
            emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::LaunchNew, Phase::Succeeded).await;
            let url = runner_url(&runner);
            Ok(AllocateResult { runner, url })
        }
        Ok(Ok(Err(e))) => {
            emit_allocation(engine, req.lifecycle_token.as_ref(), AllocationKind::LaunchNew, Phase::Failed).await;
            Err(e)
        }
        Ok(Err(_join_err)) => Err(PipelineError::Internal("readiness pipeline task panicked".into())),
        // Bounded wait expired (§5 Cancellation): the caller's request
        // fails but the spawned task keeps running to completion.
        Err(_elapsed) => Err(PipelineError::AllocationTimeout),
    }
}

/// Launches one unclaimed `runner_starting` instance for `image`'s warm
/// pool (§4.4 step 3's replenishment, and the Pool Controller's launch-up
/// path, §4.5).
pub async fn launch_pool_runner(engine: &Engine, image: &Image) -> Result<Runner, PipelineError> {
    let connector = engine
        .store
        .get_cloud_connector(&image.cloud_connector_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("cloud connector {}", image.cloud_connector_id)))?;
    let machine = engine
        .store
        .get_machine(&image.machine_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("machine {}", image.machine_id)))?;
    let scripts = engine.store.scripts_for_image(&image.id).await?;

    let runner = launch_runner(
        engine,
        image,
        &connector,
        &machine,
        RunnerState::RunnerStarting,
        None,
        None,
        HashMap::new(),
        None,
        None,
    )
    .await?;

    readiness::run(engine, runner.id.clone(), image.clone(), connector, scripts, "pool_replenishment".into()).await
}

#[allow(clippy::too_many_arguments)]
async fn launch_runner(
    engine: &Engine,
    image: &Image,
    connector: &CloudConnector,
    machine: &Machine,
    state: RunnerState,
    user_id: Option<UserId>,
    client_ip: Option<String>,
    env_data: HashMap<String, String>,
    session_minutes: Option<i64>,
    lifecycle_token: Option<LifecycleToken>,
) -> Result<Runner, PipelineError> {
    let driver = engine.registry.for_provider(connector.provider)?;
    let (key, pem) = key_registry::get_daily_key(&engine.store, &driver, &engine.encryption_key, connector).await?;
    let _ = pem; // the keypair's private material is only needed once the instance is reachable (readiness pipeline re-fetches it)

    let now = Utc::now();
    let runner_id = RunnerId::new(uuid::Uuid::new_v4().to_string());
    let runner = Runner {
        id: runner_id.clone(),
        cloud_instance_id: None,
        external_hash: uuid::Uuid::new_v4().to_string(),
        image_id: image.id.clone(),
        machine_id: machine.id.clone(),
        key_id: Some(key.id.clone()),
        user_id,
        state,
        public_ip: None,
        user_ip: client_ip.clone(),
        lifecycle_token,
        terminal_token: Some(TerminalToken::new(uuid::Uuid::new_v4().to_string())),
        session_start: session_minutes.map(|_| now),
        session_end: session_minutes.map(|m| now + ChronoDuration::minutes(m)),
        ended_on: None,
        env_data,
        created_at: now,
        updated_on: now,
    };
    engine.store.insert_runner(&runner).await?;
    history::record(&engine.store, &runner_id, "runner_created", json!({ "state": state.to_string() }), "system")
        .await?;

    let sg = security_group::provision_for_runner(&engine.store, &driver, &runner, &connector.id, client_ip.as_deref())
        .await?;

    let mut tags = HashMap::new();
    tags.insert("runner_id".to_string(), runner_id.to_string());
    let instance_id = driver
        .create_instance(&key.key_name, &image.identifier, &machine.identifier, &[sg.cloud_group_id.clone()], &tags)
        .await?;

    let runner = engine
        .store
        .conditional_update(&runner_id, runner.state, Box::new(move |r| r.cloud_instance_id = Some(instance_id)))
        .await?;
    history::record(&engine.store, &runner_id, "instance_requested", json!({}), "system").await?;

    Ok(runner)
}

/// Runs the `on_awaiting_client` claim script and transitions
/// `ready_claimed → awaiting_client` (§4.4 "The claim-script step..."). A
/// runner not in `ready_claimed` is returned unchanged — this is the
/// existing-runner path's no-op when the caller already owns a runner past
/// this stage.
async fn run_claim_script(
    engine: &Engine,
    runner: Runner,
    image: &Image,
    caller_env: &HashMap<String, String>,
    initiated_by: &str,
) -> Result<Runner, PipelineError> {
    if runner.state != RunnerState::ReadyClaimed {
        return Ok(runner);
    }

    let connector = engine
        .store
        .get_cloud_connector(&image.cloud_connector_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("cloud connector {}", image.cloud_connector_id)))?;
    let driver = engine.registry.for_provider(connector.provider)?;

    if let Some(ip) = &runner.user_ip {
        security_group::authorize_claim_ip(&engine.store, &driver, &runner.id, ip).await?;
    }

    let scripts = engine.store.scripts_for_image(&image.id).await?;

    if let Some(script) = find_script(&scripts, ScriptEvent::OnAwaitingClient, &image.id) {
        let ip = runner
            .public_ip
            .clone()
            .ok_or_else(|| PipelineError::Internal("claimed runner has no public ip".into()))?;
        let (_key, pem) =
            key_registry::get_daily_key(&engine.store, &driver, &engine.encryption_key, &connector).await?;
        let mut context = runner.env_data.clone();
        context.extend(caller_env.clone());
        let rendered = render(&script.template_body, &context);

        match driver.ssh_run_script(&ip, &pem, &rendered).await {
            Ok(out) if out.success() => {
                history::record(&engine.store, &runner.id, "claim_script_ok", json!({}), initiated_by).await?;
            }
            Ok(out) => {
                history::record(
                    &engine.store,
                    &runner.id,
                    "claim_script_failed",
                    json!({ "exit_code": out.exit_code, "stderr": out.stderr }),
                    initiated_by,
                )
                .await?;
                let _ = termination::run(engine, runner.id.clone(), initiated_by.to_string(), RunnerState::Terminated)
                    .await;
                return Err(PipelineError::ScriptFailed(format!(
                    "on_awaiting_client exited {}: {}",
                    out.exit_code, out.stderr
                )));
            }
            Err(e) => {
                history::record(
                    &engine.store,
                    &runner.id,
                    "claim_script_failed",
                    json!({ "error": e.to_string() }),
                    initiated_by,
                )
                .await?;
                let _ = termination::run(engine, runner.id.clone(), initiated_by.to_string(), RunnerState::Terminated)
                    .await;
                return Err(e.into());
            }
        }
    }

    let updated = engine
        .store
        .conditional_update(
            &runner.id,
            RunnerState::ReadyClaimed,
            Box::new(|r| r.state = RunnerState::AwaitingClient),
        )
        .await?;
    history::record(&engine.store, &runner.id, "runner_awaiting_client", json!({}), initiated_by).await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use runnerctl_domain::{CloudConnectorId, CloudProvider, ImageStatus, MachineId, ScriptEvent};
    use runnerctl_driver::{DriverRegistry, LocalDriver};
    use runnerctl_store::InMemoryStore;
    use std::sync::Arc;

    async fn seeded_engine(pool_size: u32) -> (Engine, ImageId) {
        let store: Arc<dyn runnerctl_store::RunnerStore> = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        registry.register(CloudProvider::Local, Arc::new(LocalDriver::new()));
        let engine = Engine::new(
            store,
            Arc::new(registry),
            runnerctl_crypto::EncryptionKey::from_str("0123456789abcdef").unwrap(),
            EngineConfig { allocate_wait_timeout: Duration::from_secs(5), ..EngineConfig::default() },
        );

        let connector_id = CloudConnectorId::new("conn-1");
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
            .upsert_machine(&Machine { id: MachineId::new("m1"), identifier: "t3.medium".into(), vcpu: 2, memory_mb: 4096 })
            .await
            .unwrap();
        let image_id = ImageId::new("img-1");
        engine
            .store
            .upsert_image(&Image {
                id: image_id.clone(),
                identifier: "ubuntu-22-04".into(),
                machine_id: MachineId::new("m1"),
                cloud_connector_id: connector_id,
                pool_size,
                status: ImageStatus::Active,
                tags: vec![],
            })
            .await
            .unwrap();
        engine
            .store
            .upsert_script(&runnerctl_domain::Script {
                id: uuid::Uuid::new_v4(),
                image_id: None,
                event: ScriptEvent::MetricsAgent,
                template_body: "echo metrics".into(),
            })
            .await
            .unwrap();
        (engine, image_id)
    }

    #[tokio::test]
    async fn cold_launch_resolves_to_a_claimed_ready_runner() {
        let (engine, image_id) = seeded_engine(0).await;
        let req = AllocateRequest {
            image_id,
            user_id: UserId::new("u1"),
            session_minutes: 60,
            env_data: HashMap::new(),
            client_ip: Some("9.9.9.9".into()),
            lifecycle_token: None,
        };

        let result = allocate(&engine, req).await.unwrap();
        assert_eq!(result.runner.state, RunnerState::AwaitingClient);
        assert!(result.runner.user_id.is_some());
    }

    #[tokio::test]
    async fn second_request_for_same_user_reuses_the_existing_runner() {
        let (engine, image_id) = seeded_engine(0).await;
        let user_id = UserId::new("u1");

        let first = allocate(
            &engine,
            AllocateRequest {
                image_id: image_id.clone(),
                user_id: user_id.clone(),
                session_minutes: 30,
                env_data: HashMap::new(),
                client_ip: None,
                lifecycle_token: None,
            },
        )
        .await
        .unwrap();

        let second = allocate(
            &engine,
            AllocateRequest {
                image_id,
                user_id,
                session_minutes: 45,
                env_data: HashMap::new(),
                client_ip: None,
                lifecycle_token: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(first.runner.id, second.runner.id);
    }

    #[tokio::test]
    async fn rejects_a_session_longer_than_the_configured_cap() {
        let (engine, image_id) = seeded_engine(0).await;
        let req = AllocateRequest {
            image_id,
            user_id: UserId::new("u1"),
            session_minutes: engine.config.max_runner_lifetime_minutes + 1,
            env_data: HashMap::new(),
            client_ip: None,
            lifecycle_token: None,
        };
        let err = allocate(&engine, req).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }
}
