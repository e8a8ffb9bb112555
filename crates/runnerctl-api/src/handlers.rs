use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{http::StatusCode, Json};
use futures::Stream;
use runnerctl_domain::{ImageId, LifecycleToken, Runner, RunnerId, RunnerState, ScriptEvent, UserId};
use runnerctl_reconciler::{allocate, launch_pool_runner, termination, AllocateRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.engine.store.list_images().await?;
    Ok(StatusCode::OK)
}

// ── Allocate ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AllocateBody {
    pub image_id: String,
    pub user_id: String,
    pub session_minutes: i64,
    #[serde(default)]
    pub env_data: HashMap<String, String>,
    #[serde(default)]
    pub client_ip: Option<String>,
}

impl AllocateBody {
    fn into_request(self, lifecycle_token: Option<LifecycleToken>) -> AllocateRequest {
        AllocateRequest {
            image_id: ImageId::new(self.image_id),
            user_id: UserId::new(self.user_id),
            session_minutes: self.session_minutes,
            env_data: self.env_data,
            client_ip: self.client_ip,
            lifecycle_token,
        }
    }
}

pub async fn post_allocate(
    State(state): State<AppState>,
    Json(body): Json<AllocateBody>,
) -> Result<Json<Value>, ApiError> {
    let req = body.into_request(None);
    let result = allocate(&state.engine, req).await?;
    Ok(Json(json!({ "runner": result.runner, "url": result.url })))
}

pub async fn post_allocate_async(
    State(state): State<AppState>,
    Json(body): Json<AllocateBody>,
) -> Result<Json<Value>, ApiError> {
    let token = LifecycleToken::new(uuid::Uuid::new_v4().to_string());
    state.engine.bus.register(token.clone()).await;

    let req = body.into_request(Some(token.clone()));
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = allocate(&engine, req).await {
            warn!(error = %e, "async allocation failed");
        }
    });

    Ok(Json(json!({ "lifecycle_token": token })))
}

// ── Events (SSE) ──────────────────────────────────────────────────────────────

pub async fn get_events(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let token = LifecycleToken::new(token);
    let rx = state
        .engine
        .bus
        .subscribe(&token)
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let sse = SseEvent::default()
            .event(event.kind.to_string())
            .json_data(&event)
            .unwrap_or_else(|_| SseEvent::default().data("event serialization failed"));
        Ok(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Runner lifecycle actions ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReportStateBody {
    pub state: String,
}

pub async fn post_report_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReportStateBody>,
) -> Result<Json<Value>, ApiError> {
    let runner_id = RunnerId::new(id);
    let reported: RunnerState = body
        .state
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown runner state '{}'", body.state)))?;

    let runner = state
        .engine
        .store
        .get_runner(&runner_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("runner {runner_id}")))?;

    let next = runnerctl_domain::validate_reported_state(runner.state, reported)
        .map_err(|e| ApiError::unprocessable(e.to_string()))?;

    let updated = state
        .engine
        .store
        .conditional_update(&runner_id, runner.state, Box::new(move |r| r.state = next))
        .await?;

    runnerctl_reconciler::history::record(
        &state.engine.store,
        &runner_id,
        "state_reported",
        json!({ "state": next.to_string() }),
        "external_report",
    )
    .await?;

    // Trigger the script bound to the newly reported state (§6: a report
    // "triggers the corresponding scripts"). Best-effort, same as the
    // original: the state change already committed above, so a script
    // failure here is logged and never unwinds the report.
    if let Some(event) = script_event_for_report(next) {
        run_report_script(&state, &updated, event).await;
    }

    Ok(Json(json!(updated)))
}

/// Maps a reported state to the lifecycle script it triggers, mirroring the
/// original's `update.state` → `script_event` table (`routes/runners.py`):
/// `active → on_connect`, `disconnecting → on_disconnect`,
/// `awaiting_client → on_awaiting_client`. Every other reportable state
/// (`runner_starting`, `app_starting`, `ready`, `runner_starting_claimed`,
/// `ready_claimed`) triggers none here — `on_startup` runs inside the
/// Readiness Pipeline and `on_awaiting_client`'s claim-flow invocation
/// already happens synchronously in the allocator.
fn script_event_for_report(reported: RunnerState) -> Option<ScriptEvent> {
    match reported {
        RunnerState::Active => Some(ScriptEvent::OnConnect),
        RunnerState::Disconnecting => Some(ScriptEvent::OnDisconnect),
        RunnerState::AwaitingClient => Some(ScriptEvent::OnAwaitingClient),
        _ => None,
    }
}

/// Runs `event`'s script against `runner` over SSH, best-effort: failures
/// are logged and written to history, never surfaced to the caller.
async fn run_report_script(state: &AppState, runner: &Runner, event: ScriptEvent) {
    let Some(ip) = runner.public_ip.clone() else { return };

    let image = match state.engine.store.get_image(&runner.image_id).await {
        Ok(Some(image)) => image,
        _ => return,
    };
    let scripts = match state.engine.store.scripts_for_image(&image.id).await {
        Ok(scripts) => scripts,
        Err(_) => return,
    };
    let Some(script) = runnerctl_reconciler::scripts::find_script(&scripts, event, &image.id) else {
        return;
    };
    let connector = match state.engine.store.get_cloud_connector(&image.cloud_connector_id).await {
        Ok(Some(connector)) => connector,
        _ => return,
    };
    let driver = match state.engine.registry.for_provider(connector.provider) {
        Ok(driver) => driver,
        Err(_) => return,
    };
    let (_key, pem) = match runnerctl_reconciler::key_registry::get_daily_key(
        &state.engine.store,
        &driver,
        &state.engine.encryption_key,
        &connector,
    )
    .await
    {
        Ok(pair) => pair,
        Err(_) => return,
    };

    let rendered = runnerctl_reconciler::scripts::render(&script.template_body, &runner.env_data);
    match driver.ssh_run_script(&ip, &pem, &rendered).await {
        Ok(out) if out.success() => {
            let _ = runnerctl_reconciler::history::record(
                &state.engine.store,
                &runner.id,
                "report_script_ok",
                json!({ "event": event }),
                "external_report",
            )
            .await;
        }
        Ok(out) => {
            warn!(runner_id = %runner.id, ?event, exit_code = out.exit_code, "report-triggered script failed, continuing");
            let _ = runnerctl_reconciler::history::record(
                &state.engine.store,
                &runner.id,
                "report_script_failed",
                json!({ "event": event, "exit_code": out.exit_code, "stderr": out.stderr }),
                "external_report",
            )
            .await;
        }
        Err(e) => {
            warn!(runner_id = %runner.id, ?event, error = %e, "report-triggered script failed to run, continuing");
            let _ = runnerctl_reconciler::history::record(
                &state.engine.store,
                &runner.id,
                "report_script_failed",
                json!({ "event": event, "error": e.to_string() }),
                "external_report",
            )
            .await;
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExtendSessionBody {
    pub additional_minutes: i64,
}

pub async fn post_extend_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExtendSessionBody>,
) -> Result<Json<Value>, ApiError> {
    if body.additional_minutes <= 0 {
        return Err(ApiError::bad_request("additional_minutes must be positive"));
    }
    let runner_id = RunnerId::new(id);
    let runner = state
        .engine
        .store
        .get_runner(&runner_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("runner {runner_id}")))?;
    if !runner.state.is_alive() {
        return Err(ApiError::unprocessable(format!(
            "runner {runner_id} is already in terminal state {}",
            runner.state
        )));
    }

    let additional = chrono::Duration::minutes(body.additional_minutes);
    let current_end = runner.session_end.unwrap_or_else(chrono::Utc::now);
    let new_end = current_end + additional;
    let session_start = runner.session_start.unwrap_or(runner.created_at);
    if (new_end - session_start).num_minutes() > state.engine.config.max_runner_lifetime_minutes {
        return Err(ApiError::bad_request(format!(
            "extension would exceed the configured session cap of {} minutes",
            state.engine.config.max_runner_lifetime_minutes
        )));
    }

    let updated = state
        .engine
        .store
        .conditional_update(&runner_id, runner.state, Box::new(move |r| r.session_end = Some(new_end)))
        .await?;
    runnerctl_reconciler::history::record(
        &state.engine.store,
        &runner_id,
        "session_extended",
        json!({ "additional_minutes": body.additional_minutes, "new_session_end": new_end }),
        "api",
    )
    .await?;

    Ok(Json(json!(updated)))
}

#[derive(Debug, Deserialize, Default)]
pub struct TerminateBody {
    #[serde(default)]
    pub initiated_by: Option<String>,
}

pub async fn post_terminate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TerminateBody>>,
) -> Result<Json<Value>, ApiError> {
    let runner_id = RunnerId::new(id);
    let initiated_by = body
        .and_then(|Json(b)| b.initiated_by)
        .unwrap_or_else(|| "api".to_string());
    let runner = termination::run(&state.engine, runner_id, initiated_by, RunnerState::Terminated).await?;
    Ok(Json(json!(runner)))
}

#[derive(Debug, Deserialize)]
pub struct AttachTerminalBody {
    pub terminal_token: String,
}

/// Validates `terminal_token`, gates on the four-state whitelist (§6:
/// "runner must be in {ready_claimed, ready, active, awaiting_client}"),
/// and transitions the runner to `active`. Attaching to a `ready` runner
/// pulls it out of the warm pool, so a replacement launch is requested the
/// same way claiming a pool runner does (§4.4 step 3).
pub async fn post_attach_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachTerminalBody>,
) -> Result<Json<Value>, ApiError> {
    let runner_id = RunnerId::new(id);
    let runner = state
        .engine
        .store
        .get_runner(&runner_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("runner {runner_id}")))?;

    let expected_token = runner
        .terminal_token
        .clone()
        .ok_or_else(|| ApiError::internal("runner has no terminal token"))?;
    if expected_token.as_str() != body.terminal_token {
        return Err(ApiError::unauthorized("terminal token invalid or expired"));
    }

    if !matches!(
        runner.state,
        RunnerState::Ready | RunnerState::ReadyClaimed | RunnerState::Active | RunnerState::AwaitingClient
    ) {
        return Err(ApiError::unprocessable(format!(
            "runner {runner_id} is not attachable from state {}",
            runner.state
        )));
    }

    // Must be read before the state flips to `active` below.
    let needs_replenishing = runner.state == RunnerState::Ready;
    let image_id = runner.image_id.clone();

    let updated = if runner.state == RunnerState::Active {
        runner
    } else {
        let updated = state
            .engine
            .store
            .conditional_update(&runner_id, runner.state, Box::new(|r| r.state = RunnerState::Active))
            .await?;
        runnerctl_reconciler::history::record(
            &state.engine.store,
            &runner_id,
            "terminal_attached",
            json!({}),
            "api",
        )
        .await?;
        updated
    };

    if needs_replenishing {
        if let Some(image) = state.engine.store.get_image(&image_id).await? {
            if image.pool_size > 0 {
                let engine = state.engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = launch_pool_runner(&engine, &image).await {
                        warn!(image_id = %image.id, error = %e, "pool replenishment launch failed after terminal attach");
                    }
                });
            }
        }
    }

    // The SSH terminal relay itself is an external collaborator; this
    // handler only hands back the coordinates a relay client needs.
    Ok(Json(json!({
        "runner_id": updated.id,
        "terminal_token": expected_token,
        "public_ip": updated.public_ip,
        "state": updated.state,
    })))
}

// ── Read-only inventory ───────────────────────────────────────────────────────

pub async fn get_runner(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let runner_id = RunnerId::new(id);
    let runner = state
        .engine
        .store
        .get_runner(&runner_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("runner {runner_id}")))?;
    Ok(Json(json!(runner)))
}

pub async fn list_runners(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let runners = state.engine.store.list_runners().await?;
    Ok(Json(json!(runners)))
}

pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let image_id = ImageId::new(id);
    let image = state
        .engine
        .store
        .get_image(&image_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("image {image_id}")))?;
    Ok(Json(json!(image)))
}

pub async fn list_images(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let images = state.engine.store.list_images().await?;
    Ok(Json(json!(images)))
}

// ── Maintenance (normally cron-driven; exposed for manual triggering) ────────

pub async fn post_reap(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let enqueued = runnerctl_reconciler::reap_expired(&state.engine).await?;
    Ok(Json(json!({ "enqueued": enqueued })))
}

pub async fn post_reconcile_pools(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = runnerctl_reconciler::reconcile_pools(&state.engine).await?;
    Ok(Json(json!(report)))
}

pub async fn post_reclaim_idle(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = runnerctl_reconciler::reclaim_idle(&state.engine).await?;
    Ok(Json(json!(report)))
}

// ── Status ────────────────────────────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let runners = state.engine.store.list_runners().await?;
    let images = state.engine.store.list_images().await?;

    let mut by_state: HashMap<String, usize> = HashMap::new();
    for r in &runners {
        *by_state.entry(r.state.to_string()).or_default() += 1;
    }

    let mut pools = Vec::with_capacity(images.len());
    for image in &images {
        let ready_count = state.engine.store.count_ready_for_image(&image.id).await?;
        pools.push(json!({
            "image_id": image.id,
            "pool_size": image.pool_size,
            "ready_count": ready_count,
        }));
    }

    Ok(Json(json!({
        "runner_count": runners.len(),
        "by_state": by_state,
        "pools": pools,
    })))
}

pub async fn not_found() -> impl IntoResponse {
    ApiError::not_found("no such route")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path as AxPath;
    use axum::Json as AxJson;
    use runnerctl_domain::{
        CloudConnector, CloudConnectorId, CloudProvider, Image, ImageId, ImageStatus, Machine, MachineId, Runner,
    };
    use runnerctl_driver::{DriverRegistry, LocalDriver};
    use runnerctl_reconciler::{Engine, EngineConfig};
    use runnerctl_store::{InMemoryStore, RunnerStore};
    use std::sync::Arc;

    fn test_engine() -> Engine {
        let store: Arc<dyn RunnerStore> = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        registry.register(CloudProvider::Local, Arc::new(LocalDriver::new()));
        Engine::new(
            store,
            Arc::new(registry),
            runnerctl_crypto::EncryptionKey::from_str("0123456789abcdef").unwrap(),
            EngineConfig::default(),
        )
    }

    /// Seeds a `ready_claimed` runner with `session_start` deliberately far
    /// behind `created_at`, the way a pool-claimed runner looks in practice
    /// (it was launched for the pool minutes or hours before a user claimed
    /// it). The extension cap must key off `session_start`, not
    /// `created_at` — else a pool runner claimed long after launch would be
    /// rejected for extensions well within its actual 3h session budget.
    async fn seed_runner(engine: &Engine, session_start: chrono::DateTime<chrono::Utc>, session_end: chrono::DateTime<chrono::Utc>) -> RunnerId {
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
        engine
            .store
            .upsert_image(&Image {
                id: ImageId::new("img-1"),
                identifier: "ubuntu-22-04".into(),
                machine_id: MachineId::new("m1"),
                cloud_connector_id: connector_id,
                pool_size: 0,
                status: ImageStatus::Active,
                tags: vec![],
            })
            .await
            .unwrap();

        let runner_id = RunnerId::new("r1");
        let created_at = session_start - chrono::Duration::hours(2);
        let runner = Runner {
            id: runner_id.clone(),
            cloud_instance_id: Some("i-local".into()),
            external_hash: "hash".into(),
            image_id: ImageId::new("img-1"),
            machine_id: MachineId::new("m1"),
            key_id: None,
            user_id: Some(UserId::new("u1")),
            state: RunnerState::AwaitingClient,
            public_ip: Some("1.2.3.4".into()),
            user_ip: None,
            lifecycle_token: None,
            terminal_token: None,
            session_start: Some(session_start),
            session_end: Some(session_end),
            ended_on: None,
            env_data: HashMap::new(),
            created_at,
            updated_on: created_at,
        };
        engine.store.insert_runner(&runner).await.unwrap();
        runner_id
    }

    #[tokio::test]
    async fn extension_within_the_three_hour_cap_succeeds() {
        let engine = test_engine();
        let start = chrono::Utc::now();
        let runner_id = seed_runner(&engine, start, start + chrono::Duration::hours(1)).await;
        let state = AppState { engine, auth_token: Arc::new("t".into()) };

        let resp = post_extend_session(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(ExtendSessionBody { additional_minutes: 90 }),
        )
        .await;
        assert!(resp.is_ok());
    }

    #[tokio::test]
    async fn extension_past_the_three_hour_cap_is_rejected() {
        let engine = test_engine();
        let start = chrono::Utc::now();
        // First extend to 02:30 (allowed), then a further +60 would land at
        // 03:30 total — past the 3h cap — and must be rejected (§8 scenario 5).
        let runner_id = seed_runner(&engine, start, start + chrono::Duration::minutes(150)).await;
        let state = AppState { engine, auth_token: Arc::new("t".into()) };

        let resp = post_extend_session(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(ExtendSessionBody { additional_minutes: 60 }),
        )
        .await;
        assert!(resp.is_err());
    }

    /// Seeds an image/connector/machine plus one runner in `state`, with a
    /// known terminal token and an `on_awaiting_client`/`on_connect`/
    /// `on_disconnect` script so report-triggered script execution has
    /// something to find.
    async fn seed_attachable_runner(engine: &Engine, pool_size: u32, state: RunnerState) -> (RunnerId, String) {
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
                event: ScriptEvent::OnConnect,
                template_body: "echo connected".into(),
            })
            .await
            .unwrap();

        let runner_id = RunnerId::new("r1");
        let token = "tok-secret".to_string();
        let now = chrono::Utc::now();
        let runner = Runner {
            id: runner_id.clone(),
            cloud_instance_id: Some("i-local".into()),
            external_hash: "hash".into(),
            image_id,
            machine_id: MachineId::new("m1"),
            key_id: None,
            user_id: if state == RunnerState::Ready { None } else { Some(UserId::new("u1")) },
            state,
            public_ip: Some("1.2.3.4".into()),
            user_ip: None,
            lifecycle_token: None,
            terminal_token: Some(runnerctl_domain::TerminalToken::new(token.clone())),
            session_start: Some(now),
            session_end: Some(now + chrono::Duration::minutes(60)),
            ended_on: None,
            env_data: HashMap::new(),
            created_at: now,
            updated_on: now,
        };
        engine.store.insert_runner(&runner).await.unwrap();
        (runner_id, token)
    }

    #[tokio::test]
    async fn attach_terminal_rejects_a_wrong_token() {
        let engine = test_engine();
        let (runner_id, _token) = seed_attachable_runner(&engine, 0, RunnerState::AwaitingClient).await;
        let state = AppState { engine, auth_token: Arc::new("t".into()) };

        let resp = post_attach_terminal(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(AttachTerminalBody { terminal_token: "wrong".into() }),
        )
        .await;
        assert!(resp.is_err());
    }

    #[tokio::test]
    async fn attach_terminal_rejects_an_unattachable_state() {
        let engine = test_engine();
        let (runner_id, token) = seed_attachable_runner(&engine, 0, RunnerState::Terminating).await;
        let state = AppState { engine, auth_token: Arc::new("t".into()) };

        let resp = post_attach_terminal(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(AttachTerminalBody { terminal_token: token }),
        )
        .await;
        assert!(resp.is_err());
    }

    #[tokio::test]
    async fn attach_terminal_with_valid_token_transitions_to_active() {
        let engine = test_engine();
        let (runner_id, token) = seed_attachable_runner(&engine, 0, RunnerState::AwaitingClient).await;
        let state = AppState { engine: engine.clone(), auth_token: Arc::new("t".into()) };

        let resp = post_attach_terminal(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(AttachTerminalBody { terminal_token: token }),
        )
        .await
        .unwrap();

        let body = resp.0;
        assert_eq!(body["state"], json!(RunnerState::Active));

        let runner = engine.store.get_runner(&runner_id).await.unwrap().unwrap();
        assert_eq!(runner.state, RunnerState::Active);
    }

    #[tokio::test]
    async fn attach_terminal_from_ready_requests_pool_replenishment() {
        let engine = test_engine();
        let (runner_id, token) = seed_attachable_runner(&engine, 1, RunnerState::Ready).await;
        let state = AppState { engine: engine.clone(), auth_token: Arc::new("t".into()) };

        post_attach_terminal(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(AttachTerminalBody { terminal_token: token }),
        )
        .await
        .unwrap();

        let runner = engine.store.get_runner(&runner_id).await.unwrap().unwrap();
        assert_eq!(runner.state, RunnerState::Active);

        // The replenishment launch is spawned in the background; give it a
        // moment to land a second runner for the image.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let ready_count = engine.store.count_ready_for_image(&runner.image_id).await.unwrap();
        assert_eq!(ready_count, 1);
    }

    #[tokio::test]
    async fn report_state_to_active_runs_the_on_connect_script() {
        let engine = test_engine();
        let (runner_id, _token) = seed_attachable_runner(&engine, 0, RunnerState::AwaitingClient).await;
        let state = AppState { engine: engine.clone(), auth_token: Arc::new("t".into()) };

        post_report_state(
            State(state),
            AxPath(runner_id.to_string()),
            AxJson(ReportStateBody { state: "active".into() }),
        )
        .await
        .unwrap();

        let history = engine.store.list_history(&runner_id).await.unwrap();
        assert!(history.iter().any(|h| h.event_name == "report_script_ok"));
    }
}
