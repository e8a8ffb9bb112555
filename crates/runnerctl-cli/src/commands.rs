use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use runnerctl_domain::{CloudConnector, CloudProvider};
use runnerctl_driver::{DriverRegistry, LocalDriver};
use runnerctl_reconciler::{Engine, EngineConfig};
use runnerctl_store::{InMemoryStore, PostgresStore, RunnerStore};

use crate::output;

// ── Serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(images_dir: PathBuf, ephemeral: bool) -> Result<()> {
    let config = runnerctl_config::ProcessConfig::from_env()
        .context("failed to load configuration from the environment")?;

    let store: Arc<dyn RunnerStore> = if ephemeral || config.database_url.is_none() {
        println!("Using in-memory (ephemeral) store — state will be lost on server stop");
        Arc::new(InMemoryStore::new())
    } else {
        let url = config.database_url.as_deref().unwrap();
        println!("Using persistent store at {url}");
        Arc::new(
            PostgresStore::connect(url)
                .await
                .context("failed to connect to Postgres")?,
        )
    };

    let images = runnerctl_config::load_images(&images_dir)
        .with_context(|| format!("failed to load images from {}", images_dir.display()))?;
    let machines = runnerctl_config::load_machines(&images_dir)
        .with_context(|| format!("failed to load machines from {}", images_dir.display()))?;
    let scripts = runnerctl_config::load_scripts(&images_dir)
        .with_context(|| format!("failed to load scripts from {}", images_dir.display()))?;

    for machine in &machines {
        store.upsert_machine(machine).await?;
    }
    // Local development only runs the `local` driver; synthesize one
    // connector per distinct id referenced by the loaded images so allocate
    // has something to resolve without requiring real cloud credentials.
    let mut seen_connectors = HashSet::new();
    for image in &images {
        if seen_connectors.insert(image.cloud_connector_id.clone()) {
            store
                .upsert_cloud_connector(&CloudConnector {
                    id: image.cloud_connector_id.clone(),
                    provider: CloudProvider::Local,
                    region: "local".into(),
                    encrypted_access_key: String::new(),
                    encrypted_secret_key: String::new(),
                })
                .await?;
        }
    }
    for image in &images {
        store.upsert_image(image).await?;
    }
    for script in &scripts {
        store.upsert_script(script).await?;
    }
    println!("Loaded {} image(s), {} machine(s), {} script(s)", images.len(), machines.len(), scripts.len());

    let mut registry = DriverRegistry::new();
    registry.register(CloudProvider::Local, Arc::new(LocalDriver::new()));

    let engine = Engine::new(
        store,
        Arc::new(registry),
        config.encryption_key.clone(),
        EngineConfig {
            max_runner_lifetime_minutes: config.max_runner_lifetime_minutes,
            idle_pool_minutes: config.idle_pool_minutes,
            prometheus_pushgateway_url: config.prometheus_pushgateway_url.clone(),
            ..EngineConfig::default()
        },
    );

    let app = runnerctl_api::build_app(engine, Arc::new(config.api_auth_token.clone()));

    println!("Starting runnerctl API server on http://{}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

// ── Status ────────────────────────────────────────────────────────────────────

pub async fn status(remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}/status", url.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?
        .json()
        .await?;
    println!("{}", output::render_status(&body));
    Ok(())
}

// ── Images ────────────────────────────────────────────────────────────────────

pub async fn images(remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}/images", url.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

// ── Runners ───────────────────────────────────────────────────────────────────

pub async fn runners(remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}/runners", url.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?
        .json()
        .await?;
    println!("{}", output::render_runners(&body));
    Ok(())
}

pub async fn runner(runner_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body: serde_json::Value = authed_client(&token)
        .get(format!("{}/runners/{}", url.trim_end_matches('/'), runner_id))
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

// ── Allocate ──────────────────────────────────────────────────────────────────

pub async fn allocate(
    image_id: String,
    user_id: String,
    session_minutes: i64,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body = serde_json::json!({
        "image_id": image_id,
        "user_id": user_id,
        "session_minutes": session_minutes,
    });
    let resp = authed_client(&token)
        .post(format!("{}/runners/allocate", url.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        anyhow::bail!("allocate failed ({status}): {body}");
    }
    Ok(())
}

// ── Report state / extend / terminate ────────────────────────────────────────

pub async fn report_state(
    runner_id: String,
    state: String,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body = serde_json::json!({ "state": state });
    let resp = authed_client(&token)
        .post(format!("{}/runners/{}/report-state", url.trim_end_matches('/'), runner_id))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;
    print_result(resp).await
}

pub async fn extend_session(
    runner_id: String,
    additional_minutes: i64,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body = serde_json::json!({ "additional_minutes": additional_minutes });
    let resp = authed_client(&token)
        .post(format!("{}/runners/{}/extend-session", url.trim_end_matches('/'), runner_id))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;
    print_result(resp).await
}

pub async fn terminate(runner_id: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let resp = authed_client(&token)
        .post(format!("{}/runners/{}/terminate", url.trim_end_matches('/'), runner_id))
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;
    print_result(resp).await
}

// ── Maintenance ───────────────────────────────────────────────────────────────

pub async fn reap(remote: Option<String>, token: Option<String>) -> Result<()> {
    trigger_maintenance("reap", remote, token).await
}

pub async fn reconcile_pools(remote: Option<String>, token: Option<String>) -> Result<()> {
    trigger_maintenance("reconcile-pools", remote, token).await
}

pub async fn reclaim_idle(remote: Option<String>, token: Option<String>) -> Result<()> {
    trigger_maintenance("reclaim-idle", remote, token).await
}

async fn trigger_maintenance(path: &str, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let resp = authed_client(&token)
        .post(format!("{}/maintenance/{}", url.trim_end_matches('/'), path))
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;
    print_result(resp).await
}

async fn print_result(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&body)?);
        Ok(())
    } else {
        anyhow::bail!("request failed ({status}): {body}")
    }
}

// ── Token + server URL helpers ────────────────────────────────────────────────

fn resolve_token(explicit: Option<String>) -> Result<String> {
    if let Some(t) = explicit {
        return Ok(t);
    }
    let path = default_token_path();
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .with_context(|| {
            format!(
                "No token provided and could not read token file at {}. \
                 Use --token, RUNNERCTL_TOKEN, or set API_AUTH_TOKEN for `serve`.",
                path.display()
            )
        })
}

fn default_token_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".runnerctl").join("token")
}

fn authed_client(token: &str) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    let bearer = format!("Bearer {}", token);
    headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(&bearer)
            .expect("token contains invalid header characters"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .expect("failed to build HTTP client")
}

fn server_url(remote: Option<String>) -> String {
    remote.unwrap_or_else(|| "http://localhost:8080".into())
}
