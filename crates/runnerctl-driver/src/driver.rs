use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::DriverError;

/// Result of [`Driver::describe_ip`] (§4.8, §4.2 stage `assign_ip`).
///
/// The original service's describe-instance call can return the sentinel
/// string `"Association"` before a real address lands; §4.2 requires this
/// to be rejected rather than treated as a valid IP, so the pending case is
/// its own variant rather than `Option<String>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpStatus {
    Pending,
    Assigned(String),
}

/// Result of [`Driver::wait_terminated`] (§4.3 step 4: "If the instance is
/// observed in `stopping`, reschedule with a 2-minute backoff").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    Terminated,
    StillStopping,
}

/// Output of an SSH-executed script (§4.8 `ssh_run_script`).
#[derive(Debug, Clone)]
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Freshly created keypair material (§4.9 Key Registry).
#[derive(Debug, Clone)]
pub struct KeypairMaterial {
    pub cloud_key_id: String,
    pub key_name: String,
    /// PEM-encoded private key. The caller encrypts this before persisting
    /// (§6 wire format) and never writes it to disk except transiently in
    /// `SSH_PRIVATE_KEY_DIR` while a script runs.
    pub private_key_pem: String,
}

/// Result of [`Driver::validate_account`] (§4.8).
#[derive(Debug, Clone)]
pub enum AccountValidation {
    Ok,
    MissingPermissions(Vec<String>),
}

/// The provider-agnostic capability set a `CloudConnector` exposes (§4.8,
/// C1). One implementation per `CloudConnector.provider`, dispatched
/// through [`crate::registry::DriverRegistry`].
///
/// All operations are retryable at the caller's discretion — implementers
/// signal this by returning [`DriverError::Transient`] for throttling/
/// eventual-consistency misses and [`DriverError::Auth`] for credential
/// failures the caller should treat as terminal for the connector (§7).
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    // ── Keypairs (C2 Key Registry) ────────────────────────────────────────

    async fn create_keypair(&self, key_name: &str) -> Result<KeypairMaterial, DriverError>;
    async fn delete_keypair(&self, cloud_key_id: &str) -> Result<(), DriverError>;

    // ── Instance lifecycle (C6 Readiness Pipeline, C7 Termination Pipeline) ─

    /// Launch one instance of `machine_identifier` running `image_identifier`,
    /// authorized with `key_name` and placed in `security_group_ids`.
    /// Returns the cloud-assigned instance id.
    async fn create_instance(
        &self,
        key_name: &str,
        image_identifier: &str,
        machine_identifier: &str,
        security_group_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<String, DriverError>;

    /// Blocks until the instance is observed running (§4.2 stage `wait_running`).
    async fn wait_running(&self, instance_id: &str) -> Result<(), DriverError>;

    /// One poll of the instance's public IP (§4.2 stage `assign_ip` re-polls
    /// this up to N times). Never blocks internally.
    async fn describe_ip(&self, instance_id: &str) -> Result<IpStatus, DriverError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), DriverError>;
    async fn start_instance(&self, instance_id: &str) -> Result<(), DriverError>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), DriverError>;

    /// Polls until the instance reaches a terminal cloud state or `timeout`
    /// elapses (§4.3 step 4: "wait up to 100s for terminal state").
    async fn wait_terminated(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<TerminationOutcome, DriverError>;

    // ── Security groups (C3) ─────────────────────────────────────────────

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<String, DriverError>;

    async fn authorize_ingress(
        &self,
        cloud_group_id: &str,
        cidr: &str,
        port: u16,
    ) -> Result<(), DriverError>;

    async fn delete_security_group(&self, cloud_group_id: &str) -> Result<(), DriverError>;

    async fn tag_resource(
        &self,
        resource_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), DriverError>;

    // ── SSH script execution (§4.2 stage `bootstrap_scripts`, §4.3 step 1) ──

    /// Runs `script` on `ip` authenticated with `private_key_pem`, base64-
    /// wrapped and sudo-invoked (§4.2 stage 4). The default implementation
    /// shells out to the system `ssh` binary (SPEC_FULL §4.8) — the same
    /// subprocess idiom used elsewhere in this crate for external
    /// binaries, since no crate in this workspace embeds an SSH protocol
    /// implementation.
    async fn ssh_run_script(
        &self,
        ip: &str,
        private_key_pem: &str,
        script: &str,
    ) -> Result<SshOutput, DriverError> {
        run_script_over_ssh(ip, private_key_pem, script).await
    }

    // ── Images (AMI-equivalent; out of scope to create in depth, §1) ────────

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String, DriverError>;
    async fn deregister_image(&self, image_id: &str) -> Result<(), DriverError>;

    /// Polls up to `retries` times, `delay` apart, until the image reaches
    /// an "available" state (§4.8; §7 example cadence "5 retries/10s").
    async fn wait_image_available(
        &self,
        image_id: &str,
        retries: u32,
        delay: Duration,
    ) -> Result<(), DriverError>;

    // ── Account health ────────────────────────────────────────────────────

    async fn validate_account(&self) -> Result<AccountValidation, DriverError>;
}

/// Shells out to `ssh`, writing `private_key_pem` to a scratch file with
/// `0600` permissions for the duration of the call. The script is
/// base64-encoded and piped through `sudo bash -c` on the remote end
/// (§4.2 stage 4: "base64-wrapped and sudo-invoked") so special characters
/// and multi-line scripts survive the shell round-trip intact.
pub async fn run_script_over_ssh(
    ip: &str,
    private_key_pem: &str,
    script: &str,
) -> Result<SshOutput, DriverError> {
    let tmp = std::env::temp_dir().join(format!("runnerctl-sshkey-{}", uuid::Uuid::new_v4()));
    write_private_key(&tmp, private_key_pem).await?;

    let encoded = {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD.encode(script.as_bytes())
    };
    let remote_cmd = format!(
        "echo {encoded} | base64 -d | sudo bash -s",
    );

    debug!(ip, "running bootstrap script over ssh");
    let output = Command::new("ssh")
        .args([
            "-i",
            tmp.to_string_lossy().as_ref(),
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=5",
            &format!("ubuntu@{ip}"),
            &remote_cmd,
        ])
        .output()
        .await;

    let _ = tokio::fs::remove_file(&tmp).await;

    let output = output.map_err(|e| DriverError::Transient(format!("ssh exec: {e}")))?;
    Ok(SshOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

async fn write_private_key(path: &std::path::Path, pem: &str) -> Result<(), DriverError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| DriverError::Internal(format!("writing scratch key: {e}")))?;
    file.write_all(pem.as_bytes())
        .await
        .map_err(|e| DriverError::Internal(format!("writing scratch key: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| DriverError::Internal(format!("chmod scratch key: {e}")))?;
    }
    Ok(())
}
