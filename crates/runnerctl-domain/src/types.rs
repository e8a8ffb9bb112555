use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Identifiers ──────────────────────────────────────────────────────────────

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(RunnerId);
id_newtype!(ImageId);
id_newtype!(MachineId);
id_newtype!(CloudConnectorId);
id_newtype!(KeyId);
id_newtype!(SecurityGroupId);
id_newtype!(UserId);
id_newtype!(LifecycleToken);
id_newtype!(TerminalToken);

// ── Runner lifecycle state machine (§4.1) ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    RunnerStarting,
    RunnerStartingClaimed,
    AppStarting,
    Ready,
    ReadyClaimed,
    AwaitingClient,
    Active,
    Disconnecting,
    Disconnected,
    Terminating,
    Closed,
    Terminated,
    ClosedPool,
    Error,
}

impl RunnerState {
    /// States in which a runner is still doing something; everything else is terminal.
    pub fn is_alive(&self) -> bool {
        !matches!(
            self,
            RunnerState::Closed
                | RunnerState::Terminated
                | RunnerState::ClosedPool
                | RunnerState::Error
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_alive()
    }

    /// `should_run_terminate_script` predicate (§4.3 step 1).
    pub fn should_run_terminate_script(&self) -> bool {
        !matches!(
            self,
            RunnerState::Ready
                | RunnerState::ReadyClaimed
                | RunnerState::RunnerStarting
                | RunnerState::RunnerStartingClaimed
                | RunnerState::AppStarting
                | RunnerState::Terminated
                | RunnerState::Closed
        )
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerState::RunnerStarting => "runner_starting",
            RunnerState::RunnerStartingClaimed => "runner_starting_claimed",
            RunnerState::AppStarting => "app_starting",
            RunnerState::Ready => "ready",
            RunnerState::ReadyClaimed => "ready_claimed",
            RunnerState::AwaitingClient => "awaiting_client",
            RunnerState::Active => "active",
            RunnerState::Disconnecting => "disconnecting",
            RunnerState::Disconnected => "disconnected",
            RunnerState::Terminating => "terminating",
            RunnerState::Closed => "closed",
            RunnerState::Terminated => "terminated",
            RunnerState::ClosedPool => "closed_pool",
            RunnerState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// The exact, case-sensitive whitelist external processes may report (§6).
pub const REPORTABLE_STATES: &[RunnerState] = &[
    RunnerState::RunnerStarting,
    RunnerState::AppStarting,
    RunnerState::Ready,
    RunnerState::RunnerStartingClaimed,
    RunnerState::ReadyClaimed,
    RunnerState::AwaitingClient,
    RunnerState::Active,
    RunnerState::Disconnecting,
];

impl std::str::FromStr for RunnerState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "runner_starting" => RunnerState::RunnerStarting,
            "runner_starting_claimed" => RunnerState::RunnerStartingClaimed,
            "app_starting" => RunnerState::AppStarting,
            "ready" => RunnerState::Ready,
            "ready_claimed" => RunnerState::ReadyClaimed,
            "awaiting_client" => RunnerState::AwaitingClient,
            "active" => RunnerState::Active,
            "disconnecting" => RunnerState::Disconnecting,
            "disconnected" => RunnerState::Disconnected,
            "terminating" => RunnerState::Terminating,
            "closed" => RunnerState::Closed,
            "terminated" => RunnerState::Terminated,
            "closed_pool" => RunnerState::ClosedPool,
            "error" => RunnerState::Error,
            _ => return Err(()),
        })
    }
}

// ── Core entities (§3) ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub cloud_instance_id: Option<String>,
    pub external_hash: String,
    pub image_id: ImageId,
    pub machine_id: MachineId,
    pub key_id: Option<KeyId>,
    pub user_id: Option<UserId>,
    pub state: RunnerState,
    pub public_ip: Option<String>,
    pub user_ip: Option<String>,
    pub lifecycle_token: Option<LifecycleToken>,
    pub terminal_token: Option<TerminalToken>,
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub env_data: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Runner {
    /// Invariant 4 (§8): `ready_claimed ⇒ user_id ≠ null`, `ready ⇒ user_id = null`.
    pub fn user_binding_consistent(&self) -> bool {
        match self.state {
            RunnerState::ReadyClaimed => self.user_id.is_some(),
            RunnerState::Ready => self.user_id.is_none(),
            _ => true,
        }
    }

    /// Invariant 2 (§8): `ended_on ≠ null ⇔ state ∈ terminal set`.
    pub fn ended_on_consistent(&self) -> bool {
        self.ended_on.is_some() == self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerHistory {
    pub id: uuid::Uuid,
    pub runner_id: RunnerId,
    pub event_name: String,
    pub event_data: serde_json::Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Creating,
    Active,
    Inactive,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub identifier: String,
    pub machine_id: MachineId,
    pub cloud_connector_id: CloudConnectorId,
    pub pool_size: u32,
    pub status: ImageStatus,
    pub tags: Vec<String>,
}

impl Image {
    pub fn eligible_for_allocation(&self) -> bool {
        self.status == ImageStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub identifier: String,
    pub vcpu: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Local,
    Aws,
    Gcp,
    Azure,
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudProvider::Local => write!(f, "local"),
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Gcp => write!(f, "gcp"),
            CloudProvider::Azure => write!(f, "azure"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConnector {
    pub id: CloudConnectorId,
    pub provider: CloudProvider,
    pub region: String,
    pub encrypted_access_key: String,
    pub encrypted_secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    pub key_date: chrono::NaiveDate,
    pub cloud_connector_id: CloudConnectorId,
    pub cloud_key_id: String,
    pub key_name: String,
    pub encrypted_material: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityGroupStatus {
    Active,
    PendingDeletion,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: SecurityGroupId,
    pub cloud_group_id: String,
    pub cloud_connector_id: CloudConnectorId,
    pub inbound_rules: serde_json::Value,
    pub status: SecurityGroupStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSecurityGroup {
    pub runner_id: RunnerId,
    pub security_group_id: SecurityGroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptEvent {
    OnStartup,
    OnAwaitingClient,
    OnTerminate,
    /// Run when a `ReportRunnerState` report advances a runner to `active`.
    OnConnect,
    /// Run when a `ReportRunnerState` report advances a runner to `disconnecting`.
    OnDisconnect,
    /// The metrics-agent bootstrap script (§4.2 stage 4). Always present,
    /// applies to every image regardless of `on_startup`, and is never
    /// claim-fatal the way `on_awaiting_client` is.
    MetricsAgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: uuid::Uuid,
    /// `None` applies to every image.
    pub image_id: Option<ImageId>,
    pub event: ScriptEvent,
    pub template_body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_state_round_trips_through_str() {
        for s in [
            RunnerState::RunnerStarting,
            RunnerState::ReadyClaimed,
            RunnerState::ClosedPool,
            RunnerState::Error,
        ] {
            let text = s.to_string();
            let back: RunnerState = text.parse().unwrap();
            assert_eq!(s, back);
        }
    }

    #[test]
    fn should_run_terminate_script_excludes_pre_ready_states() {
        assert!(!RunnerState::Ready.should_run_terminate_script());
        assert!(!RunnerState::ReadyClaimed.should_run_terminate_script());
        assert!(!RunnerState::RunnerStarting.should_run_terminate_script());
        assert!(!RunnerState::Terminated.should_run_terminate_script());
        assert!(RunnerState::Active.should_run_terminate_script());
        assert!(RunnerState::AwaitingClient.should_run_terminate_script());
    }

    #[test]
    fn alive_set_excludes_terminal_states() {
        assert!(!RunnerState::Closed.is_alive());
        assert!(!RunnerState::Terminated.is_alive());
        assert!(!RunnerState::ClosedPool.is_alive());
        assert!(!RunnerState::Error.is_alive());
        assert!(RunnerState::Active.is_alive());
        assert!(RunnerState::Ready.is_alive());
    }
}
