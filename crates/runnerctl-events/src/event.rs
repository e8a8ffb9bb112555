//! The typed lifecycle event taxonomy (§4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Existing,
    Pool,
    None,
}

impl std::fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiscoveryKind::Existing => "existing",
            DiscoveryKind::Pool => "pool",
            DiscoveryKind::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    ClaimExisting,
    ClaimPool,
    LaunchNew,
}

impl std::fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AllocationKind::ClaimExisting => "claim_existing",
            AllocationKind::ClaimPool => "claim_pool",
            AllocationKind::LaunchNew => "launch_new",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::InProgress => "in_progress",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One event in the §4.7 taxonomy, exactly as enumerated there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    RequestReceived,
    RequestProcessing,
    ResourceDiscovery(DiscoveryKind),
    ResourceAllocation { kind: AllocationKind, phase: Phase },
    InstanceBooting,
    InstanceStarting,
    InstanceRunning,
    InstanceIpAssigning,
    InstanceIpAssigned,
    InstanceSshWaiting,
    InstanceSshAvailable,
    InstanceStartupProcessStarted,
    InstanceStartupProcessComplete,
    InstanceStartupProcessFailed,
    InstanceScript,
    SessionStatus,
    ConnectionStatus { phase: Phase },
    RunnerReady,
    InstanceShuttingDown,
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::RequestReceived => write!(f, "REQUEST_RECEIVED"),
            EventKind::RequestProcessing => write!(f, "REQUEST_PROCESSING"),
            EventKind::ResourceDiscovery(k) => write!(f, "RESOURCE_DISCOVERY:{k}"),
            EventKind::ResourceAllocation { kind, phase } => {
                write!(f, "RESOURCE_ALLOCATION:{kind}:{phase}")
            }
            EventKind::InstanceBooting => write!(f, "INSTANCE_BOOTING"),
            EventKind::InstanceStarting => write!(f, "INSTANCE_STARTING"),
            EventKind::InstanceRunning => write!(f, "INSTANCE_RUNNING"),
            EventKind::InstanceIpAssigning => write!(f, "INSTANCE_IP_ASSIGNING"),
            EventKind::InstanceIpAssigned => write!(f, "INSTANCE_IP_ASSIGNED"),
            EventKind::InstanceSshWaiting => write!(f, "INSTANCE_SSH_WAITING"),
            EventKind::InstanceSshAvailable => write!(f, "INSTANCE_SSH_AVAILABLE"),
            EventKind::InstanceStartupProcessStarted => {
                write!(f, "INSTANCE_STARTUP_PROCESS_STARTED")
            }
            EventKind::InstanceStartupProcessComplete => {
                write!(f, "INSTANCE_STARTUP_PROCESS_COMPLETE")
            }
            EventKind::InstanceStartupProcessFailed => {
                write!(f, "INSTANCE_STARTUP_PROCESS_FAILED")
            }
            EventKind::InstanceScript => write!(f, "INSTANCE_SCRIPT"),
            EventKind::SessionStatus => write!(f, "SESSION_STATUS"),
            EventKind::ConnectionStatus { phase } => write!(f, "CONNECTION_STATUS:{phase}"),
            EventKind::RunnerReady => write!(f, "RUNNER_READY"),
            EventKind::InstanceShuttingDown => write!(f, "INSTANCE_SHUTTING_DOWN"),
            EventKind::Error => write!(f, "ERROR"),
        }
    }
}

impl EventKind {
    /// Whether this event kind is the bus's closing event for a lifecycle
    /// token — §4.7: "the bus does not retain events after the runner
    /// reaches a terminal state and the subscriber disconnects", and §7:
    /// "Event Bus always emits a terminal ERROR event before the subscriber
    /// is closed." `RunnerReady`/`ConnectionStatus{succeeded}` close the
    /// bus successfully; `Error` closes it on failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Error | EventKind::ConnectionStatus { phase: Phase::Succeeded }
        )
    }
}

/// One emitted event, carrying a human message and arbitrary structured data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
