//! Pure state-machine validation (§4.1). No I/O: callers own side effects
//! (script execution, event emission); this module only says whether a
//! transition is legal and what the resulting state is.

use crate::error::{DomainError, DomainResult};
use crate::types::RunnerState;

/// An observed or requested transition trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEvent {
    AllocateUnclaimed,
    AllocateClaimed,
    InstanceRunning,
    IpAssigned,
    SshAlive,
    BootstrapOk,
    Claim,
    ClaimScriptOk,
    ClientConnect,
    ClientDisconnect,
    Terminate,
    StopDone,
    TerminateDone,
    ReapIdle,
    FatalError,
}

impl std::fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Applies `event` to `current` per the §4.1 allow-list table. Returns the
/// resulting state, or `IllegalTransition` if the event does not apply from
/// the observed state. `FatalError` is legal from any alive state.
pub fn apply_transition(
    current: RunnerState,
    event: &TransitionEvent,
) -> DomainResult<RunnerState> {
    use RunnerState::*;
    use TransitionEvent as E;

    if matches!(event, E::FatalError) {
        return Ok(Error);
    }

    let next = match (current, event) {
        (RunnerStarting, E::InstanceRunning)
        | (RunnerStarting, E::IpAssigned)
        | (RunnerStarting, E::SshAlive) => RunnerStarting,
        (RunnerStartingClaimed, E::InstanceRunning)
        | (RunnerStartingClaimed, E::IpAssigned)
        | (RunnerStartingClaimed, E::SshAlive) => RunnerStartingClaimed,

        (RunnerStartingClaimed, E::BootstrapOk) => ReadyClaimed,
        (RunnerStarting, E::BootstrapOk) => Ready,

        (Ready, E::Claim) => ReadyClaimed,
        (ReadyClaimed, E::ClaimScriptOk) => AwaitingClient,

        (AwaitingClient, E::ClientConnect) => Active,
        (Active, E::ClientDisconnect) => Disconnecting,

        (Terminating, E::StopDone) => Closed,
        (Closed, E::TerminateDone) => Terminated,

        (Ready, E::ReapIdle) => ClosedPool,

        (from, E::Terminate) if from.is_alive() => Terminating,

        (from, event) => {
            return Err(DomainError::IllegalTransition {
                from,
                event: event.to_string(),
            })
        }
    };
    Ok(next)
}

/// Validates an externally reported state against the reportable whitelist
/// and against the current state's legal successors. Used by
/// `ReportRunnerState` (§6): any state not in `REPORTABLE_STATES` is
/// rejected outright; a reportable state that isn't a legal advance from
/// `current` is also rejected (the report is an observation, not a command,
/// but it must still respect the allow-list).
pub fn validate_reported_state(
    current: RunnerState,
    reported: RunnerState,
) -> DomainResult<RunnerState> {
    use crate::types::REPORTABLE_STATES;

    if !REPORTABLE_STATES.contains(&reported) {
        return Err(DomainError::InvalidRequest(format!(
            "state '{reported}' is not in the reportable whitelist"
        )));
    }

    // Reports are idempotent no-ops if they restate the current state.
    if reported == current {
        return Ok(current);
    }

    let legal = matches!(
        (current, reported),
        (RunnerState::RunnerStarting, RunnerState::AppStarting)
            | (RunnerState::RunnerStartingClaimed, RunnerState::AppStarting)
            | (RunnerState::AppStarting, RunnerState::Ready)
            | (RunnerState::AppStarting, RunnerState::ReadyClaimed)
            | (RunnerState::ReadyClaimed, RunnerState::AwaitingClient)
            | (RunnerState::AwaitingClient, RunnerState::Active)
            | (RunnerState::Active, RunnerState::Disconnecting)
    );

    if legal {
        Ok(reported)
    } else {
        Err(DomainError::IllegalTransition {
            from: current,
            event: format!("report({reported})"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_launch_reaches_ready_claimed() {
        let s = apply_transition(RunnerState::RunnerStartingClaimed, &TransitionEvent::BootstrapOk)
            .unwrap();
        assert_eq!(s, RunnerState::ReadyClaimed);
    }

    #[test]
    fn claim_requires_ready() {
        let err = apply_transition(RunnerState::Active, &TransitionEvent::Claim).unwrap_err();
        assert!(matches!(err, DomainError::IllegalTransition { .. }));
    }

    #[test]
    fn terminate_legal_from_any_alive_state() {
        for s in [
            RunnerState::RunnerStarting,
            RunnerState::Ready,
            RunnerState::ReadyClaimed,
            RunnerState::Active,
        ] {
            assert_eq!(
                apply_transition(s, &TransitionEvent::Terminate).unwrap(),
                RunnerState::Terminating
            );
        }
    }

    #[test]
    fn terminate_illegal_from_terminal_state() {
        assert!(apply_transition(RunnerState::Terminated, &TransitionEvent::Terminate).is_err());
    }

    #[test]
    fn fatal_error_legal_from_any_state() {
        assert_eq!(
            apply_transition(RunnerState::RunnerStarting, &TransitionEvent::FatalError).unwrap(),
            RunnerState::Error
        );
    }

    #[test]
    fn reported_state_outside_whitelist_rejected() {
        let err =
            validate_reported_state(RunnerState::RunnerStarting, RunnerState::Terminated)
                .unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(_)));
    }

    #[test]
    fn reported_state_repeats_current_is_noop() {
        let s = validate_reported_state(RunnerState::Ready, RunnerState::Ready).unwrap();
        assert_eq!(s, RunnerState::Ready);
    }
}
