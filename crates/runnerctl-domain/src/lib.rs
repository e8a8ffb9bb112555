pub mod error;
pub mod transition;
pub mod types;

pub use error::{DomainError, DomainResult};
pub use transition::{apply_transition, validate_reported_state, TransitionEvent};
pub use types::*;
