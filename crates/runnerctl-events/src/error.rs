use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("lifecycle token is not registered with the event bus: {0}")]
    UnknownToken(String),

    #[error("lifecycle token already has an attached subscriber: {0}")]
    AlreadySubscribed(String),
}
