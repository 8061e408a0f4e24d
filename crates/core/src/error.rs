use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("No target provided to register listener for {event_type}")]
    MissingTarget { event_type: String },

    #[error("No event type provided to register listener")]
    MissingEventType,

    #[error("Invalid user ID: {reason}")]
    InvalidUserId { reason: String },

    #[error("Invalid options: {reason}")]
    InvalidOptions { reason: String },

    #[error("Storage unavailable for key {key}: {reason}")]
    StorageUnavailable { key: String, reason: String },

    #[error("Failed to add event listener for {event_type}: {reason}")]
    ListenerRejected { event_type: String, reason: String },

    #[error("Beacon rejected by collector at {url}: HTTP {status}")]
    BeaconRejected { url: String, status: u16 },

    #[error("Transport failed: {reason}")]
    TransportFailed { reason: String },

    #[error("Missing collector config: {env_var} environment variable is not set")]
    MissingCollectorConfig { env_var: String },

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
