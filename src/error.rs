use thiserror::Error;

/// Local audio device errors. These are user-actionable and never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    #[error("No audio device found")]
    NoDevice,

    #[error("Permission to use the audio device was denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device is busy or unavailable: {0}")]
    DeviceBusy(String),

    #[error("Audio device configuration not supported: {0}")]
    Unsupported(String),

    #[error("Local audio stream has ended")]
    StreamEnded,
}

/// Audio channel negotiation and transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("Failed to set up peer connection: {0}")]
    PeerSetup(String),

    #[error("Remote endpoint rejected the offer ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Negotiation endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid answer from remote endpoint: {0}")]
    InvalidAnswer(String),
}

/// A malformed inbound event. Logged and dropped; the channel stays open.
#[derive(Debug, Error)]
pub enum ChannelParseError {
    #[error("Malformed event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
}

/// An asset id that is not in the manifest. Resolves to an empty display and is never surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Asset not in manifest: {0}")]
pub struct ResolutionMiss(pub String);

/// Event channel connection errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid event channel address: {0}")]
    InvalidUrl(String),

    #[error("Event channel connection failed: {0}")]
    Connect(String),

    #[error("Event channel did not connect within {0} seconds")]
    ConnectTimeout(u64),

    #[error("Event channel is closed")]
    Closed,
}

/// REST API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Session lifecycle errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Session is already {0}; reset it before starting again")]
    NotIdle(&'static str),

    #[error("Session start was cancelled")]
    Cancelled,
}
