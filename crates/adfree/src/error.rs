use manifest::ManifestError;
use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Network and token failures are recovered inside the negotiation loop
/// (the failing candidate is marked unusable and the search continues).
/// Line-level parse failures never surface here at all; the offending pair
/// is skipped where it is read. Nothing in this enum is allowed to escape
/// the public `Engine` API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("invalid URL: {source}")]
    Url {
        #[from]
        source: url::ParseError,
    },

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("token request failed: {reason}")]
    Token { reason: String },

    #[error("stream state inconsistency: {reason}")]
    StateInconsistency { reason: String },

    #[error("no reachable backup stream")]
    ExhaustedNegotiation,

    #[error("execution context rejected: {reason}")]
    ContextRejected { reason: String },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}
