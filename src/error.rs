//! Shared error types for the worker pool.
//!
//! Each component keeps its own narrow error enum; this module defines the
//! aggregate `WorkerError` the scheduler sees, plus the retryable/fatal
//! classification used throughout the claim protocol and the maintenance
//! engine (spec §7).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error("exactly one of APP_PRIVATE_KEY or APP_PRIVATE_KEY_PATH must be set")]
    AmbiguousPrivateKey,

    #[error("failed to read private key file {path}: {source}")]
    PrivateKeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to decode base64 private key: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to sign installation token assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token exchange request failed: {0}")]
    Request(String),

    #[error("token exchange returned status {0}")]
    UnexpectedStatus(u16),
}

/// Outcome of a single Host API call, classified the way spec.md §4.1 and
/// §9 ("Polymorphism over error outcomes") require: callers pattern-match
/// rather than sniff status codes themselves.
#[derive(Debug, Clone)]
pub enum ApiOutcome<T> {
    Ok(T),
    RetriableTransient(String),
    RateLimited,
    NotFound,
    Other4xx(u16, String),
    Server5xx(u16, String),
}

impl<T> ApiOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiOutcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ApiOutcome::Ok(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HostApiError {
    #[error("rate limited until deadline")]
    RateLimited,

    #[error("request failed after retries: {0}")]
    ExhaustedRetries(String),

    #[error("unexpected response status {status}: {body}")]
    Unexpected { status: u16, body: String },

    #[error("response body could not be parsed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git command `{command}` failed with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("io error running git: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("work item already claimed by another worker")]
    AlreadyClaimed,

    #[error("lost claim race to an earlier comment")]
    LostRace,

    #[error(transparent)]
    Api(HostApiError),

    #[error("rate limited while staking claim")]
    RateLimited,
}

/// Hand-written rather than `#[from]` so a rate-limited Host API response
/// surfaces as the dedicated `RateLimited` variant instead of being buried
/// in `Api` — the claim protocol and the maintenance engine's `ignore_race`
/// both pattern-match on it directly (spec §9 "Polymorphism over error
/// outcomes").
impl From<HostApiError> for ClaimError {
    fn from(err: HostApiError) -> Self {
        match err {
            HostApiError::RateLimited => ClaimError::RateLimited,
            other => ClaimError::Api(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Api(#[from] HostApiError),

    #[error("no known remedy for failing check(s) on this change-set")]
    NoKnownRemedy,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Api(#[from] HostApiError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
}

/// Errors in this bucket should be retried by the caller (spec §7
/// "Transient transport"); anything else is fatal to the current
/// operation and is handled by finalizing the item as a failure instead.
pub fn is_retryable(err: &HostApiError) -> bool {
    matches!(
        err,
        HostApiError::Transport(_) | HostApiError::ExhaustedRetries(_)
    )
}
