// src/errors.rs
//! Error taxonomy for the onboarding service.
//!
//! Each component owns one error enum. Only [`RegistrationError`] can reach an
//! end user through the registration endpoint; issuance and notification
//! failures are recorded on the registration and logged instead.

use thiserror::Error;

/// Startup failures while loading the service's own signing identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read key material: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("the private key does not correspond to the configured did:key (expected {expected}, derived {derived})")]
    Mismatch { expected: String, derived: String },
}

/// Failures of the client-credentials exchange with the Verifier.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign client assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("verifier rejected token request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// Failures of a credential issuance request.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("access token: {0}")]
    Token(#[from] TokenError),

    #[error("failed to encode issuance request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("issuance request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("error calling credential issuance endpoint: status {status}")]
    Rejected { status: u16 },
}

/// Failures of the verification gate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("too many requests, please wait a few minutes")]
    RateLimited,
}

/// Registration form validation failures. Messages are shown to the user.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid country code")]
    InvalidCountry,

    #[error("invalid email address format")]
    InvalidEmail,
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("registration conflicts with an existing record: {0}")]
    Conflict(String),

    #[error("registration {0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Notification delivery failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mail configuration: {0}")]
    Config(String),

    #[error("invalid mail address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("failed to send email: {0}")]
    Transport(String),
}

/// Failures that abort a registration attempt before it is persisted.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to save registration: {0}")]
    Store(#[from] StoreError),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    #[error("environment {0:?} not found in configuration")]
    UnknownEnvironment(String),

    #[error("invalid runtime environment {0:?}, expected dev, pre or pro")]
    InvalidRuntime(String),

    #[error("failed to read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
