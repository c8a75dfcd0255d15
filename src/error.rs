//! Error types shared across the authenticator and updater daemons.

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error, tagging which subsystem raised it.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Keystore / signing errors.
    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    /// Authenticator errors.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// API client errors.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Identity script errors.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Deployment client errors.
    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    /// Update engine errors.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Update module subprocess errors.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// KV store errors.
    #[error("database error: {0}")]
    Database(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Distinguished "exit with success" sentinel, used by the CLI parser
    /// for `--help`/`--version` so `main` can exit 0 without logging an error.
    #[error("exit with success")]
    ExitSuccess,
}

/// Errors from the authenticator (spec §4.2, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Local setup problem (missing key, bad config) before any network call.
    #[error("setup error: {0}")]
    Setup(String),
    /// Failed to build or send the HTTP request.
    #[error("request error: {0}")]
    Request(String),
    /// Transport-level failure reading the response.
    #[error("response error: {0}")]
    Response(String),
    /// Server responded with a non-2xx status carrying API-level detail.
    #[error("API error: {0}")]
    Api(String),
    /// Server rejected the signed auth request (wrong identity/signature).
    #[error("unauthorized")]
    Unauthorized,
}

/// Errors from the keystore (spec §4.1, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeystoreError {
    /// No key file present at the configured path.
    #[error("no key found")]
    NoKey,
    /// Malformed key data, wrong passphrase, or I/O failure while loading/saving.
    #[error("setup error: {0}")]
    Setup(String),
    /// `generate` called on a keystore created as static (externally supplied).
    #[error("keystore is static and cannot regenerate its key")]
    StaticKey,
    /// Base64 (de)coding failure.
    #[error("base64 error: {0}")]
    Base64(String),
    /// Signature verification failure.
    #[error("verification failed")]
    Verification,
}

/// Errors from the identity collector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity script exited non-zero.
    #[error("identity script failed with status {0}: {1}")]
    ScriptFailed(i32, String),
    /// The identity script could not be spawned at all.
    #[error("failed to run identity script: {0}")]
    SpawnFailed(String),
}

/// Errors from the API client (spec §4.3, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Could not build the request (bad path, forbidden operation).
    #[error("setup error: {0}")]
    Setup(String),
    /// Failed to send the request.
    #[error("request error: {0}")]
    Request(String),
    /// Transport-level failure reading the response.
    #[error("response error: {0}")]
    Response(String),
    /// Server responded with a non-2xx, non-401 status.
    #[error("API error: HTTP {0}")]
    Api(u16),
    /// The server rejected a retried request with a second 401.
    #[error("unauthorized")]
    Unauthorized,
    /// Could not obtain a token at all (surfaced from the Authenticator).
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
}

/// Errors from the deployment client (spec §4.7, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeploymentError {
    /// Response body did not match the expected shape.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Non-2xx, non-409 response to a status/log push.
    #[error("bad response: HTTP {0}")]
    BadResponse(u16),
    /// Server returned 409: the deployment was aborted/superseded.
    #[error("deployment aborted")]
    DeploymentAborted,
}

/// Errors from the update state engine (spec §4.5, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// `commit`/`rollback` called with no persisted `StateData`.
    #[error("no update in progress")]
    NoUpdateInProgress,
    /// `install` called while a `StateData` record is already present.
    #[error("operation already in progress")]
    OperationInProgress,
    /// Persisted state failed to deserialize or carried an unsupported version.
    #[error("invalid persisted state: {0}")]
    DatabaseValue(String),
    /// Artifact source returned a non-200 HTTP response.
    #[error("unexpected HTTP response: {0}")]
    UnexpectedHttpResponse(u16),
    /// Caller misuse (e.g. calling an operation APIRequest forbids).
    #[error("programming error: {0}")]
    ProgrammingError(String),
    /// Transport-level failure fetching an artifact.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors from the update-module subprocess driver (spec §4.6, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Module exited non-zero.
    #[error("module exited with status {code}: {stderr}")]
    GenericError {
        /// Process exit code.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },
    /// Module did not respond within the configured timeout.
    #[error("module timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Module emitted more than one non-empty stdout line for a query state.
    #[error("protocol error: {0}")]
    Protocol(String),
}
