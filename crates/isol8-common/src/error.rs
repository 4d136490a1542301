//! Crate-wide error type for the isol8 execution engine.

use thiserror::Error;

/// Error taxonomy for the execution engine (spec §7).
///
/// `OutputTruncated` and `UserNonZeroExit` are deliberately *not* variants
/// here — per the propagation policy, truncation and non-zero exit codes are
/// reported as fields on a successful `ExecutionResult`, not as errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid option combination caught before any container is touched
    /// (e.g. both `code` and `codeUrl` set, or a persistent-mode runtime
    /// switch).
    #[error("configuration error: {0}")]
    Config(String),

    /// Lookup of an unregistered runtime name.
    #[error("unknown runtime `{requested}`, known runtimes: {known:?}")]
    UnknownRuntime {
        requested: String,
        known: Vec<String>,
    },

    /// Lookup of a file extension with no registered runtime.
    #[error("no runtime registered for extension `.{extension}`, known extensions: {known:?}")]
    UnknownExtension {
        extension: String,
        known: Vec<String>,
    },

    /// Remote-code fetch policy rejection (scheme, host, private IP, size,
    /// missing/mismatched hash).
    #[error("remote code policy denied: {0}")]
    PolicyDenied(String),

    /// Network failure while fetching remote code.
    #[error("failed to fetch remote code from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Container daemon failure (create/start/exec/stat/archive).
    #[error("container host error during {operation}: {source}")]
    Host {
        operation: &'static str,
        #[source]
        source: bollard::errors::Error,
    },

    /// The in-container network proxy did not become reachable before its
    /// startup deadline.
    #[error("in-container proxy did not become ready within {0:?}")]
    ProxyStartupTimeout(std::time::Duration),

    /// A `putFile`/`getFile` call against a persistent engine that has not
    /// yet run its first execution.
    #[error("no active container: persistent engine has not executed yet")]
    NoActiveContainer,

    /// I/O failure staging code, files, or stdin into a container, or
    /// reading back output artifacts.
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A malformed network-filter regex in engine configuration.
    #[error("invalid network filter pattern `{pattern}`: {source}")]
    InvalidFilterPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Any other unexpected internal failure, preserved with context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code, mirroring the `error_code()` convention
    /// used by the collaborator HTTP layer's own error types.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::UnknownRuntime { .. } => "UNKNOWN_RUNTIME",
            EngineError::UnknownExtension { .. } => "UNKNOWN_EXTENSION",
            EngineError::PolicyDenied(_) => "POLICY_DENIED",
            EngineError::Fetch { .. } => "FETCH_ERROR",
            EngineError::Host { .. } => "HOST_ERROR",
            EngineError::ProxyStartupTimeout(_) => "PROXY_STARTUP_TIMEOUT",
            EngineError::NoActiveContainer => "NO_ACTIVE_CONTAINER",
            EngineError::Io { .. } => "IO_ERROR",
            EngineError::InvalidFilterPattern { .. } => "INVALID_FILTER_PATTERN",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        EngineError::Host {
            operation: "docker",
            source: err,
        }
    }
}

/// Result type alias using `EngineError`.
pub type EngineResult<T> = Result<T, EngineError>;
