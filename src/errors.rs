//! Structured error types for the engine.
//!
//! Mirrors the taxonomy in the error handling design: `auth`, `forbidden_per_kind`,
//! `network`/`timeout`, the drop-counter family (`channel_full`, `already_seen`,
//! `noisy_filter`, `store_failed`), and `fatal`. Library-layer errors (`kube::Error`,
//! `std::io::Error`) are wrapped exactly once at their crossing into the engine.

use thiserror::Error;

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Identity invalid or insufficient for the operation attempted.
    #[error("authentication/authorization failed: {message}")]
    Auth { message: String },

    /// A specific kind is excluded from the typed cache's enabled set.
    #[error("kind '{kind}' is forbidden for the current identity")]
    ForbiddenKind { kind: String },

    /// Transient network failure; callers may retry.
    #[error("network error: {message}")]
    Network { message: String },

    /// A bounded wait elapsed before the awaited condition completed.
    #[error("timed out waiting for {operation} after {elapsed_secs}s")]
    Timeout { operation: String, elapsed_secs: u64 },

    /// Failure to initialize the typed cache at startup. The only fatal startup error.
    #[error("fatal startup failure in {component}: {message}")]
    Fatal { component: String, message: String },

    /// Requested kind is not known to discovery.
    #[error("unknown resource kind: {kind}")]
    UnknownKind { kind: String },

    /// Requested object was not found in any cache.
    #[error("not found: {kind}/{name} in namespace {namespace:?}")]
    NotFound {
        kind: String,
        name: String,
        namespace: Option<String>,
    },

    /// Ambiguous singular kind shared by more than one API group.
    #[error("kind '{kind}' is ambiguous across groups {groups:?}; specify a group")]
    AmbiguousKind { kind: String, groups: Vec<String> },

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wrapped `kube` client/API error, wrapped exactly once.
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// Generic I/O error (timeline persistence, kubeconfig reads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Configuration-specific errors, kept separate so the CLI/bootstrap layer can
/// report them distinctly from runtime engine errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration validation failed: {field} - {message}")]
    ValidationFailed { field: String, message: String },

    #[error("environment variable parsing failed: {variable} - {message}")]
    EnvironmentParsing { variable: String, message: String },

    #[error("no kubeconfig could be resolved from any configured source")]
    NoKubeconfig,

    #[error("failed to read kubeconfig at {path}: {message}")]
    KubeconfigReadFailed { path: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// The coarse failure bucket used for connection status and metrics, per the
/// error handling design's taxonomy. Distinct from `EngineError`, which carries
/// the detailed variant: `ErrorClass` is the thing external callers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    Network,
    Timeout,
    Unknown,
}

/// Drop reasons tracked by the change channel and timeline store. These never
/// surface to end users; they are exposed only via debug/diagnostics endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    ChannelFull,
    AlreadySeen,
    NoisyFilter,
    StoreFailed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::ChannelFull => "channel_full",
            DropReason::AlreadySeen => "already_seen",
            DropReason::NoisyFilter => "noisy_filter",
            DropReason::StoreFailed => "store_failed",
        };
        f.write_str(s)
    }
}

/// Classifies a raw `kube::Error` into the coarse bucket used by the
/// connection controller and the dynamic cache's access probe.
///
/// Fail-closed: anything not clearly a network/timeout condition is treated
/// as `Auth` when the API reports 401/403, otherwise `Unknown`.
pub fn classify_kube_error(err: &kube::Error) -> ErrorClass {
    if let kube::Error::Api(api_err) = err {
        return match api_err.code {
            401 | 403 => ErrorClass::Auth,
            408 | 429 | 500..=599 => ErrorClass::Network,
            _ => ErrorClass::Unknown,
        };
    }

    let msg = err.to_string().to_lowercase();
    if msg.contains("timed out") || msg.contains("timeout") {
        ErrorClass::Timeout
    } else if msg.contains("forbidden") || msg.contains("unauthorized") {
        ErrorClass::Auth
    } else if msg.contains("connection") || msg.contains("dns") || msg.contains("hyper") || msg.contains("service") {
        ErrorClass::Network
    } else {
        ErrorClass::Unknown
    }
}

/// Returns true when the classified error represents a permission denial,
/// used by the capability prober (fail-closed: any error is a denial) and by
/// the dynamic cache's access probe (§4.4 step 4).
pub fn is_forbidden(err: &kube::Error) -> bool {
    if let kube::Error::Api(api_err) = err {
        return api_err.code == 401 || api_err.code == 403;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("forbidden") || msg.contains("unauthorized")
}
