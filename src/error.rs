//! Error types for the discovery and backend layers.
//!
//! The taxonomy separates three concerns:
//!
//! - [`ConfigError`]: the layered configuration could not be loaded or a key
//!   had the wrong type. Parse failures are fatal and reported once, at the
//!   first resolution.
//! - [`BackendError`]: transport-level I/O failures on one command channel
//!   (disconnect, timeout, malformed response). These are distinct from
//!   instrument-reported errors, which arrive through the error queue.
//! - [`Error`]: everything the discovery layer and drivers surface to
//!   callers, including the two above via `#[from]`.
//!
//! Scanner and per-driver failures during discovery are caught and logged,
//! never propagated; only a global zero-candidate outcome becomes
//! [`Error::NoSuchHardware`]. No operation in this crate retries implicitly.

use thiserror::Error;

use crate::instrument::Capability;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the discovery layer and instrument drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// A required capability produced zero candidates after full discovery.
    #[error("no hardware found for capability {0}")]
    NoSuchHardware(Capability),

    /// A transport library or driver is unavailable on this host.
    ///
    /// Discovery treats this as "zero candidates" for that transport and
    /// keeps scanning the others.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Transport-level I/O failure on a backend session.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Generic instrument-reported failure.
    #[error("instrument error: {0}")]
    Instrument(String),

    /// The instrument error queue was non-empty when checked.
    #[error("instrument has pending errors: {0:?}")]
    InstrumentPendingErrors(Vec<String>),

    /// The driver does not implement an optional operation.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    /// The caller supplied an out-of-range or malformed value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested channel name does not exist on the instrument.
    #[error("no such channel: {0}")]
    NoSuchChannel(String),

    /// Configuration loading or typing failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Transport-level failures on one command channel.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The device disappeared or the connection dropped.
    #[error("backend disconnected: {0}")]
    Disconnected(String),

    /// A blocking read did not complete within the session timeout.
    #[error("backend timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The device answered, but the response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Protocol-level fault (e.g. a VXI-11 RPC error code).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and typing failures.
///
/// Cloneable because the global store memoizes the outcome of its first
/// load and hands the same error to every later caller.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A configuration file exists but is not valid TOML.
    #[error("failed to parse config file {path}: {message}")]
    Parse {
        /// Offending file path.
        path: String,
        /// Parser diagnostic.
        message: String,
    },

    /// A key resolved to a value of the wrong type.
    #[error("config key '{key}' has type {actual}, expected {expected}")]
    TypeMismatch {
        /// Dotted key that was looked up.
        key: String,
        /// Expected type name.
        expected: &'static str,
        /// Actual type name found.
        actual: &'static str,
    },

    /// A value parsed but is semantically invalid (e.g. a bad CIDR range).
    #[error("invalid config value for '{key}': {message}")]
    InvalidValue {
        /// Dotted key that was looked up.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_converts_to_crate_error() {
        let err: Error = BackendError::Disconnected("serial".into()).into();
        assert!(matches!(err, Error::Backend(BackendError::Disconnected(_))));
    }

    #[test]
    fn error_messages_name_the_capability() {
        let err = Error::NoSuchHardware(Capability::Scope);
        assert!(err.to_string().contains("Scope"));
    }
}
