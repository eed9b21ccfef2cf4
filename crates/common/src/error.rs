//! Error handling for gpu-bench
//!
//! This module defines the error taxonomy shared by every benchmark program:
//! - `BenchFailure` marker trait for consistent error handling
//! - `BenchError` covering argument, environment, resource, compute and
//!   pruning failures
//! - `ConfigurationError` for the layered configuration loader
//!
//! # Design Principles
//! - All errors implement Send + Sync
//! - Use thiserror for library errors, anyhow for application errors
//! - Every error maps to a process exit code through `exit_code()`
//! - Nothing in this taxonomy is retryable

use thiserror::Error;

/// Process exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;

/// Process exit code for usage errors and any failing capability.
pub const EXIT_FAILURE: i32 = 1;

/// Process exit code for an unsupported device or configuration.
pub const EXIT_UNSUPPORTED: i32 = 2;

/// Base trait for all gpu-bench errors
///
/// Ensures errors are thread-safe, `'static` and implement `std::error::Error`.
pub trait BenchFailure: std::error::Error + Send + Sync + 'static {
    /// Exit code the process should terminate with when this error is fatal.
    fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

/// Benchmark errors
///
/// Detected as close to their origin as possible and propagated straight to
/// program exit. There is no local recovery.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Missing, zero or malformed argument
    #[error("Invalid argument {argument}: {details}")]
    InvalidArgument { argument: String, details: String },

    /// Hardware or build capability mismatch, detected before any allocation
    #[error("Unsupported configuration: {details}")]
    UnsupportedConfiguration { details: String },

    /// Device allocation, transfer or synchronization failure
    #[error("Resource failure during {operation}: {details}")]
    ResourceFailure { operation: String, details: String },

    /// Underlying kernel returned a non-success status
    #[error("Compute failure in {operation} (status {code})")]
    ComputeFailure { operation: String, code: i32 },

    /// Structured-sparsity check rejected the pruned matrix
    #[error("Invalid pruning: {details}")]
    InvalidPruning { details: String },

    /// Device result disagrees with the host reference
    #[error("Verification failed: {mismatches} of {checked} elements differ ({details})")]
    VerificationFailed {
        mismatches: usize,
        checked: usize,
        details: String,
    },

    /// Result dump could not be written
    #[error("Failed to write {path}: {source}")]
    DumpFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl BenchFailure for BenchError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::UnsupportedConfiguration { .. } => EXIT_UNSUPPORTED,
            _ => EXIT_FAILURE,
        }
    }
}

/// Configuration-related errors
///
/// These errors occur during configuration loading, parsing, or validation.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing failed
    #[error("Failed to parse configuration: {details}")]
    ParseError { details: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl BenchFailure for ConfigurationError {}

/// Result type alias for gpu-bench operations
pub type BenchResult<T, E = BenchError> = Result<T, E>;

impl BenchError {
    /// Create an invalid argument error
    pub fn invalid_argument(argument: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            details: details.into(),
        }
    }

    /// Create an unsupported configuration error
    pub fn unsupported(details: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            details: details.into(),
        }
    }

    /// Create a resource failure error
    pub fn resource(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ResourceFailure {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Create a compute failure error from a vendor status code
    pub fn compute(operation: impl Into<String>, code: i32) -> Self {
        Self::ComputeFailure {
            operation: operation.into(),
            code,
        }
    }

    /// Create a dump failure error
    pub fn dump(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::DumpFailed {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = BenchError::invalid_argument("m", "must be a positive integer");
        let display = format!("{err}");
        assert!(display.contains("m"));
        assert!(display.contains("positive integer"));

        let err = BenchError::compute("cusparseSpMM", 7);
        assert_eq!(format!("{err}"), "Compute failure in cusparseSpMM (status 7)");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            BenchError::unsupported("compute capability 7.5").exit_code(),
            EXIT_UNSUPPORTED
        );
        assert_eq!(
            BenchError::invalid_argument("k", "missing").exit_code(),
            EXIT_FAILURE
        );
        assert_eq!(BenchError::compute("gemm", 13).exit_code(), EXIT_FAILURE);
        assert_eq!(
            BenchError::InvalidPruning {
                details: "group 3".to_string()
            }
            .exit_code(),
            EXIT_FAILURE
        );
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Access denied");
        let err = BenchError::dump("/tmp/out.A.npy", io_error);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_configuration_error_conversion() {
        let err: BenchError = ConfigurationError::FileNotFound {
            path: "bench.toml".to_string(),
        }
        .into();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert!(format!("{err}").contains("bench.toml"));
    }
}
