//! # Common
//!
//! Shared building blocks for the gpu-bench programs.
//!
//! ## Key Features
//! - Error taxonomy with process exit-code mapping (`BenchError`)
//! - Layered configuration loading (defaults, TOML, environment)
//! - Logging initialization on stderr

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::*;
pub use logging::init_logging;

/// Version of the common crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(VERSION.chars().any(|c| c.is_ascii_digit()));
    }
}
