//! # Configuration Types
//!
//! Configuration structures shared by every benchmark program.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BenchFailure, ConfigurationError};

/// Which device runtime and compute backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host-simulated device memory with reference kernels
    #[default]
    Reference,
    /// CUDA runtime with the vendor libraries (requires the `cuda` feature)
    Cuda,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reference" => Ok(Self::Reference),
            "cuda" => Ok(Self::Cuda),
            other => Err(ConfigurationError::InvalidValue {
                key: "backend".to_string(),
                value: other.to_string(),
                reason: "expected one of: reference, cuda".to_string(),
            }),
        }
    }
}

/// Top-level benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BenchConfig {
    /// Device backend
    pub backend: BackendKind,

    /// Device ordinal to run on
    pub device_ordinal: u32,

    /// Fixed RNG seed; wall-clock seeded when absent
    pub seed: Option<u64>,

    /// Random data generation
    pub generator: GeneratorConfig,

    /// Harness behaviour
    pub harness: HarnessConfig,

    /// Host reference verification
    pub verify: VerifyConfig,

    /// Logging
    pub logging: LoggingConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Reference,
            device_ordinal: 0,
            seed: None,
            generator: GeneratorConfig::default(),
            harness: HarnessConfig::default(),
            verify: VerifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Uniform value range for generated matrices, `[low, high)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub low: f32,
    pub high: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HarnessConfig {
    /// Untimed invocations before the timed one
    pub warmup_iterations: u32,
}

/// Host reference verification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Verify every run, even without `--verify`
    pub enabled: bool,

    /// Absolute tolerance
    pub abs_tolerance: f32,

    /// Relative tolerance, scaled by the reference magnitude
    pub rel_tolerance: f32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            abs_tolerance: 1e-4,
            rel_tolerance: 1e-3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Colored output; only honoured when stderr is a terminal
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            ansi: true,
        }
    }
}

/// Common configuration validation trait
pub trait ConfigValidation {
    type Error: BenchFailure;

    /// Validate the configuration
    fn validate(&self) -> Result<(), Self::Error>;
}

impl ConfigValidation for GeneratorConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        // The width must stay finite too, or sampling overflows
        if !self.low.is_finite()
            || !self.high.is_finite()
            || self.low >= self.high
            || !(self.high - self.low).is_finite()
        {
            return Err(ConfigurationError::InvalidValue {
                key: "generator".to_string(),
                value: format!("[{}, {})", self.low, self.high),
                reason: "range must be finite, non-empty and narrower than f32::MAX".to_string(),
            });
        }
        Ok(())
    }
}

impl ConfigValidation for VerifyConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.abs_tolerance < 0.0 || self.rel_tolerance < 0.0 {
            return Err(ConfigurationError::InvalidValue {
                key: "verify".to_string(),
                value: format!("abs={} rel={}", self.abs_tolerance, self.rel_tolerance),
                reason: "tolerances cannot be negative".to_string(),
            });
        }
        Ok(())
    }
}

impl ConfigValidation for LoggingConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        match self.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigurationError::InvalidValue {
                key: "logging.level".to_string(),
                value: other.to_string(),
                reason: "expected one of: error, warn, info, debug, trace".to_string(),
            }),
        }
    }
}

impl ConfigValidation for BenchConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.generator.validate()?;
        self.verify.validate()?;
        self.logging.validate()
    }
}
