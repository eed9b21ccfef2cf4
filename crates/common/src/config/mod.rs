//! # Configuration
//!
//! Layered benchmark configuration: compiled defaults, an optional TOML file
//! and `GPU_BENCH_*` environment overrides.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
