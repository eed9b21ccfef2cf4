//! # gpu-bench
//!
//! Single-shot matrix-multiply micro-benchmarks. Each program generates random
//! operands, moves them to a device, times exactly one library call with
//! device events and reports elapsed time and throughput.
//!
//! ## Operations
//! - Dense GEMM (`bench-gemm`, cuBLAS)
//! - CSR sparse times dense (`bench-spmm-csr`, cuSPARSE)
//! - Sampled dense-dense product into a CSR pattern (`bench-sddmm-csr`, cuSPARSE)
//! - 2:4 structured sparse times dense (`bench-spmma`, cuSPARSELt)
//!
//! Without the `cuda` feature every program runs against [`device::HostDevice`]
//! and the reference kernels, which is also what the tests use.

pub mod cli;
pub mod compute;
pub mod device;
pub mod dump;
#[cfg(feature = "cuda")]
mod ffi;
pub mod harness;
pub mod matrix;
pub mod spec;
pub mod timing;
pub mod verify;

pub use harness::{Backend, Harness, HarnessError, HarnessOptions, RunReport, Stage};
pub use spec::{OperationKind, ProblemSpec};
