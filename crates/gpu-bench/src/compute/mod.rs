//! Kernel invocation boundary
//!
//! A [`ComputeInvoker`] launches exactly one library call per operation on
//! the caller's stream. The caller owns every buffer, the workspace
//! included; invokers never allocate device memory of their own.

pub mod reference;
pub mod structured;
#[cfg(feature = "cuda")]
pub mod cublas;
#[cfg(feature = "cuda")]
pub mod cusparse;
#[cfg(feature = "cuda")]
pub mod cusparselt;

pub use reference::ReferenceInvoker;
#[cfg(feature = "cuda")]
pub use cublas::CublasInvoker;
#[cfg(feature = "cuda")]
pub use cusparse::CusparseInvoker;
#[cfg(feature = "cuda")]
pub use cusparselt::CusparseLtInvoker;

use common::error::{BenchError, BenchResult};

use crate::device::{DeviceBuffer, DeviceCompressed, DeviceCsr, DeviceDense, DeviceInfo, Stream};
use crate::spec::MatmulParams;

/// Compute capabilities with structured-sparse tensor core support
pub const STRUCTURED_COMPUTE_CAPABILITIES: &[(u32, u32)] = &[(8, 0), (8, 6), (8, 9)];

/// One library operation over device operands.
///
/// Inputs are borrowed shared, the output exclusively.
pub enum Operation<'a> {
    /// `C = alpha·op(A)·op(B) + beta·C`
    Gemm {
        a: &'a DeviceDense,
        b: &'a DeviceDense,
        c: &'a mut DeviceDense,
    },
    /// `C = alpha·A·B + beta·C` with CSR A
    Spmm {
        a: &'a DeviceCsr,
        b: &'a DeviceDense,
        c: &'a mut DeviceDense,
    },
    /// `C = alpha·(A·B)∘spy(C) + beta·C` with CSR C
    Sddmm {
        a: &'a DeviceDense,
        b: &'a DeviceDense,
        c: &'a mut DeviceCsr,
    },
    /// `C = alpha·A·B + beta·C` with compressed 2:4 A
    StructuredSpmm {
        a: &'a DeviceCompressed,
        b: &'a DeviceDense,
        c: &'a mut DeviceDense,
    },
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gemm { .. } => "gemm",
            Self::Spmm { .. } => "spmm",
            Self::Sddmm { .. } => "sddmm",
            Self::StructuredSpmm { .. } => "structured_spmm",
        }
    }
}

/// Opaque kernel launcher
pub trait ComputeInvoker {
    /// Backend name for logs and reports
    fn name(&self) -> &str;

    /// Bytes of scratch the caller must allocate before `compute`
    fn workspace_size(&self, operation: &Operation<'_>, params: &MatmulParams) -> BenchResult<usize>;

    /// Optional analysis pass ahead of the timed call
    fn preprocess(
        &self,
        _operation: &mut Operation<'_>,
        _params: &MatmulParams,
        _workspace: &mut DeviceBuffer<u8>,
        _stream: &Stream,
    ) -> BenchResult<()> {
        Ok(())
    }

    /// Enqueue the operation on `stream`
    fn compute(
        &self,
        operation: &mut Operation<'_>,
        params: &MatmulParams,
        workspace: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()>;
}

/// Problem shape of a structured-sparse multiply: A is m×k, B k×n, C m×n
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Prune, check and compress the sparse operand of a structured multiply
pub trait StructuredSparsity {
    /// Enforce the sparsity pattern on `a` in place
    fn prune(&self, shape: &StructuredShape, a: &mut DeviceDense, stream: &Stream) -> BenchResult<()>;

    /// Whether `a` already satisfies the pattern
    fn validate_pruning(&self, shape: &StructuredShape, a: &DeviceDense, stream: &Stream) -> BenchResult<bool>;

    /// `(compressed bytes, scratch bytes)` needed by `compress`
    fn compressed_size(&self, shape: &StructuredShape, params: &MatmulParams) -> BenchResult<(usize, usize)>;

    fn compress(
        &self,
        shape: &StructuredShape,
        params: &MatmulParams,
        a: &DeviceDense,
        out: &mut DeviceCompressed,
        scratch: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()>;
}

/// Reject devices without structured-sparse support before anything is allocated
pub fn check_structured_support(device: &DeviceInfo) -> BenchResult<()> {
    if STRUCTURED_COMPUTE_CAPABILITIES.contains(&device.compute_capability) {
        return Ok(());
    }
    let (major, minor) = device.compute_capability;
    let supported = STRUCTURED_COMPUTE_CAPABILITIES
        .iter()
        .map(|(major, minor)| format!("{major}.{minor}"))
        .collect::<Vec<_>>()
        .join(", ");
    Err(BenchError::unsupported(format!(
        "{} has compute capability {major}.{minor}; structured sparsity needs one of {supported}",
        device.name
    )))
}

/// Checked conversion for 32-bit library arguments
#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
pub(crate) fn to_c_int(value: usize, what: &str) -> BenchResult<i32> {
    i32::try_from(value)
        .map_err(|_| BenchError::invalid_argument(what, format!("{value} exceeds the 32-bit range")))
}
