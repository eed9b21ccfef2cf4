//! Host-side verification of device results
//!
//! The downloaded result is compared element-wise against the reference
//! kernels run on the same host operands. An element passes when
//! `|actual - expected| <= abs + rel·|expected|`; NaN never passes.

use common::config::VerifyConfig;
use common::error::{BenchError, BenchResult};
use serde::Serialize;
use tracing::{debug, warn};

use crate::compute::reference;
use crate::matrix::{DenseMatrix, HostMatrix};
use crate::spec::{OperationKind, ProblemSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f32,
    pub rel: f32,
}

impl Tolerance {
    pub fn accepts(&self, expected: f32, actual: f32) -> bool {
        let error = (actual - expected).abs();
        // NaN compares false on both sides
        error <= self.abs + self.rel * expected.abs()
    }
}

impl From<&VerifyConfig> for Tolerance {
    fn from(config: &VerifyConfig) -> Self {
        Self {
            abs: config.abs_tolerance,
            rel: config.rel_tolerance,
        }
    }
}

/// First element that failed the tolerance check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Mismatch {
    pub index: usize,
    pub expected: f32,
    pub actual: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationSummary {
    pub checked: usize,
    pub mismatches: usize,
    pub max_abs_error: f64,
    pub first_mismatch: Option<Mismatch>,
}

impl VerificationSummary {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    /// Turn a failed comparison into `VerificationFailed`
    pub fn into_result(self) -> BenchResult<Self> {
        if self.passed() {
            return Ok(self);
        }
        let details = match self.first_mismatch {
            Some(m) => format!(
                "first at element {}: expected {}, got {}; max abs error {:e}",
                m.index, m.expected, m.actual, self.max_abs_error
            ),
            None => format!("max abs error {:e}", self.max_abs_error),
        };
        Err(BenchError::VerificationFailed {
            mismatches: self.mismatches,
            checked: self.checked,
            details,
        })
    }
}

/// Compare two value arrays element by element
pub fn compare(expected: &[f32], actual: &[f32], tolerance: Tolerance) -> BenchResult<VerificationSummary> {
    if expected.len() != actual.len() {
        return Err(BenchError::VerificationFailed {
            mismatches: expected.len().max(actual.len()),
            checked: 0,
            details: format!(
                "expected {} elements, device returned {}",
                expected.len(),
                actual.len()
            ),
        });
    }

    let mut summary = VerificationSummary {
        checked: expected.len(),
        mismatches: 0,
        max_abs_error: 0.0,
        first_mismatch: None,
    };
    for (index, (&e, &a)) in expected.iter().zip(actual).enumerate() {
        let error = f64::from((a - e).abs());
        if error.is_nan() {
            summary.max_abs_error = f64::NAN;
        } else if error > summary.max_abs_error {
            summary.max_abs_error = error;
        }
        if !tolerance.accepts(e, a) {
            summary.mismatches += 1;
            summary.first_mismatch.get_or_insert(Mismatch {
                index,
                expected: e,
                actual: a,
            });
        }
    }
    Ok(summary)
}

/// Compare matrices of the same format; CSR results must keep the pattern
pub fn compare_results(
    expected: &HostMatrix,
    actual: &HostMatrix,
    tolerance: Tolerance,
) -> BenchResult<VerificationSummary> {
    if expected.shape() != actual.shape() {
        return Err(BenchError::VerificationFailed {
            mismatches: 0,
            checked: 0,
            details: format!("shape {:?} != {:?}", actual.shape(), expected.shape()),
        });
    }
    if let (Some(e), Some(a)) = (expected.as_csr(), actual.as_csr()) {
        if !e.same_pattern(a) {
            return Err(BenchError::VerificationFailed {
                mismatches: a.nnz(),
                checked: 0,
                details: "sparsity pattern of the result changed".to_string(),
            });
        }
    }

    let summary = compare(expected.values(), actual.values(), tolerance)?;
    if summary.passed() {
        debug!("Verified {} elements, max abs error {:e}", summary.checked, summary.max_abs_error);
    } else {
        warn!("{} of {} elements outside tolerance", summary.mismatches, summary.checked);
    }
    Ok(summary)
}

/// Run the host reference on the operands the device saw.
///
/// `c` is the output as it was before the call; it matters when beta is
/// non-zero and supplies the pattern for SDDMM. For the structured kind `a`
/// is the pruned dense matrix.
pub fn reference_result(
    spec: &ProblemSpec,
    a: &HostMatrix,
    b: &DenseMatrix,
    c: &HostMatrix,
) -> BenchResult<HostMatrix> {
    let params = spec.params();
    let mismatch = |what: &str| {
        BenchError::invalid_argument(what, format!("wrong operand format for {}", spec.kind()))
    };

    match spec.kind() {
        OperationKind::Gemm | OperationKind::StructuredSpmm => {
            let a = a.as_dense().ok_or_else(|| mismatch("A"))?;
            let mut out = c.as_dense().ok_or_else(|| mismatch("C"))?.clone();
            reference::gemm(a, b, &mut out, params)?;
            Ok(out.into())
        }
        OperationKind::SpmmCsr => {
            let a = a.as_csr().ok_or_else(|| mismatch("A"))?;
            let mut out = c.as_dense().ok_or_else(|| mismatch("C"))?.clone();
            reference::spmm(a, b, &mut out, params)?;
            Ok(out.into())
        }
        OperationKind::SddmmCsr => {
            let a = a.as_dense().ok_or_else(|| mismatch("A"))?;
            let mut out = c.as_csr().ok_or_else(|| mismatch("C"))?.clone();
            reference::sddmm(a, b, &mut out, params)?;
            Ok(out.into())
        }
    }
}
