//! Host reference kernels
//!
//! Plain loops that define the expected result of every operation. The
//! verifier runs them on host copies; [`ReferenceInvoker`] runs them directly
//! against [`HostDevice`] memory so the whole harness works without a GPU.
//! When `beta == 0` the prior contents of C are ignored, as in BLAS.

use std::sync::Arc;

use common::error::{BenchError, BenchResult};
use tracing::debug;

use super::{structured, ComputeInvoker, Operation};
use crate::device::{DeviceBuffer, DeviceCsr, DeviceDense, HostDevice, Stream};
use crate::matrix::{CsrMatrix, DenseMatrix};
use crate::spec::MatmulParams;

fn blend(acc: f64, prior: f32, params: &MatmulParams) -> f32 {
    let scaled = f64::from(params.alpha) * acc;
    if params.beta == 0.0 {
        scaled as f32
    } else {
        (scaled + f64::from(params.beta) * f64::from(prior)) as f32
    }
}

fn shape_error(operation: &str, details: String) -> BenchError {
    BenchError::invalid_argument(operation, details)
}

/// `C = alpha·op(A)·op(B) + beta·C`
pub fn gemm(a: &DenseMatrix, b: &DenseMatrix, c: &mut DenseMatrix, params: &MatmulParams) -> BenchResult<()> {
    let (m, n) = (c.rows(), c.cols());
    let (a_rows, a_cols) = if params.transpose_a {
        (a.cols(), a.rows())
    } else {
        (a.rows(), a.cols())
    };
    let (b_rows, b_cols) = if params.transpose_b {
        (b.cols(), b.rows())
    } else {
        (b.rows(), b.cols())
    };
    if a_rows != m || b_cols != n || a_cols != b_rows {
        return Err(shape_error(
            "gemm",
            format!("op(A) {a_rows}x{a_cols} · op(B) {b_rows}x{b_cols} cannot produce C {m}x{n}"),
        ));
    }

    let op_a = |i: usize, p: usize| if params.transpose_a { a.get(p, i) } else { a.get(i, p) };
    let op_b = |p: usize, j: usize| if params.transpose_b { b.get(j, p) } else { b.get(p, j) };

    for j in 0..n {
        for i in 0..m {
            let acc: f64 = (0..a_cols)
                .map(|p| f64::from(op_a(i, p)) * f64::from(op_b(p, j)))
                .sum();
            let value = blend(acc, c.get(i, j), params);
            c.set(i, j, value);
        }
    }
    Ok(())
}

/// `C = alpha·A·B + beta·C` with CSR A
pub fn spmm(a: &CsrMatrix, b: &DenseMatrix, c: &mut DenseMatrix, params: &MatmulParams) -> BenchResult<()> {
    if a.cols() != b.rows() || c.rows() != a.rows() || c.cols() != b.cols() {
        return Err(shape_error(
            "spmm",
            format!(
                "A {}x{} · B {}x{} cannot produce C {}x{}",
                a.rows(),
                a.cols(),
                b.rows(),
                b.cols(),
                c.rows(),
                c.cols()
            ),
        ));
    }

    for j in 0..b.cols() {
        for i in 0..a.rows() {
            let acc: f64 = a
                .row(i)
                .map(|(p, v)| f64::from(v) * f64::from(b.get(p, j)))
                .sum();
            let value = blend(acc, c.get(i, j), params);
            c.set(i, j, value);
        }
    }
    Ok(())
}

/// `C = alpha·(A·B)∘spy(C) + beta·C` with CSR C
pub fn sddmm(a: &DenseMatrix, b: &DenseMatrix, c: &mut CsrMatrix, params: &MatmulParams) -> BenchResult<()> {
    if a.cols() != b.rows() || c.rows() != a.rows() || c.cols() != b.cols() {
        return Err(shape_error(
            "sddmm",
            format!(
                "A {}x{} · B {}x{} cannot sample C {}x{}",
                a.rows(),
                a.cols(),
                b.rows(),
                b.cols(),
                c.rows(),
                c.cols()
            ),
        ));
    }

    let products: Vec<f32> = c
        .triplets()
        .map(|(i, j, prior)| {
            let acc: f64 = (0..a.cols())
                .map(|p| f64::from(a.get(i, p)) * f64::from(b.get(p, j)))
                .sum();
            blend(acc, prior, params)
        })
        .collect();
    c.values_mut().copy_from_slice(&products);
    Ok(())
}

/// Runs the reference kernels against [`HostDevice`] memory
pub struct ReferenceInvoker {
    device: Arc<HostDevice>,
}

impl ReferenceInvoker {
    pub fn new(device: Arc<HostDevice>) -> Self {
        Self { device }
    }

    pub(crate) fn device(&self) -> &HostDevice {
        &self.device
    }

    pub(crate) fn load_dense(&self, matrix: &DeviceDense) -> BenchResult<DenseMatrix> {
        let values = self.device.read(matrix.values().ptr(), matrix.values().len())?;
        DenseMatrix::new(matrix.rows(), matrix.cols(), values)
    }

    pub(crate) fn store_dense(&self, matrix: &mut DeviceDense, host: &DenseMatrix) -> BenchResult<()> {
        self.device.write(matrix.values_mut().ptr(), host.values())
    }

    fn load_csr(&self, matrix: &DeviceCsr) -> BenchResult<CsrMatrix> {
        CsrMatrix::new(
            matrix.rows(),
            matrix.cols(),
            self.device
                .read(matrix.row_offsets().ptr(), matrix.row_offsets().len())?,
            self.device
                .read(matrix.col_indices().ptr(), matrix.col_indices().len())?,
            self.device.read(matrix.values().ptr(), matrix.values().len())?,
        )
    }

    fn store_csr_values(&self, matrix: &mut DeviceCsr, host: &CsrMatrix) -> BenchResult<()> {
        self.device.write(matrix.values_mut().ptr(), host.values())
    }
}

impl ComputeInvoker for ReferenceInvoker {
    fn name(&self) -> &str {
        "reference"
    }

    fn workspace_size(&self, _operation: &Operation<'_>, _params: &MatmulParams) -> BenchResult<usize> {
        Ok(0)
    }

    /// Validates the sampling pattern of an SDDMM output
    fn preprocess(
        &self,
        operation: &mut Operation<'_>,
        _params: &MatmulParams,
        _workspace: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()> {
        stream.synchronize()?;
        if let Operation::Sddmm { c, .. } = operation {
            let pattern = self.load_csr(c)?;
            debug!("SDDMM pattern checked: {} sampled entries", pattern.nnz());
        }
        Ok(())
    }

    fn compute(
        &self,
        operation: &mut Operation<'_>,
        params: &MatmulParams,
        _workspace: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()> {
        stream.synchronize()?;
        match operation {
            Operation::Gemm { a, b, c } => {
                let (a, b) = (self.load_dense(a)?, self.load_dense(b)?);
                let mut out = self.load_dense(c)?;
                gemm(&a, &b, &mut out, params)?;
                self.store_dense(c, &out)
            }
            Operation::Spmm { a, b, c } => {
                let (a, b) = (self.load_csr(a)?, self.load_dense(b)?);
                let mut out = self.load_dense(c)?;
                spmm(&a, &b, &mut out, params)?;
                self.store_dense(c, &out)
            }
            Operation::Sddmm { a, b, c } => {
                let (a, b) = (self.load_dense(a)?, self.load_dense(b)?);
                let mut out = self.load_csr(c)?;
                sddmm(&a, &b, &mut out, params)?;
                self.store_csr_values(c, &out)
            }
            Operation::StructuredSpmm { a, b, c } => {
                let bytes = self.device.read::<u8>(a.data().ptr(), a.data().len())?;
                let a = structured::decompress(a.rows(), a.cols(), &bytes)?;
                let b = self.load_dense(b)?;
                let mut out = self.load_dense(c)?;
                gemm(&a, &b, &mut out, params)?;
                self.store_dense(c, &out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRuntime;

    fn col_major(rows: usize, cols: usize, values: &[f32]) -> DenseMatrix {
        DenseMatrix::new(rows, cols, values.to_vec()).unwrap()
    }

    fn example_csr() -> CsrMatrix {
        CsrMatrix::new(
            4,
            4,
            vec![0, 3, 4, 7, 9],
            vec![0, 2, 3, 1, 0, 2, 3, 1, 3],
            (1..=9).map(|v| v as f32).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_gemm_two_by_two() {
        let a = col_major(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = col_major(2, 2, &[5.0, 6.0, 7.0, 8.0]);
        let mut c = DenseMatrix::zeros(2, 2);
        gemm(&a, &b, &mut c, &MatmulParams::default()).unwrap();
        assert_eq!(c.get(0, 0), 23.0);
        assert_eq!(c.get(0, 1), 31.0);
        assert_eq!(c.get(1, 0), 34.0);
        assert_eq!(c.get(1, 1), 46.0);
    }

    #[test]
    fn test_gemm_transposes_alpha_beta() {
        let a = col_major(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = col_major(2, 2, &[5.0, 6.0, 7.0, 8.0]);
        let mut c = col_major(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let params = MatmulParams {
            alpha: 2.0,
            beta: 1.0,
            transpose_a: true,
            transpose_b: false,
        };
        gemm(&a, &b, &mut c, &params).unwrap();
        // Aᵀ = [[1,2],[3,4]], AᵀB = [[17,23],[39,53]]
        assert_eq!(c.values(), &[35.0, 79.0, 47.0, 107.0]);
    }

    #[test]
    fn test_gemm_shape_mismatch() {
        let a = DenseMatrix::zeros(2, 3);
        let b = DenseMatrix::zeros(2, 2);
        let mut c = DenseMatrix::zeros(2, 2);
        assert!(gemm(&a, &b, &mut c, &MatmulParams::default()).is_err());
    }

    #[test]
    fn test_spmm_example() {
        let b = col_major(4, 3, &(1..=12).map(|v| v as f32).collect::<Vec<_>>());
        let mut c = DenseMatrix::zeros(4, 3);
        spmm(&example_csr(), &b, &mut c, &MatmulParams::default()).unwrap();
        assert_eq!(
            c.values(),
            &[19.0, 8.0, 51.0, 52.0, 43.0, 24.0, 123.0, 120.0, 67.0, 40.0, 195.0, 188.0]
        );
    }

    #[test]
    fn test_sddmm_samples_only_the_pattern() {
        let a = col_major(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = col_major(2, 2, &[5.0, 6.0, 7.0, 8.0]);
        let mut c = CsrMatrix::new(2, 2, vec![0, 1, 2], vec![1, 0], vec![10.0, 10.0]).unwrap();
        let params = MatmulParams {
            beta: 0.5,
            ..MatmulParams::default()
        };
        sddmm(&a, &b, &mut c, &params).unwrap();
        // (A·B)(0,1) = 31, (A·B)(1,0) = 34
        assert_eq!(c.values(), &[36.0, 39.0]);
        assert_eq!(c.col_indices(), &[1, 0]);
    }

    #[test]
    fn test_invoker_runs_gemm_on_device_memory() {
        let device = Arc::new(HostDevice::new());
        let runtime: Arc<dyn DeviceRuntime> = device.clone();
        let invoker = ReferenceInvoker::new(device.clone());
        let stream = Stream::new(&runtime).unwrap();

        let host_a = col_major(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let host_b = col_major(2, 2, &[5.0, 6.0, 7.0, 8.0]);
        let mut a = DeviceDense::allocate(&runtime, 2, 2).unwrap();
        let mut b = DeviceDense::allocate(&runtime, 2, 2).unwrap();
        let mut c = DeviceDense::allocate(&runtime, 2, 2).unwrap();
        a.upload(&host_a, &stream).unwrap().wait().unwrap();
        b.upload(&host_b, &stream).unwrap().wait().unwrap();
        c.values_mut().zero(&stream).unwrap();

        let mut workspace = DeviceBuffer::<u8>::new(&runtime, 0).unwrap();
        let params = MatmulParams::default();
        {
            let mut op = Operation::Gemm {
                a: &a,
                b: &b,
                c: &mut c,
            };
            assert_eq!(invoker.workspace_size(&op, &params).unwrap(), 0);
            invoker.compute(&mut op, &params, &mut workspace, &stream).unwrap();
        }
        assert_eq!(c.download(&stream).unwrap().values(), &[23.0, 34.0, 31.0, 46.0]);
    }
}
