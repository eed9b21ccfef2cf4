//! Dense GEMM through cuBLAS

use common::error::{BenchError, BenchResult};
use tracing::debug;

use super::{to_c_int, ComputeInvoker, Operation};
use crate::device::{DeviceBuffer, Stream};
use crate::ffi::{self, device_ptr, library_check, stream_ptr};
use crate::spec::MatmulParams;

/// Owned cuBLAS context
struct CublasHandle {
    handle: ffi::cublasHandle_t,
}

impl CublasHandle {
    fn new() -> BenchResult<Self> {
        let mut handle: ffi::cublasHandle_t = std::ptr::null_mut();
        unsafe {
            library_check!("cublasCreate", ffi::cublasCreate_v2(&mut handle));
        }
        Ok(Self { handle })
    }
}

impl Drop for CublasHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.handle.is_null() {
                ffi::cublasDestroy_v2(self.handle);
            }
        }
    }
}

unsafe impl Send for CublasHandle {}

/// `cublasSgemm` on column-major operands
pub struct CublasInvoker {
    handle: CublasHandle,
}

impl CublasInvoker {
    pub fn new() -> BenchResult<Self> {
        Ok(Self {
            handle: CublasHandle::new()?,
        })
    }
}

fn operation_flag(transpose: bool) -> ffi::cublasOperation_t {
    if transpose {
        ffi::CUBLAS_OP_T
    } else {
        ffi::CUBLAS_OP_N
    }
}

impl ComputeInvoker for CublasInvoker {
    fn name(&self) -> &str {
        "cublas"
    }

    fn workspace_size(&self, operation: &Operation<'_>, _params: &MatmulParams) -> BenchResult<usize> {
        match operation {
            Operation::Gemm { .. } => Ok(0),
            other => Err(BenchError::unsupported(format!(
                "cuBLAS backend cannot run {}",
                other.name()
            ))),
        }
    }

    fn compute(
        &self,
        operation: &mut Operation<'_>,
        params: &MatmulParams,
        workspace: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()> {
        let Operation::Gemm { a, b, c } = operation else {
            return Err(BenchError::unsupported(format!(
                "cuBLAS backend cannot run {}",
                operation.name()
            )));
        };

        let m = to_c_int(c.rows(), "m")?;
        let n = to_c_int(c.cols(), "n")?;
        let k = to_c_int(if params.transpose_a { a.rows() } else { a.cols() }, "k")?;
        let lda = to_c_int(a.ld(), "lda")?;
        let ldb = to_c_int(b.ld(), "ldb")?;
        let ldc = to_c_int(c.ld(), "ldc")?;
        debug!(m, n, k, "cublasSgemm");

        let handle = self.handle.handle;
        unsafe {
            library_check!(
                "cublasSetStream",
                ffi::cublasSetStream_v2(handle, stream_ptr(stream.handle()))
            );
            if !workspace.is_empty() {
                library_check!(
                    "cublasSetWorkspace",
                    ffi::cublasSetWorkspace_v2(handle, device_ptr(workspace.ptr()), workspace.size_bytes())
                );
            }
            library_check!(
                "cublasSgemm",
                ffi::cublasSgemm_v2(
                    handle,
                    operation_flag(params.transpose_a),
                    operation_flag(params.transpose_b),
                    m,
                    n,
                    k,
                    &params.alpha,
                    device_ptr(a.values().ptr()) as *const f32,
                    lda,
                    device_ptr(b.values().ptr()) as *const f32,
                    ldb,
                    &params.beta,
                    device_ptr(c.values_mut().ptr()) as *mut f32,
                    ldc,
                )
            );
        }
        Ok(())
    }
}
