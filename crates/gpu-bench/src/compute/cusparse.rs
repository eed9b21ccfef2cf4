//! CSR SpMM and SDDMM through the cuSPARSE generic API

use std::os::raw::c_void;

use common::error::{BenchError, BenchResult};
use tracing::debug;

use super::{ComputeInvoker, Operation};
use crate::device::{DeviceBuffer, DeviceCsr, DeviceDense, Stream};
use crate::ffi::{self, device_ptr, library_check, stream_ptr};
use crate::spec::MatmulParams;

const NON_TRANSPOSE: ffi::cusparseOperation_t = ffi::CUSPARSE_OPERATION_NON_TRANSPOSE;

struct CusparseHandle {
    handle: ffi::cusparseHandle_t,
}

impl CusparseHandle {
    fn new() -> BenchResult<Self> {
        let mut handle: ffi::cusparseHandle_t = std::ptr::null_mut();
        unsafe {
            library_check!("cusparseCreate", ffi::cusparseCreate(&mut handle));
        }
        Ok(Self { handle })
    }
}

impl Drop for CusparseHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.handle.is_null() {
                ffi::cusparseDestroy(self.handle);
            }
        }
    }
}

unsafe impl Send for CusparseHandle {}

/// CSR descriptor over device buffers it does not own
struct SparseDescriptor(ffi::cusparseSpMatDescr_t);

impl SparseDescriptor {
    fn csr(matrix: &DeviceCsr) -> BenchResult<Self> {
        let mut descr: ffi::cusparseSpMatDescr_t = std::ptr::null_mut();
        unsafe {
            library_check!(
                "cusparseCreateCsr",
                ffi::cusparseCreateCsr(
                    &mut descr,
                    matrix.rows() as i64,
                    matrix.cols() as i64,
                    matrix.nnz() as i64,
                    device_ptr(matrix.row_offsets().ptr()),
                    device_ptr(matrix.col_indices().ptr()),
                    device_ptr(matrix.values().ptr()),
                    ffi::CUSPARSE_INDEX_32I,
                    ffi::CUSPARSE_INDEX_32I,
                    ffi::CUSPARSE_INDEX_BASE_ZERO,
                    ffi::CUDA_R_32F,
                )
            );
        }
        Ok(Self(descr))
    }
}

impl Drop for SparseDescriptor {
    fn drop(&mut self) {
        unsafe {
            ffi::cusparseDestroySpMat(self.0);
        }
    }
}

/// Column-major dense descriptor over a buffer it does not own
struct DenseDescriptor(ffi::cusparseDnMatDescr_t);

impl DenseDescriptor {
    fn column_major(matrix: &DeviceDense) -> BenchResult<Self> {
        let mut descr: ffi::cusparseDnMatDescr_t = std::ptr::null_mut();
        unsafe {
            library_check!(
                "cusparseCreateDnMat",
                ffi::cusparseCreateDnMat(
                    &mut descr,
                    matrix.rows() as i64,
                    matrix.cols() as i64,
                    matrix.ld() as i64,
                    device_ptr(matrix.values().ptr()),
                    ffi::CUDA_R_32F,
                    ffi::CUSPARSE_ORDER_COL,
                )
            );
        }
        Ok(Self(descr))
    }
}

impl Drop for DenseDescriptor {
    fn drop(&mut self) {
        unsafe {
            ffi::cusparseDestroyDnMat(self.0);
        }
    }
}

/// Descriptors for one operation, destroyed before the call returns
enum Described {
    Spmm {
        a: SparseDescriptor,
        b: DenseDescriptor,
        c: DenseDescriptor,
    },
    Sddmm {
        a: DenseDescriptor,
        b: DenseDescriptor,
        c: SparseDescriptor,
    },
}

impl Described {
    fn new(operation: &Operation<'_>) -> BenchResult<Self> {
        match operation {
            Operation::Spmm { a, b, c } => Ok(Self::Spmm {
                a: SparseDescriptor::csr(a)?,
                b: DenseDescriptor::column_major(b)?,
                c: DenseDescriptor::column_major(c)?,
            }),
            Operation::Sddmm { a, b, c } => Ok(Self::Sddmm {
                a: DenseDescriptor::column_major(a)?,
                b: DenseDescriptor::column_major(b)?,
                c: SparseDescriptor::csr(c)?,
            }),
            other => Err(BenchError::unsupported(format!(
                "cuSPARSE backend cannot run {}",
                other.name()
            ))),
        }
    }
}

/// SpMM and SDDMM with default algorithms and f32 compute
pub struct CusparseInvoker {
    handle: CusparseHandle,
}

impl CusparseInvoker {
    pub fn new() -> BenchResult<Self> {
        Ok(Self {
            handle: CusparseHandle::new()?,
        })
    }

    fn bind(&self, stream: &Stream) -> BenchResult<ffi::cusparseHandle_t> {
        unsafe {
            library_check!(
                "cusparseSetStream",
                ffi::cusparseSetStream(self.handle.handle, stream_ptr(stream.handle()))
            );
        }
        Ok(self.handle.handle)
    }
}

fn scalar(value: &f32) -> *const c_void {
    (value as *const f32).cast()
}

impl ComputeInvoker for CusparseInvoker {
    fn name(&self) -> &str {
        "cusparse"
    }

    fn workspace_size(&self, operation: &Operation<'_>, params: &MatmulParams) -> BenchResult<usize> {
        let described = Described::new(operation)?;
        let handle = self.handle.handle;
        let alpha = scalar(&params.alpha);
        let beta = scalar(&params.beta);
        let mut bytes = 0usize;
        unsafe {
            match &described {
                Described::Spmm { a, b, c } => library_check!(
                    "cusparseSpMM_bufferSize",
                    ffi::cusparseSpMM_bufferSize(
                        handle,
                        NON_TRANSPOSE,
                        NON_TRANSPOSE,
                        alpha,
                        a.0,
                        b.0,
                        beta,
                        c.0,
                        ffi::CUDA_R_32F,
                        ffi::CUSPARSE_SPMM_ALG_DEFAULT,
                        &mut bytes,
                    )
                ),
                Described::Sddmm { a, b, c } => library_check!(
                    "cusparseSDDMM_bufferSize",
                    ffi::cusparseSDDMM_bufferSize(
                        handle,
                        NON_TRANSPOSE,
                        NON_TRANSPOSE,
                        alpha,
                        a.0,
                        b.0,
                        beta,
                        c.0,
                        ffi::CUDA_R_32F,
                        ffi::CUSPARSE_SDDMM_ALG_DEFAULT,
                        &mut bytes,
                    )
                ),
            }
        }
        debug!("{} workspace: {} bytes", operation.name(), bytes);
        Ok(bytes)
    }

    fn preprocess(
        &self,
        operation: &mut Operation<'_>,
        params: &MatmulParams,
        workspace: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()> {
        let Described::Sddmm { a, b, c } = Described::new(operation)? else {
            return Ok(());
        };
        let handle = self.bind(stream)?;
        unsafe {
            library_check!(
                "cusparseSDDMM_preprocess",
                ffi::cusparseSDDMM_preprocess(
                    handle,
                    NON_TRANSPOSE,
                    NON_TRANSPOSE,
                    scalar(&params.alpha),
                    a.0,
                    b.0,
                    scalar(&params.beta),
                    c.0,
                    ffi::CUDA_R_32F,
                    ffi::CUSPARSE_SDDMM_ALG_DEFAULT,
                    device_ptr(workspace.ptr()),
                )
            );
        }
        Ok(())
    }

    fn compute(
        &self,
        operation: &mut Operation<'_>,
        params: &MatmulParams,
        workspace: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()> {
        let described = Described::new(operation)?;
        let handle = self.bind(stream)?;
        let alpha = scalar(&params.alpha);
        let beta = scalar(&params.beta);
        let buffer = device_ptr(workspace.ptr());
        unsafe {
            match &described {
                Described::Spmm { a, b, c } => library_check!(
                    "cusparseSpMM",
                    ffi::cusparseSpMM(
                        handle,
                        NON_TRANSPOSE,
                        NON_TRANSPOSE,
                        alpha,
                        a.0,
                        b.0,
                        beta,
                        c.0,
                        ffi::CUDA_R_32F,
                        ffi::CUSPARSE_SPMM_ALG_DEFAULT,
                        buffer,
                    )
                ),
                Described::Sddmm { a, b, c } => library_check!(
                    "cusparseSDDMM",
                    ffi::cusparseSDDMM(
                        handle,
                        NON_TRANSPOSE,
                        NON_TRANSPOSE,
                        alpha,
                        a.0,
                        b.0,
                        beta,
                        c.0,
                        ffi::CUDA_R_32F,
                        ffi::CUSPARSE_SDDMM_ALG_DEFAULT,
                        buffer,
                    )
                ),
            }
        }
        Ok(())
    }
}
