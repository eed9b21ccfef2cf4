//! CUDA runtime, cuBLAS, cuSPARSE and cuSPARSELt bindings
//!
//! Only the entry points the benchmarks call are declared. Handles are kept
//! as raw pointers here and converted to integer handles at the
//! `DeviceRuntime` boundary.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_float, c_int, c_uint, c_void};

use crate::device::{DevicePtr, EventHandle, StreamHandle};

// ============================================================================
// CUDA runtime
// ============================================================================

pub type cudaError_t = c_int;
pub type cudaStream_t = *mut c_void;
pub type cudaEvent_t = *mut c_void;
pub type cudaDataType_t = c_int;

pub const cudaSuccess: cudaError_t = 0;
pub const cudaStreamNonBlocking: c_uint = 1;
pub const cudaDevAttrComputeCapabilityMajor: c_int = 75;
pub const cudaDevAttrComputeCapabilityMinor: c_int = 76;

pub const CUDA_R_32F: cudaDataType_t = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub enum cudaMemcpyKind {
    cudaMemcpyHostToDevice = 1,
    cudaMemcpyDeviceToHost = 2,
}

#[link(name = "cudart")]
extern "C" {
    pub fn cudaGetDeviceCount(count: *mut c_int) -> cudaError_t;
    pub fn cudaSetDevice(device: c_int) -> cudaError_t;
    pub fn cudaDeviceGetAttribute(value: *mut c_int, attr: c_int, device: c_int) -> cudaError_t;
    pub fn cudaDeviceSynchronize() -> cudaError_t;
    pub fn cudaGetErrorString(error: cudaError_t) -> *const c_char;

    pub fn cudaMalloc(devPtr: *mut *mut c_void, size: usize) -> cudaError_t;
    pub fn cudaFree(devPtr: *mut c_void) -> cudaError_t;
    pub fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: cudaMemcpyKind,
        stream: cudaStream_t,
    ) -> cudaError_t;
    pub fn cudaMemsetAsync(
        devPtr: *mut c_void,
        value: c_int,
        count: usize,
        stream: cudaStream_t,
    ) -> cudaError_t;

    pub fn cudaStreamCreateWithFlags(stream: *mut cudaStream_t, flags: c_uint) -> cudaError_t;
    pub fn cudaStreamSynchronize(stream: cudaStream_t) -> cudaError_t;
    pub fn cudaStreamDestroy(stream: cudaStream_t) -> cudaError_t;

    pub fn cudaEventCreate(event: *mut cudaEvent_t) -> cudaError_t;
    pub fn cudaEventRecord(event: cudaEvent_t, stream: cudaStream_t) -> cudaError_t;
    pub fn cudaEventSynchronize(event: cudaEvent_t) -> cudaError_t;
    pub fn cudaEventElapsedTime(
        ms: *mut c_float,
        start: cudaEvent_t,
        end: cudaEvent_t,
    ) -> cudaError_t;
    pub fn cudaEventDestroy(event: cudaEvent_t) -> cudaError_t;
}

/// Human-readable text for a runtime status
pub fn error_string(status: cudaError_t) -> String {
    // SAFETY: cudaGetErrorString returns a static NUL-terminated string.
    let text = unsafe { cudaGetErrorString(status) };
    if text.is_null() {
        return format!("CUDA error {status}");
    }
    let text = unsafe { CStr::from_ptr(text) };
    format!("{} ({status})", text.to_string_lossy())
}

pub fn device_ptr(ptr: DevicePtr) -> *mut c_void {
    ptr.0 as usize as *mut c_void
}

pub fn stream_ptr(stream: StreamHandle) -> cudaStream_t {
    stream.0 as usize as cudaStream_t
}

pub fn event_ptr(event: EventHandle) -> cudaEvent_t {
    event.0 as usize as cudaEvent_t
}

/// Return `ResourceFailure` from the enclosing function on a runtime error
macro_rules! cuda_check {
    ($operation:expr, $call:expr) => {{
        let status = $call;
        if status != $crate::ffi::cudaSuccess {
            return Err(common::error::BenchError::resource(
                $operation,
                $crate::ffi::error_string(status),
            ));
        }
    }};
}

/// Return `ComputeFailure` from the enclosing function on a library error
macro_rules! library_check {
    ($operation:expr, $call:expr) => {{
        let status = $call;
        if status != 0 {
            return Err(common::error::BenchError::compute($operation, status as i32));
        }
    }};
}

pub(crate) use cuda_check;
pub(crate) use library_check;

// ============================================================================
// cuBLAS
// ============================================================================

pub type cublasHandle_t = *mut c_void;
pub type cublasStatus_t = c_int;
pub type cublasOperation_t = c_int;

pub const CUBLAS_OP_N: cublasOperation_t = 0;
pub const CUBLAS_OP_T: cublasOperation_t = 1;

#[link(name = "cublas")]
extern "C" {
    pub fn cublasCreate_v2(handle: *mut cublasHandle_t) -> cublasStatus_t;
    pub fn cublasDestroy_v2(handle: cublasHandle_t) -> cublasStatus_t;
    pub fn cublasSetStream_v2(handle: cublasHandle_t, streamId: cudaStream_t) -> cublasStatus_t;
    pub fn cublasSetWorkspace_v2(
        handle: cublasHandle_t,
        workspace: *mut c_void,
        workspaceSizeInBytes: usize,
    ) -> cublasStatus_t;

    pub fn cublasSgemm_v2(
        handle: cublasHandle_t,
        transa: cublasOperation_t,
        transb: cublasOperation_t,
        m: c_int,
        n: c_int,
        k: c_int,
        alpha: *const c_float,
        A: *const c_float,
        lda: c_int,
        B: *const c_float,
        ldb: c_int,
        beta: *const c_float,
        C: *mut c_float,
        ldc: c_int,
    ) -> cublasStatus_t;
}

// ============================================================================
// cuSPARSE generic API
// ============================================================================

pub type cusparseHandle_t = *mut c_void;
pub type cusparseSpMatDescr_t = *mut c_void;
pub type cusparseDnMatDescr_t = *mut c_void;
pub type cusparseStatus_t = c_int;
pub type cusparseOperation_t = c_int;
pub type cusparseIndexType_t = c_int;
pub type cusparseIndexBase_t = c_int;
pub type cusparseOrder_t = c_int;
pub type cusparseSpMMAlg_t = c_int;
pub type cusparseSDDMMAlg_t = c_int;

pub const CUSPARSE_OPERATION_NON_TRANSPOSE: cusparseOperation_t = 0;
pub const CUSPARSE_INDEX_32I: cusparseIndexType_t = 2;
pub const CUSPARSE_INDEX_BASE_ZERO: cusparseIndexBase_t = 0;
pub const CUSPARSE_ORDER_COL: cusparseOrder_t = 1;
pub const CUSPARSE_SPMM_ALG_DEFAULT: cusparseSpMMAlg_t = 0;
pub const CUSPARSE_SDDMM_ALG_DEFAULT: cusparseSDDMMAlg_t = 0;

#[link(name = "cusparse")]
extern "C" {
    pub fn cusparseCreate(handle: *mut cusparseHandle_t) -> cusparseStatus_t;
    pub fn cusparseDestroy(handle: cusparseHandle_t) -> cusparseStatus_t;
    pub fn cusparseSetStream(handle: cusparseHandle_t, streamId: cudaStream_t) -> cusparseStatus_t;

    pub fn cusparseCreateCsr(
        spMatDescr: *mut cusparseSpMatDescr_t,
        rows: i64,
        cols: i64,
        nnz: i64,
        csrRowOffsets: *mut c_void,
        csrColInd: *mut c_void,
        csrValues: *mut c_void,
        csrRowOffsetsType: cusparseIndexType_t,
        csrColIndType: cusparseIndexType_t,
        idxBase: cusparseIndexBase_t,
        valueType: cudaDataType_t,
    ) -> cusparseStatus_t;
    pub fn cusparseDestroySpMat(spMatDescr: cusparseSpMatDescr_t) -> cusparseStatus_t;

    pub fn cusparseCreateDnMat(
        dnMatDescr: *mut cusparseDnMatDescr_t,
        rows: i64,
        cols: i64,
        ld: i64,
        values: *mut c_void,
        valueType: cudaDataType_t,
        order: cusparseOrder_t,
    ) -> cusparseStatus_t;
    pub fn cusparseDestroyDnMat(dnMatDescr: cusparseDnMatDescr_t) -> cusparseStatus_t;

    pub fn cusparseSpMM_bufferSize(
        handle: cusparseHandle_t,
        opA: cusparseOperation_t,
        opB: cusparseOperation_t,
        alpha: *const c_void,
        matA: cusparseSpMatDescr_t,
        matB: cusparseDnMatDescr_t,
        beta: *const c_void,
        matC: cusparseDnMatDescr_t,
        computeType: cudaDataType_t,
        alg: cusparseSpMMAlg_t,
        bufferSize: *mut usize,
    ) -> cusparseStatus_t;
    pub fn cusparseSpMM(
        handle: cusparseHandle_t,
        opA: cusparseOperation_t,
        opB: cusparseOperation_t,
        alpha: *const c_void,
        matA: cusparseSpMatDescr_t,
        matB: cusparseDnMatDescr_t,
        beta: *const c_void,
        matC: cusparseDnMatDescr_t,
        computeType: cudaDataType_t,
        alg: cusparseSpMMAlg_t,
        externalBuffer: *mut c_void,
    ) -> cusparseStatus_t;

    pub fn cusparseSDDMM_bufferSize(
        handle: cusparseHandle_t,
        opA: cusparseOperation_t,
        opB: cusparseOperation_t,
        alpha: *const c_void,
        matA: cusparseDnMatDescr_t,
        matB: cusparseDnMatDescr_t,
        beta: *const c_void,
        matC: cusparseSpMatDescr_t,
        computeType: cudaDataType_t,
        alg: cusparseSDDMMAlg_t,
        bufferSize: *mut usize,
    ) -> cusparseStatus_t;
    pub fn cusparseSDDMM_preprocess(
        handle: cusparseHandle_t,
        opA: cusparseOperation_t,
        opB: cusparseOperation_t,
        alpha: *const c_void,
        matA: cusparseDnMatDescr_t,
        matB: cusparseDnMatDescr_t,
        beta: *const c_void,
        matC: cusparseSpMatDescr_t,
        computeType: cudaDataType_t,
        alg: cusparseSDDMMAlg_t,
        externalBuffer: *mut c_void,
    ) -> cusparseStatus_t;
    pub fn cusparseSDDMM(
        handle: cusparseHandle_t,
        opA: cusparseOperation_t,
        opB: cusparseOperation_t,
        alpha: *const c_void,
        matA: cusparseDnMatDescr_t,
        matB: cusparseDnMatDescr_t,
        beta: *const c_void,
        matC: cusparseSpMatDescr_t,
        computeType: cudaDataType_t,
        alg: cusparseSDDMMAlg_t,
        externalBuffer: *mut c_void,
    ) -> cusparseStatus_t;
}

// ============================================================================
// cuSPARSELt
// ============================================================================

macro_rules! opaque_lt_struct {
    ($name:ident) => {
        #[repr(C, align(16))]
        pub struct $name {
            pub data: [u8; 1024],
        }

        impl $name {
            pub fn zeroed() -> Box<Self> {
                Box::new(Self { data: [0; 1024] })
            }
        }
    };
}

opaque_lt_struct!(cusparseLtHandle_t);
opaque_lt_struct!(cusparseLtMatDescriptor_t);
opaque_lt_struct!(cusparseLtMatmulDescriptor_t);
opaque_lt_struct!(cusparseLtMatmulAlgSelection_t);
opaque_lt_struct!(cusparseLtMatmulPlan_t);

pub type cusparseLtSparsity_t = c_int;
pub type cusparseComputeType = c_int;
pub type cusparseLtMatmulAlg_t = c_int;
pub type cusparseLtPruneAlg_t = c_int;

pub const CUSPARSELT_SPARSITY_50_PERCENT: cusparseLtSparsity_t = 0;
pub const CUSPARSE_COMPUTE_32F: cusparseComputeType = 2;
pub const CUSPARSELT_MATMUL_ALG_DEFAULT: cusparseLtMatmulAlg_t = 0;
pub const CUSPARSELT_PRUNE_SPMMA_TILE: cusparseLtPruneAlg_t = 0;

/// Byte alignment declared for every cuSPARSELt matrix
pub const CUSPARSELT_ALIGNMENT: u32 = 16;

#[link(name = "cusparseLt")]
extern "C" {
    pub fn cusparseLtInit(handle: *mut cusparseLtHandle_t) -> cusparseStatus_t;
    pub fn cusparseLtDestroy(handle: *const cusparseLtHandle_t) -> cusparseStatus_t;

    pub fn cusparseLtStructuredDescriptorInit(
        handle: *const cusparseLtHandle_t,
        matDescr: *mut cusparseLtMatDescriptor_t,
        rows: i64,
        cols: i64,
        ld: i64,
        alignment: u32,
        valueType: cudaDataType_t,
        order: cusparseOrder_t,
        sparsity: cusparseLtSparsity_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtDenseDescriptorInit(
        handle: *const cusparseLtHandle_t,
        matDescr: *mut cusparseLtMatDescriptor_t,
        rows: i64,
        cols: i64,
        ld: i64,
        alignment: u32,
        valueType: cudaDataType_t,
        order: cusparseOrder_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtMatDescriptorDestroy(
        matDescr: *const cusparseLtMatDescriptor_t,
    ) -> cusparseStatus_t;

    pub fn cusparseLtMatmulDescriptorInit(
        handle: *const cusparseLtHandle_t,
        matmulDescr: *mut cusparseLtMatmulDescriptor_t,
        opA: cusparseOperation_t,
        opB: cusparseOperation_t,
        matA: *const cusparseLtMatDescriptor_t,
        matB: *const cusparseLtMatDescriptor_t,
        matC: *const cusparseLtMatDescriptor_t,
        matD: *const cusparseLtMatDescriptor_t,
        computeType: cusparseComputeType,
    ) -> cusparseStatus_t;
    pub fn cusparseLtMatmulAlgSelectionInit(
        handle: *const cusparseLtHandle_t,
        algSelection: *mut cusparseLtMatmulAlgSelection_t,
        matmulDescr: *const cusparseLtMatmulDescriptor_t,
        alg: cusparseLtMatmulAlg_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtMatmulPlanInit(
        handle: *const cusparseLtHandle_t,
        plan: *mut cusparseLtMatmulPlan_t,
        matmulDescr: *const cusparseLtMatmulDescriptor_t,
        algSelection: *const cusparseLtMatmulAlgSelection_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtMatmulPlanDestroy(plan: *const cusparseLtMatmulPlan_t) -> cusparseStatus_t;
    pub fn cusparseLtMatmulGetWorkspace(
        handle: *const cusparseLtHandle_t,
        plan: *const cusparseLtMatmulPlan_t,
        workspaceSize: *mut usize,
    ) -> cusparseStatus_t;

    pub fn cusparseLtSpMMAPrune(
        handle: *const cusparseLtHandle_t,
        matmulDescr: *const cusparseLtMatmulDescriptor_t,
        d_in: *const c_void,
        d_out: *mut c_void,
        pruneAlg: cusparseLtPruneAlg_t,
        stream: cudaStream_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtSpMMAPruneCheck(
        handle: *const cusparseLtHandle_t,
        matmulDescr: *const cusparseLtMatmulDescriptor_t,
        d_in: *const c_void,
        d_valid: *mut c_int,
        stream: cudaStream_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtSpMMACompressedSize(
        handle: *const cusparseLtHandle_t,
        plan: *const cusparseLtMatmulPlan_t,
        compressedSize: *mut usize,
        compressedBufferSize: *mut usize,
    ) -> cusparseStatus_t;
    pub fn cusparseLtSpMMACompress(
        handle: *const cusparseLtHandle_t,
        plan: *const cusparseLtMatmulPlan_t,
        d_dense: *const c_void,
        d_compressed: *mut c_void,
        d_compressed_buffer: *mut c_void,
        stream: cudaStream_t,
    ) -> cusparseStatus_t;
    pub fn cusparseLtMatmul(
        handle: *const cusparseLtHandle_t,
        plan: *const cusparseLtMatmulPlan_t,
        alpha: *const c_void,
        d_A: *const c_void,
        d_B: *const c_void,
        beta: *const c_void,
        d_C: *const c_void,
        d_D: *mut c_void,
        workspace: *mut c_void,
        streams: *mut cudaStream_t,
        numStreams: i32,
    ) -> cusparseStatus_t;
}
