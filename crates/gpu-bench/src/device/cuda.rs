//! CUDA runtime implementation of [`DeviceRuntime`]

use std::os::raw::{c_int, c_void};

use common::error::{BenchError, BenchResult};
use tracing::{debug, info};

use super::{DeviceInfo, DevicePtr, DeviceRuntime, EventHandle, StreamHandle};
use crate::ffi::{self, cuda_check, device_ptr as raw, event_ptr as raw_event, stream_ptr as raw_stream};

/// One CUDA device, selected at construction
pub struct CudaDevice {
    ordinal: u32,
    compute_capability: (u32, u32),
}

impl CudaDevice {
    /// Select device `ordinal` and query its compute capability
    pub fn new(ordinal: u32) -> BenchResult<Self> {
        let mut count: c_int = 0;
        unsafe {
            cuda_check!("cudaGetDeviceCount", ffi::cudaGetDeviceCount(&mut count));
        }
        if ordinal as c_int >= count {
            return Err(BenchError::unsupported(format!(
                "device {ordinal} requested but {count} CUDA device(s) present"
            )));
        }

        let device = ordinal as c_int;
        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        unsafe {
            cuda_check!("cudaSetDevice", ffi::cudaSetDevice(device));
            cuda_check!(
                "cudaDeviceGetAttribute",
                ffi::cudaDeviceGetAttribute(&mut major, ffi::cudaDevAttrComputeCapabilityMajor, device)
            );
            cuda_check!(
                "cudaDeviceGetAttribute",
                ffi::cudaDeviceGetAttribute(&mut minor, ffi::cudaDevAttrComputeCapabilityMinor, device)
            );
        }

        info!("Using CUDA device {} (SM {}.{})", ordinal, major, minor);
        Ok(Self {
            ordinal,
            compute_capability: (major as u32, minor as u32),
        })
    }
}

impl DeviceRuntime for CudaDevice {
    fn describe(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("CUDA device {}", self.ordinal),
            ordinal: self.ordinal,
            compute_capability: self.compute_capability,
        }
    }

    fn allocate(&self, bytes: usize) -> BenchResult<DevicePtr> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        unsafe {
            cuda_check!("cudaMalloc", ffi::cudaMalloc(&mut ptr, bytes));
        }
        debug!("cudaMalloc {} bytes at {:p}", bytes, ptr);
        Ok(DevicePtr(ptr as usize as u64))
    }

    fn free(&self, ptr: DevicePtr) -> BenchResult<()> {
        unsafe {
            cuda_check!("cudaFree", ffi::cudaFree(raw(ptr)));
        }
        Ok(())
    }

    fn create_stream(&self) -> BenchResult<StreamHandle> {
        let mut stream: ffi::cudaStream_t = std::ptr::null_mut();
        unsafe {
            cuda_check!(
                "cudaStreamCreateWithFlags",
                ffi::cudaStreamCreateWithFlags(&mut stream, ffi::cudaStreamNonBlocking)
            );
        }
        Ok(StreamHandle(stream as usize as u64))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> BenchResult<()> {
        unsafe {
            cuda_check!("cudaStreamSynchronize", ffi::cudaStreamSynchronize(raw_stream(stream)));
        }
        Ok(())
    }

    fn destroy_stream(&self, stream: StreamHandle) -> BenchResult<()> {
        unsafe {
            cuda_check!("cudaStreamDestroy", ffi::cudaStreamDestroy(raw_stream(stream)));
        }
        Ok(())
    }

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()> {
        cuda_check!(
            "cudaMemcpyAsync",
            ffi::cudaMemcpyAsync(
                raw(dst),
                src.cast::<c_void>(),
                bytes,
                ffi::cudaMemcpyKind::cudaMemcpyHostToDevice,
                raw_stream(stream),
            )
        );
        Ok(())
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()> {
        cuda_check!(
            "cudaMemcpyAsync",
            ffi::cudaMemcpyAsync(
                dst.cast::<c_void>(),
                raw(src),
                bytes,
                ffi::cudaMemcpyKind::cudaMemcpyDeviceToHost,
                raw_stream(stream),
            )
        );
        Ok(())
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()> {
        unsafe {
            cuda_check!(
                "cudaMemsetAsync",
                ffi::cudaMemsetAsync(raw(dst), c_int::from(value), bytes, raw_stream(stream))
            );
        }
        Ok(())
    }

    fn create_event(&self) -> BenchResult<EventHandle> {
        let mut event: ffi::cudaEvent_t = std::ptr::null_mut();
        unsafe {
            cuda_check!("cudaEventCreate", ffi::cudaEventCreate(&mut event));
        }
        Ok(EventHandle(event as usize as u64))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> BenchResult<()> {
        unsafe {
            cuda_check!(
                "cudaEventRecord",
                ffi::cudaEventRecord(raw_event(event), raw_stream(stream))
            );
        }
        Ok(())
    }

    fn synchronize_event(&self, event: EventHandle) -> BenchResult<()> {
        unsafe {
            cuda_check!("cudaEventSynchronize", ffi::cudaEventSynchronize(raw_event(event)));
        }
        Ok(())
    }

    fn elapsed_ms(&self, start: EventHandle, stop: EventHandle) -> BenchResult<f32> {
        let mut elapsed: f32 = 0.0;
        unsafe {
            cuda_check!(
                "cudaEventElapsedTime",
                ffi::cudaEventElapsedTime(&mut elapsed, raw_event(start), raw_event(stop))
            );
        }
        Ok(elapsed)
    }

    fn destroy_event(&self, event: EventHandle) -> BenchResult<()> {
        unsafe {
            cuda_check!("cudaEventDestroy", ffi::cudaEventDestroy(raw_event(event)));
        }
        Ok(())
    }

    fn synchronize_device(&self) -> BenchResult<()> {
        unsafe {
            cuda_check!("cudaDeviceSynchronize", ffi::cudaDeviceSynchronize());
        }
        Ok(())
    }
}
