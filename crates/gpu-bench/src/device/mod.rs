//! Device runtime abstraction and RAII resource wrappers
//!
//! Every allocation, stream and event is owned by a wrapper that releases it
//! in `Drop`, so every exit path of a run, early failures included, gives
//! back what it took. Host memory handed to an asynchronous copy stays
//! borrowed by a [`Transfer`] guard until the stream has been synchronized.

pub mod host;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod matrix;

pub use host::{AllocationLedger, HostDevice};
#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;
pub use matrix::{DeviceCompressed, DeviceCsr, DeviceDense};

use std::marker::PhantomData;
use std::sync::Arc;

use common::error::{BenchError, BenchResult};
use serde::Serialize;
use tracing::warn;

/// Opaque device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Identity and capability of the selected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub ordinal: u32,
    /// `(major, minor)`
    pub compute_capability: (u32, u32),
}

/// Minimal device runtime surface the harness relies on.
///
/// Implementations must be usable from any thread; all handles are plain
/// integers so wrappers stay `Send`.
pub trait DeviceRuntime: Send + Sync {
    fn describe(&self) -> DeviceInfo;

    fn allocate(&self, bytes: usize) -> BenchResult<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> BenchResult<()>;

    /// Non-blocking stream
    fn create_stream(&self) -> BenchResult<StreamHandle>;
    fn synchronize_stream(&self, stream: StreamHandle) -> BenchResult<()>;
    fn destroy_stream(&self, stream: StreamHandle) -> BenchResult<()>;

    /// Enqueue a host to device copy.
    ///
    /// # Safety
    /// `src` must be valid for reads of `bytes` until `stream` is synchronized.
    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()>;

    /// Enqueue a device to host copy.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `bytes` until `stream` is synchronized.
    unsafe fn copy_to_host_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()>;

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()>;

    fn create_event(&self) -> BenchResult<EventHandle>;
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> BenchResult<()>;
    fn synchronize_event(&self, event: EventHandle) -> BenchResult<()>;
    /// Milliseconds between two recorded events
    fn elapsed_ms(&self, start: EventHandle, stop: EventHandle) -> BenchResult<f32>;
    fn destroy_event(&self, event: EventHandle) -> BenchResult<()>;

    fn synchronize_device(&self) -> BenchResult<()>;
}

/// Plain-old-data element types that may be copied bytewise to a device.
///
/// # Safety
/// Implementors must have no padding, no invalid bit patterns and no
/// pointers.
pub unsafe trait DeviceCopy: Copy + Send + Sync + 'static {}

unsafe impl DeviceCopy for f32 {}
unsafe impl DeviceCopy for i32 {}
unsafe impl DeviceCopy for u8 {}

/// Dedicated stream owned by one run
pub struct Stream {
    runtime: Arc<dyn DeviceRuntime>,
    handle: StreamHandle,
}

impl Stream {
    pub fn new(runtime: &Arc<dyn DeviceRuntime>) -> BenchResult<Self> {
        let handle = runtime.create_stream()?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Block until all work queued on this stream has finished
    pub fn synchronize(&self) -> BenchResult<()> {
        self.runtime.synchronize_stream(self.handle)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.destroy_stream(self.handle) {
            warn!("Failed to destroy stream {:?}: {}", self.handle, e);
        }
    }
}

/// Device event used as a timing marker
pub struct Event {
    runtime: Arc<dyn DeviceRuntime>,
    handle: EventHandle,
}

impl Event {
    pub fn new(runtime: &Arc<dyn DeviceRuntime>) -> BenchResult<Self> {
        let handle = runtime.create_event()?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            handle,
        })
    }

    pub fn record(&self, stream: &Stream) -> BenchResult<()> {
        self.runtime.record_event(self.handle, stream.handle())
    }

    pub fn synchronize(&self) -> BenchResult<()> {
        self.runtime.synchronize_event(self.handle)
    }

    /// Milliseconds from `start` to this event; both must have been recorded
    pub fn elapsed_since(&self, start: &Event) -> BenchResult<f32> {
        self.runtime.elapsed_ms(start.handle, self.handle)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.destroy_event(self.handle) {
            warn!("Failed to destroy event {:?}: {}", self.handle, e);
        }
    }
}

/// Typed device allocation, freed exactly once on drop
pub struct DeviceBuffer<T: DeviceCopy> {
    runtime: Arc<dyn DeviceRuntime>,
    ptr: DevicePtr,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: DeviceCopy> DeviceBuffer<T> {
    /// Allocate room for `len` elements; contents are unspecified
    pub fn new(runtime: &Arc<dyn DeviceRuntime>, len: usize) -> BenchResult<Self> {
        let ptr = runtime.allocate(len * std::mem::size_of::<T>())?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Enqueue an upload of `host`, which must match the buffer length
    pub fn upload<'a>(&'a mut self, host: &'a [T], stream: &'a Stream) -> BenchResult<Transfer<'a>> {
        self.check_len(host.len(), "upload")?;
        // SAFETY: `host` stays borrowed by the returned guard until the
        // stream is synchronized.
        unsafe {
            self.runtime.copy_to_device_async(
                self.ptr,
                host.as_ptr().cast::<u8>(),
                self.size_bytes(),
                stream.handle(),
            )?;
        }
        Ok(Transfer::new(stream))
    }

    /// Enqueue a download into `host`, which must match the buffer length
    pub fn download<'a>(&'a self, host: &'a mut [T], stream: &'a Stream) -> BenchResult<Transfer<'a>> {
        self.check_len(host.len(), "download")?;
        // SAFETY: `host` stays mutably borrowed by the returned guard until
        // the stream is synchronized.
        unsafe {
            self.runtime.copy_to_host_async(
                host.as_mut_ptr().cast::<u8>(),
                self.ptr,
                self.size_bytes(),
                stream.handle(),
            )?;
        }
        Ok(Transfer::new(stream))
    }

    /// Download into a fresh vector and wait for it
    pub fn to_vec(&self, stream: &Stream) -> BenchResult<Vec<T>>
    where
        T: Default,
    {
        let mut host = vec![T::default(); self.len];
        self.download(&mut host, stream)?.wait()?;
        Ok(host)
    }

    /// Enqueue a zero fill
    pub fn zero(&mut self, stream: &Stream) -> BenchResult<()> {
        self.runtime
            .memset_async(self.ptr, 0, self.size_bytes(), stream.handle())
    }

    fn check_len(&self, host_len: usize, operation: &str) -> BenchResult<()> {
        if host_len != self.len {
            return Err(BenchError::resource(
                operation,
                format!(
                    "host slice holds {} elements, device buffer {}",
                    host_len, self.len
                ),
            ));
        }
        Ok(())
    }
}

impl<T: DeviceCopy> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.free(self.ptr) {
            warn!("Failed to free device buffer {:?}: {}", self.ptr, e);
        }
    }
}

impl<T: DeviceCopy> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Pending copies on one stream.
///
/// Holds the host-side borrow until [`Transfer::wait`] or drop synchronizes
/// the stream.
#[must_use = "a transfer must be waited on before the host data is used"]
pub struct Transfer<'a> {
    stream: &'a Stream,
    completed: bool,
    _host: PhantomData<&'a mut [u8]>,
}

impl<'a> Transfer<'a> {
    fn new(stream: &'a Stream) -> Self {
        Self {
            stream,
            completed: false,
            _host: PhantomData,
        }
    }

    /// Merge with another pending transfer; one wait then covers both
    ///
    /// A transfer on a different stream is synchronized right away.
    pub fn join(self, mut other: Transfer<'a>) -> Transfer<'a> {
        if self.stream.handle() == other.stream.handle() {
            other.completed = true;
        }
        self
    }

    /// Block until the copies have landed
    pub fn wait(mut self) -> BenchResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> BenchResult<()> {
        self.completed = true;
        self.stream.synchronize()
    }
}

impl Drop for Transfer<'_> {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(e) = self.stream.synchronize() {
                warn!("Failed to synchronize abandoned transfer: {}", e);
            }
        }
    }
}
