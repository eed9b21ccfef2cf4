//! Host-simulated device runtime
//!
//! Device memory lives in host vectors keyed by fake addresses. Copies
//! complete at enqueue time, so synchronizing a stream only checks that it
//! exists. Every allocation, stream and event goes through a ledger that
//! tests use to prove nothing leaks, and faults can be injected to exercise
//! error paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use common::error::{BenchError, BenchResult};
use serde::Serialize;
use tracing::debug;

use super::{DeviceCopy, DeviceInfo, DevicePtr, DeviceRuntime, EventHandle, StreamHandle};

/// Addresses start here so a zero pointer is never handed out
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;

/// Snapshot of resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationLedger {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
    pub live_streams: usize,
    pub live_events: usize,
}

impl AllocationLedger {
    /// No allocation, stream or event outstanding
    pub fn is_balanced(&self) -> bool {
        self.live_allocations == 0
            && self.live_bytes == 0
            && self.live_streams == 0
            && self.live_events == 0
            && self.total_allocations == self.total_frees
    }
}

#[derive(Default)]
struct HostState {
    next_address: u64,
    next_handle: u64,
    memory: HashMap<u64, Vec<u8>>,
    streams: HashSet<u64>,
    events: HashMap<u64, Option<Instant>>,
    ledger: AllocationLedger,
    allocations_left: Option<usize>,
    fail_transfers: bool,
}

/// Device runtime backed by host memory
pub struct HostDevice {
    ordinal: u32,
    compute_capability: (u32, u32),
    state: Mutex<HostState>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    /// Simulated device reporting compute capability 8.0
    pub fn new() -> Self {
        Self::with_compute_capability(8, 0)
    }

    pub fn with_compute_capability(major: u32, minor: u32) -> Self {
        Self {
            ordinal: 0,
            compute_capability: (major, minor),
            state: Mutex::new(HostState {
                next_address: BASE_ADDRESS,
                next_handle: 1,
                ..HostState::default()
            }),
        }
    }

    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn ledger(&self) -> AllocationLedger {
        self.lock().ledger
    }

    /// Let `n` more allocations succeed, then fail every one after
    pub fn fail_allocations_after(&self, n: usize) {
        self.lock().allocations_left = Some(n);
    }

    /// Make every subsequent copy and memset fail
    pub fn fail_transfers(&self) {
        self.lock().fail_transfers = true;
    }

    /// Clear injected faults
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.allocations_left = None;
        state.fail_transfers = false;
    }

    /// Kernel-side read of a whole allocation
    pub fn read<T: DeviceCopy + Default>(&self, ptr: DevicePtr, len: usize) -> BenchResult<Vec<T>> {
        let state = self.lock();
        let bytes = len * std::mem::size_of::<T>();
        let memory = region(&state, ptr, bytes, "device read")?;
        let mut out = vec![T::default(); len];
        // SAFETY: `T: DeviceCopy` is plain old data and `out` holds exactly
        // `bytes` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(memory.as_ptr(), out.as_mut_ptr().cast::<u8>(), bytes);
        }
        Ok(out)
    }

    /// Kernel-side write to the start of an allocation
    pub fn write<T: DeviceCopy>(&self, ptr: DevicePtr, values: &[T]) -> BenchResult<()> {
        let mut state = self.lock();
        let bytes = std::mem::size_of_val(values);
        let memory = region_mut(&mut state, ptr, bytes, "device write")?;
        // SAFETY: `T: DeviceCopy` is plain old data; `memory` holds at least
        // `bytes` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr().cast::<u8>(), memory.as_mut_ptr(), bytes);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        // A panicking test must not wedge the ledger for the checks that follow
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_handle(state: &mut HostState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    fn check_stream(state: &HostState, stream: StreamHandle) -> BenchResult<()> {
        if !state.streams.contains(&stream.0) {
            return Err(BenchError::resource(
                "stream",
                format!("unknown stream {:?}", stream),
            ));
        }
        Ok(())
    }

    fn check_transfer(state: &HostState, operation: &str) -> BenchResult<()> {
        if state.fail_transfers {
            return Err(BenchError::resource(operation, "injected transfer failure"));
        }
        Ok(())
    }
}

fn region<'s>(
    state: &'s HostState,
    ptr: DevicePtr,
    bytes: usize,
    operation: &str,
) -> BenchResult<&'s [u8]> {
    let memory = state
        .memory
        .get(&ptr.0)
        .ok_or_else(|| BenchError::resource(operation, format!("invalid pointer {:#x}", ptr.0)))?;
    memory.get(..bytes).ok_or_else(|| {
        BenchError::resource(
            operation,
            format!("{bytes} bytes exceed allocation of {}", memory.len()),
        )
    })
}

fn region_mut<'s>(
    state: &'s mut HostState,
    ptr: DevicePtr,
    bytes: usize,
    operation: &str,
) -> BenchResult<&'s mut [u8]> {
    let memory = state
        .memory
        .get_mut(&ptr.0)
        .ok_or_else(|| BenchError::resource(operation, format!("invalid pointer {:#x}", ptr.0)))?;
    let len = memory.len();
    memory.get_mut(..bytes).ok_or_else(|| {
        BenchError::resource(
            operation,
            format!("{bytes} bytes exceed allocation of {len}"),
        )
    })
}

impl DeviceRuntime for HostDevice {
    fn describe(&self) -> DeviceInfo {
        DeviceInfo {
            name: "host-simulated device".to_string(),
            ordinal: self.ordinal,
            compute_capability: self.compute_capability,
        }
    }

    fn allocate(&self, bytes: usize) -> BenchResult<DevicePtr> {
        let mut state = self.lock();
        if let Some(left) = state.allocations_left.as_mut() {
            if *left == 0 {
                return Err(BenchError::resource(
                    "allocate",
                    format!("injected allocation failure ({bytes} bytes)"),
                ));
            }
            *left -= 1;
        }

        let address = state.next_address;
        let span = (bytes as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.memory.insert(address, vec![0u8; bytes]);
        state.ledger.live_allocations += 1;
        state.ledger.live_bytes += bytes;
        state.ledger.total_allocations += 1;
        debug!("Allocated {} bytes at {:#x}", bytes, address);
        Ok(DevicePtr(address))
    }

    fn free(&self, ptr: DevicePtr) -> BenchResult<()> {
        let mut state = self.lock();
        let memory = state
            .memory
            .remove(&ptr.0)
            .ok_or_else(|| BenchError::resource("free", format!("invalid pointer {:#x}", ptr.0)))?;
        state.ledger.live_allocations -= 1;
        state.ledger.live_bytes -= memory.len();
        state.ledger.total_frees += 1;
        Ok(())
    }

    fn create_stream(&self) -> BenchResult<StreamHandle> {
        let mut state = self.lock();
        let handle = Self::next_handle(&mut state);
        state.streams.insert(handle);
        state.ledger.live_streams += 1;
        Ok(StreamHandle(handle))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> BenchResult<()> {
        Self::check_stream(&self.lock(), stream)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> BenchResult<()> {
        let mut state = self.lock();
        if !state.streams.remove(&stream.0) {
            return Err(BenchError::resource(
                "destroy stream",
                format!("unknown stream {:?}", stream),
            ));
        }
        state.ledger.live_streams -= 1;
        Ok(())
    }

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()> {
        let mut state = self.lock();
        Self::check_stream(&state, stream)?;
        Self::check_transfer(&state, "copy to device")?;
        let memory = region_mut(&mut state, dst, bytes, "copy to device")?;
        std::ptr::copy_nonoverlapping(src, memory.as_mut_ptr(), bytes);
        Ok(())
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()> {
        let state = self.lock();
        Self::check_stream(&state, stream)?;
        Self::check_transfer(&state, "copy to host")?;
        let memory = region(&state, src, bytes, "copy to host")?;
        std::ptr::copy_nonoverlapping(memory.as_ptr(), dst, bytes);
        Ok(())
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> BenchResult<()> {
        let mut state = self.lock();
        Self::check_stream(&state, stream)?;
        Self::check_transfer(&state, "memset")?;
        region_mut(&mut state, dst, bytes, "memset")?.fill(value);
        Ok(())
    }

    fn create_event(&self) -> BenchResult<EventHandle> {
        let mut state = self.lock();
        let handle = Self::next_handle(&mut state);
        state.events.insert(handle, None);
        state.ledger.live_events += 1;
        Ok(EventHandle(handle))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> BenchResult<()> {
        let mut state = self.lock();
        Self::check_stream(&state, stream)?;
        let slot = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| BenchError::resource("record event", format!("unknown event {:?}", event)))?;
        *slot = Some(Instant::now());
        Ok(())
    }

    fn synchronize_event(&self, event: EventHandle) -> BenchResult<()> {
        match self.lock().events.get(&event.0) {
            Some(_) => Ok(()),
            None => Err(BenchError::resource(
                "synchronize event",
                format!("unknown event {:?}", event),
            )),
        }
    }

    fn elapsed_ms(&self, start: EventHandle, stop: EventHandle) -> BenchResult<f32> {
        let state = self.lock();
        let recorded = |event: EventHandle| {
            state.events.get(&event.0).copied().flatten().ok_or_else(|| {
                BenchError::resource("elapsed time", format!("event {:?} was never recorded", event))
            })
        };
        let (start, stop) = (recorded(start)?, recorded(stop)?);
        Ok(stop.saturating_duration_since(start).as_secs_f32() * 1000.0)
    }

    fn destroy_event(&self, event: EventHandle) -> BenchResult<()> {
        let mut state = self.lock();
        if state.events.remove(&event.0).is_none() {
            return Err(BenchError::resource(
                "destroy event",
                format!("unknown event {:?}", event),
            ));
        }
        state.ledger.live_events -= 1;
        Ok(())
    }

    fn synchronize_device(&self) -> BenchResult<()> {
        Ok(())
    }
}
