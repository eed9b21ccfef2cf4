//! Device-event timing
//!
//! [`Timer`] moves through `Idle → Armed → Stopped`, each transition
//! consuming the previous state, so a timer cannot be read before it was
//! stopped or re-armed after it was read. Device events are authoritative;
//! the wall clock is kept only as a cross-check.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::error::BenchResult;
use serde::Serialize;

use crate::device::{DeviceRuntime, Event, Stream};
use crate::spec::{Dims, OperationKind, ProblemSpec};

pub struct Idle;
pub struct Armed;
pub struct Stopped;

/// Start/stop event pair around the timed section
pub struct Timer<S> {
    start: Event,
    stop: Event,
    wall_start: Option<Instant>,
    _state: PhantomData<S>,
}

impl Timer<Idle> {
    pub fn new(runtime: &Arc<dyn DeviceRuntime>) -> BenchResult<Self> {
        Ok(Self {
            start: Event::new(runtime)?,
            stop: Event::new(runtime)?,
            wall_start: None,
            _state: PhantomData,
        })
    }

    /// Record the start marker on `stream`
    pub fn start(self, stream: &Stream) -> BenchResult<Timer<Armed>> {
        let wall_start = Instant::now();
        self.start.record(stream)?;
        Ok(self.transition(Some(wall_start)))
    }
}

impl Timer<Armed> {
    /// Record the stop marker on `stream`
    pub fn stop(self, stream: &Stream) -> BenchResult<Timer<Stopped>> {
        self.stop.record(stream)?;
        let wall_start = self.wall_start;
        Ok(self.transition(wall_start))
    }
}

impl Timer<Stopped> {
    /// Block on the stop marker and read the elapsed time
    pub fn read(self) -> BenchResult<Elapsed> {
        self.stop.synchronize()?;
        let wall = self
            .wall_start
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let device_ms = self.stop.elapsed_since(&self.start)?;
        Ok(Elapsed { device_ms, wall })
    }
}

impl<S> Timer<S> {
    fn transition<T>(self, wall_start: Option<Instant>) -> Timer<T> {
        Timer {
            start: self.start,
            stop: self.stop,
            wall_start,
            _state: PhantomData,
        }
    }
}

/// Raw timer reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elapsed {
    pub device_ms: f32,
    pub wall: Duration,
}

/// Timing outcome of the single timed invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingResult {
    pub elapsed_ms: f64,
    pub throughput_gflops: f64,
    pub flop_count: u64,
    /// Host wall clock across the timed section, in microseconds
    pub wall_clock_us: u128,
}

impl TimingResult {
    pub fn new(elapsed: Elapsed, flop_count: u64) -> Self {
        let elapsed_ms = f64::from(elapsed.device_ms);
        Self {
            elapsed_ms,
            throughput_gflops: throughput_gflops(flop_count, elapsed_ms),
            flop_count,
            wall_clock_us: elapsed.wall.as_micros(),
        }
    }
}

/// `2 · flops / seconds / 1e9`; infinite when no time elapsed
pub fn throughput_gflops(flop_count: u64, elapsed_ms: f64) -> f64 {
    if elapsed_ms <= 0.0 {
        return f64::INFINITY;
    }
    2.0 * flop_count as f64 / (elapsed_ms / 1000.0) / 1e9
}

/// Multiply-accumulate count of one invocation
///
/// `nnz` is the actual number of stored entries of the sparse operand and
/// is ignored for dense kinds.
pub fn flop_count(spec: &ProblemSpec, nnz: usize) -> u64 {
    match (spec.kind(), spec.dims()) {
        (OperationKind::SpmmCsr, Dims::Sparse { b_cols, .. }) => nnz as u64 * b_cols as u64,
        (
            _,
            Dims::Sparse {
                a_rows,
                a_cols,
                b_cols,
            },
        ) => a_rows as u64 * b_cols as u64 * a_cols as u64,
        (_, Dims::Dense { m, n, k }) => m as u64 * n as u64 * k as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use std::collections::BTreeMap;

    fn spec(kind: OperationKind, pairs: &[(&str, &str)]) -> ProblemSpec {
        let args: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProblemSpec::from_named_args(kind, &args).unwrap()
    }

    #[test]
    fn test_throughput_formula() {
        let gflops = throughput_gflops(8, 1.0);
        assert!((gflops - 1.6e-5).abs() < 1e-12);
        assert!(throughput_gflops(8, 0.0).is_infinite());
    }

    #[test]
    fn test_flop_counts() {
        let gemm = spec(OperationKind::Gemm, &[("m", "2"), ("n", "3"), ("k", "4")]);
        assert_eq!(flop_count(&gemm, 0), 24);

        let spmm = spec(
            OperationKind::SpmmCsr,
            &[
                ("A_num_rows", "4"),
                ("A_num_cols", "4"),
                ("B_num_cols", "3"),
                ("A_sparsity", "0.5"),
            ],
        );
        assert_eq!(flop_count(&spmm, 9), 27);

        let sddmm = spec(
            OperationKind::SddmmCsr,
            &[
                ("A_num_rows", "4"),
                ("A_num_cols", "5"),
                ("B_num_cols", "6"),
                ("C_sparsity", "0.5"),
            ],
        );
        assert_eq!(flop_count(&sddmm, 12), 120);
    }

    #[test]
    fn test_timer_reads_after_stop() {
        let device = Arc::new(HostDevice::new());
        let runtime: Arc<dyn DeviceRuntime> = device.clone();
        let stream = Stream::new(&runtime).unwrap();

        let armed = Timer::new(&runtime).unwrap().start(&stream).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let elapsed = armed.stop(&stream).unwrap().read().unwrap();

        assert!(elapsed.device_ms >= 1.0);
        assert!(elapsed.wall >= Duration::from_millis(1));
        assert_eq!(device.ledger().live_events, 0);

        let timing = TimingResult::new(elapsed, 1_000_000);
        assert!(timing.throughput_gflops.is_finite());
        assert_eq!(timing.flop_count, 1_000_000);
    }
}
