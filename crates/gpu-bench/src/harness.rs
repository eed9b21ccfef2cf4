//! Benchmark run lifecycle
//!
//! A run walks a fixed sequence of [`Stage`]s:
//!
//! ```text
//! ParseSpec → CheckDevice → GenerateHostData → AllocateDevice → TransferIn
//!   → [Prune] → QueryWorkspace → Invoke → [TransferOut → Verify → Dump]
//!   → ReleaseAll
//! ```
//!
//! Device memory, streams and events are RAII values owned by the run, so a
//! failure at any stage still releases everything acquired so far. Errors
//! carry the stage that produced them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use common::config::{BenchConfig, GeneratorConfig};
use common::error::{BenchError, BenchFailure, BenchResult};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::compute::{
    check_structured_support, ComputeInvoker, Operation, ReferenceInvoker, StructuredShape,
    StructuredSparsity,
};
use crate::device::{
    DeviceBuffer, DeviceCompressed, DeviceCsr, DeviceDense, DeviceInfo, DeviceRuntime, HostDevice,
    Stream, Transfer,
};
use crate::dump::{DumpArtifacts, ResultDumper};
use crate::matrix::{DenseMatrix, HostMatrix, RandomMatrixGenerator, SamplingMode};
use crate::spec::{Dims, OperationKind, ProblemSpec};
use crate::timing::{flop_count, Timer, TimingResult};
use crate::verify::{compare_results, reference_result, Tolerance, VerificationSummary};

/// Step of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ParseSpec,
    CheckDevice,
    GenerateHostData,
    AllocateDevice,
    TransferIn,
    Prune,
    QueryWorkspace,
    Invoke,
    TransferOut,
    Verify,
    Dump,
    ReleaseAll,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ParseSpec => "parse spec",
            Self::CheckDevice => "check device",
            Self::GenerateHostData => "generate host data",
            Self::AllocateDevice => "allocate device memory",
            Self::TransferIn => "transfer to device",
            Self::Prune => "prune and compress",
            Self::QueryWorkspace => "query workspace",
            Self::Invoke => "invoke",
            Self::TransferOut => "transfer to host",
            Self::Verify => "verify",
            Self::Dump => "dump",
            Self::ReleaseAll => "release",
        };
        f.write_str(name)
    }
}

/// Failure of a run, tagged with the stage it happened in
#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct HarnessError {
    pub stage: Stage,
    #[source]
    pub source: BenchError,
}

impl BenchFailure for HarnessError {
    fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, HarnessError>;
}

impl<T> AtStage<T> for BenchResult<T> {
    fn at(self, stage: Stage) -> Result<T, HarnessError> {
        self.map_err(|source| HarnessError { stage, source })
    }
}

/// Host copies of the three operands as they were handed to the device.
///
/// For the structured kind `a` is replaced by the pruned matrix once the
/// prune stage has run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostOperands {
    pub a: HostMatrix,
    pub b: DenseMatrix,
    pub c: HostMatrix,
}

/// Device runtime plus the invokers that run on it
pub struct Backend {
    name: String,
    runtime: Arc<dyn DeviceRuntime>,
    invoker: Arc<dyn ComputeInvoker>,
    structured: Option<Arc<dyn StructuredSparsity>>,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        runtime: Arc<dyn DeviceRuntime>,
        invoker: Arc<dyn ComputeInvoker>,
    ) -> Self {
        Self {
            name: name.into(),
            runtime,
            invoker,
            structured: None,
        }
    }

    pub fn with_structured(mut self, structured: Arc<dyn StructuredSparsity>) -> Self {
        self.structured = Some(structured);
        self
    }

    /// Host-simulated device with the reference kernels
    pub fn reference(device: Arc<HostDevice>) -> Self {
        let invoker = Arc::new(ReferenceInvoker::new(Arc::clone(&device)));
        let runtime: Arc<dyn DeviceRuntime> = device;
        Self::new("reference", runtime, invoker.clone()).with_structured(invoker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }
}

/// Knobs that come from configuration rather than the problem itself
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub generator: GeneratorConfig,
    pub warmup_iterations: u32,
    /// Seed used when the problem gives none
    pub seed: Option<u64>,
    /// Verify every run, not only those that ask for it
    pub verify: bool,
    pub tolerance: Tolerance,
}

impl HarnessOptions {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            generator: config.generator.clone(),
            warmup_iterations: config.harness.warmup_iterations,
            seed: config.seed,
            verify: config.verify.enabled,
            tolerance: Tolerance::from(&config.verify),
        }
    }
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self::from_config(&BenchConfig::default())
    }
}

/// Everything a finished run produced
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub kind: OperationKind,
    pub device: DeviceInfo,
    pub backend: String,
    pub seed: u64,
    /// Stored entries of the sparse operand
    pub actual_nnz: Option<usize>,
    pub timing: TimingResult,
    #[serde(skip)]
    pub operands: HostOperands,
    /// Downloaded output, present when verifying or dumping
    #[serde(skip)]
    pub result: Option<HostMatrix>,
    pub verification: Option<VerificationSummary>,
    pub dump: Option<DumpArtifacts>,
}

/// Drives one problem through the stages against a backend
pub struct Harness {
    backend: Backend,
    options: HarnessOptions,
}

impl Harness {
    pub fn new(backend: Backend, options: HarnessOptions) -> Self {
        Self { backend, options }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Parse named arguments, then run
    pub fn run_named(
        &self,
        kind: OperationKind,
        args: &BTreeMap<String, String>,
    ) -> Result<RunReport, HarnessError> {
        let spec = ProblemSpec::from_named_args(kind, args).at(Stage::ParseSpec)?;
        self.run(&spec)
    }

    pub fn run(&self, spec: &ProblemSpec) -> Result<RunReport, HarnessError> {
        let runtime = self.backend.runtime();
        let invoker = self.backend.invoker.as_ref();
        let params = spec.params();

        // Check device
        let device = runtime.describe();
        let structured = if spec.kind() == OperationKind::StructuredSpmm {
            check_structured_support(&device).at(Stage::CheckDevice)?;
            let structured = self.backend.structured.as_deref().ok_or_else(|| {
                BenchError::unsupported(format!(
                    "backend {} has no structured sparsity support",
                    self.backend.name
                ))
            });
            Some(structured.at(Stage::CheckDevice)?)
        } else {
            None
        };
        info!(
            "Running {} on {} ({}, SM {}.{})",
            spec.kind(),
            device.name,
            self.backend.name,
            device.compute_capability.0,
            device.compute_capability.1
        );

        // Generate host data
        let mut generator =
            RandomMatrixGenerator::new(spec.seed().or(self.options.seed), &self.options.generator)
                .at(Stage::GenerateHostData)?;
        let mut host = generate_operands(spec, &mut generator).at(Stage::GenerateHostData)?;
        let actual_nnz = host.a.as_csr().or_else(|| host.c.as_csr()).map(|m| m.nnz());
        if let (Some(requested), Some(actual)) = (spec.requested_nnz(), actual_nnz) {
            debug!("Sparse operand: requested nnz {}, actual nnz {}", requested, actual);
        }

        // Allocate device
        let stream = Stream::new(runtime).at(Stage::AllocateDevice)?;
        let mut operands = DeviceOperands::allocate(runtime, &host).at(Stage::AllocateDevice)?;

        // Transfer in
        operands
            .upload(&host, &stream)
            .and_then(Transfer::wait)
            .at(Stage::TransferIn)?;

        // Prune, validate and compress the structured operand
        let compressed = match structured {
            Some(structured) => {
                let (compressed, pruned) =
                    prepare_structured(structured, spec, runtime, &mut operands, &stream)
                        .at(Stage::Prune)?;
                host.a = pruned.into();
                Some(compressed)
            }
            None => None,
        };

        // Query workspace
        let workspace_bytes = {
            let operation = operands.operation(compressed.as_ref()).at(Stage::QueryWorkspace)?;
            invoker
                .workspace_size(&operation, params)
                .at(Stage::QueryWorkspace)?
        };
        debug!("Workspace: {} bytes", workspace_bytes);
        let mut workspace =
            DeviceBuffer::<u8>::new(runtime, workspace_bytes).at(Stage::QueryWorkspace)?;

        // Warm-up calls are untimed; an accumulating output is restored after
        if self.options.warmup_iterations > 0 {
            {
                let mut operation = operands.operation(compressed.as_ref()).at(Stage::Invoke)?;
                for _ in 0..self.options.warmup_iterations {
                    invoker
                        .compute(&mut operation, params, &mut workspace, &stream)
                        .at(Stage::Invoke)?;
                }
            }
            stream.synchronize().at(Stage::Invoke)?;
            if params.beta != 0.0 {
                operands
                    .c
                    .upload(&host.c, &stream)
                    .and_then(Transfer::wait)
                    .at(Stage::Invoke)?;
            }
            debug!("Completed {} warm-up iterations", self.options.warmup_iterations);
        }

        // Invoke
        let elapsed = {
            let mut operation = operands.operation(compressed.as_ref()).at(Stage::Invoke)?;
            if spec.preprocess() {
                invoker
                    .preprocess(&mut operation, params, &mut workspace, &stream)
                    .at(Stage::Invoke)?;
                stream.synchronize().at(Stage::Invoke)?;
            }
            let timer = Timer::new(runtime).at(Stage::Invoke)?;
            let armed = timer.start(&stream).at(Stage::Invoke)?;
            invoker
                .compute(&mut operation, params, &mut workspace, &stream)
                .at(Stage::Invoke)?;
            armed
                .stop(&stream)
                .and_then(|stopped| stopped.read())
                .at(Stage::Invoke)?
        };
        let timing = TimingResult::new(elapsed, flop_count(spec, actual_nnz.unwrap_or(0)));
        info!(
            "{}: {:.6} ms, {:.6} GFLOPS",
            spec.kind().entry_point(),
            timing.elapsed_ms,
            timing.throughput_gflops
        );

        // Transfer out
        let verify = spec.verify() || self.options.verify;
        let result = if verify || spec.dump_enabled() {
            Some(operands.c.download(&stream).at(Stage::TransferOut)?)
        } else {
            None
        };

        // Verify
        let verification = match (&result, verify) {
            (Some(result), true) => {
                let expected = reference_result(spec, &host.a, &host.b, &host.c).at(Stage::Verify)?;
                let summary =
                    compare_results(&expected, result, self.options.tolerance).at(Stage::Verify)?;
                Some(summary.into_result().at(Stage::Verify)?)
            }
            _ => None,
        };

        // Dump
        let dump = match (&result, spec.dump_enabled()) {
            (Some(result), true) => Some(
                ResultDumper::for_spec(spec)
                    .dump(spec, &host.a, &host.b, result)
                    .at(Stage::Dump)?,
            ),
            _ => None,
        };

        // Release: operands and scratch before the stream they were used on
        drop(workspace);
        drop(compressed);
        drop(operands);
        stream.synchronize().at(Stage::ReleaseAll)?;
        drop(stream);
        debug!("Released device resources");

        Ok(RunReport {
            kind: spec.kind(),
            device,
            backend: self.backend.name.clone(),
            seed: generator.seed(),
            actual_nnz,
            timing,
            operands: host,
            result,
            verification,
            dump,
        })
    }
}

/// Random operands in the layout each kind expects.
///
/// C starts at zero unless beta is non-zero, in which case it is random so
/// the accumulation is exercised.
fn generate_operands(
    spec: &ProblemSpec,
    generator: &mut RandomMatrixGenerator,
) -> BenchResult<HostOperands> {
    let (a_rows, a_cols) = spec.a_shape();
    let (b_rows, b_cols) = spec.b_shape();
    let (c_rows, c_cols) = spec.c_shape();
    let accumulate = spec.params().beta != 0.0;
    let sparsity = spec.sparsity().unwrap_or(1.0);

    let dense_output = |generator: &mut RandomMatrixGenerator| {
        if accumulate {
            generator.dense(c_rows, c_cols)
        } else {
            DenseMatrix::zeros(c_rows, c_cols)
        }
    };

    let operands = match spec.kind() {
        OperationKind::Gemm | OperationKind::StructuredSpmm => HostOperands {
            a: generator.dense(a_rows, a_cols).into(),
            b: generator.dense(b_rows, b_cols),
            c: dense_output(generator).into(),
        },
        OperationKind::SpmmCsr => HostOperands {
            a: generator
                .csr(a_rows, a_cols, sparsity, SamplingMode::WithReplacement)?
                .into(),
            b: generator.dense(b_rows, b_cols),
            c: dense_output(generator).into(),
        },
        OperationKind::SddmmCsr => {
            let a = generator.dense(a_rows, a_cols);
            let b = generator.dense(b_rows, b_cols);
            let mut c = generator.csr(c_rows, c_cols, sparsity, SamplingMode::Distinct)?;
            if !accumulate {
                c.values_mut().fill(0.0);
            }
            HostOperands {
                a: a.into(),
                b,
                c: c.into(),
            }
        }
    };
    Ok(operands)
}

/// Prune A in place, check it, then compress it into fresh storage.
///
/// Returns the compressed operand and a host copy of the pruned A.
fn prepare_structured(
    structured: &dyn StructuredSparsity,
    spec: &ProblemSpec,
    runtime: &Arc<dyn DeviceRuntime>,
    operands: &mut DeviceOperands,
    stream: &Stream,
) -> BenchResult<(DeviceCompressed, DenseMatrix)> {
    let Dims::Dense { m, n, k } = spec.dims() else {
        return Err(BenchError::invalid_argument("dims", "structured runs need m, n and k"));
    };
    let shape = StructuredShape { m, n, k };
    let DeviceMatrix::Dense(a) = &mut operands.a else {
        return Err(BenchError::invalid_argument("A", "structured runs need a dense A"));
    };

    structured.prune(&shape, a, stream)?;
    if !structured.validate_pruning(&shape, a, stream)? {
        return Err(BenchError::InvalidPruning {
            details: format!("{m}x{k} A does not satisfy the 2:4 pattern after pruning"),
        });
    }
    let pruned = a.download(stream)?;

    let (compressed_bytes, scratch_bytes) = structured.compressed_size(&shape, spec.params())?;
    debug!(
        "Compressed A: {} bytes, {} scratch bytes",
        compressed_bytes, scratch_bytes
    );
    let mut compressed = DeviceCompressed::allocate(runtime, m, k, compressed_bytes)?;
    let mut scratch = DeviceBuffer::<u8>::new(runtime, scratch_bytes)?;
    structured.compress(&shape, spec.params(), a, &mut compressed, &mut scratch, stream)?;
    stream.synchronize()?;
    Ok((compressed, pruned))
}

enum DeviceMatrix {
    Dense(DeviceDense),
    Csr(DeviceCsr),
}

impl DeviceMatrix {
    fn allocate_like(runtime: &Arc<dyn DeviceRuntime>, host: &HostMatrix) -> BenchResult<Self> {
        Ok(match host {
            HostMatrix::Dense(m) => Self::Dense(DeviceDense::allocate(runtime, m.rows(), m.cols())?),
            HostMatrix::Csr(m) => Self::Csr(DeviceCsr::allocate_like(runtime, m)?),
        })
    }

    fn upload<'a>(&'a mut self, host: &'a HostMatrix, stream: &'a Stream) -> BenchResult<Transfer<'a>> {
        match (self, host) {
            (Self::Dense(device), HostMatrix::Dense(host)) => device.upload(host, stream),
            (Self::Csr(device), HostMatrix::Csr(host)) => device.upload(host, stream),
            _ => Err(BenchError::resource("upload", "host and device formats differ")),
        }
    }

    fn download(&self, stream: &Stream) -> BenchResult<HostMatrix> {
        Ok(match self {
            Self::Dense(m) => m.download(stream)?.into(),
            Self::Csr(m) => m.download(stream)?.into(),
        })
    }
}

/// Device-resident operands of one run
struct DeviceOperands {
    a: DeviceMatrix,
    b: DeviceDense,
    c: DeviceMatrix,
}

impl DeviceOperands {
    fn allocate(runtime: &Arc<dyn DeviceRuntime>, host: &HostOperands) -> BenchResult<Self> {
        Ok(Self {
            a: DeviceMatrix::allocate_like(runtime, &host.a)?,
            b: DeviceDense::allocate(runtime, host.b.rows(), host.b.cols())?,
            c: DeviceMatrix::allocate_like(runtime, &host.c)?,
        })
    }

    /// Enqueue all three uploads behind one wait
    fn upload<'a>(&'a mut self, host: &'a HostOperands, stream: &'a Stream) -> BenchResult<Transfer<'a>> {
        let a = self.a.upload(&host.a, stream)?;
        let b = self.b.upload(&host.b, stream)?;
        let c = self.c.upload(&host.c, stream)?;
        Ok(a.join(b).join(c))
    }

    /// Borrow the operands as a library operation; a compressed A selects
    /// the structured multiply
    fn operation<'a>(&'a mut self, compressed: Option<&'a DeviceCompressed>) -> BenchResult<Operation<'a>> {
        let b = &self.b;
        match (&self.a, &mut self.c, compressed) {
            (_, DeviceMatrix::Dense(c), Some(a)) => Ok(Operation::StructuredSpmm { a, b, c }),
            (DeviceMatrix::Dense(a), DeviceMatrix::Dense(c), None) => Ok(Operation::Gemm { a, b, c }),
            (DeviceMatrix::Csr(a), DeviceMatrix::Dense(c), None) => Ok(Operation::Spmm { a, b, c }),
            (DeviceMatrix::Dense(a), DeviceMatrix::Csr(c), None) => Ok(Operation::Sddmm { a, b, c }),
            _ => Err(BenchError::invalid_argument(
                "operands",
                "no operation takes this combination of formats",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn harness(device: &Arc<HostDevice>) -> Harness {
        Harness::new(Backend::reference(Arc::clone(device)), HarnessOptions::default())
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::AllocateDevice.to_string(), "allocate device memory");
        let err = HarnessError {
            stage: Stage::Invoke,
            source: BenchError::compute("cublasSgemm", 13),
        };
        assert_eq!(err.to_string(), "invoke failed: Compute failure in cublasSgemm (status 13)");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_gemm_run_verifies_and_releases() {
        let device = Arc::new(HostDevice::new());
        let report = harness(&device)
            .run_named(
                OperationKind::Gemm,
                &args(&[("m", "8"), ("n", "5"), ("k", "3"), ("seed", "7"), ("verify", "")]),
            )
            .unwrap();

        assert_eq!(report.seed, 7);
        assert_eq!(report.timing.flop_count, 120);
        assert!(report.verification.unwrap().passed());
        assert_eq!(report.result.unwrap().shape(), (8, 5));
        assert!(device.ledger().is_balanced());
    }

    #[test]
    fn test_result_not_downloaded_without_verify_or_dump() {
        let device = Arc::new(HostDevice::new());
        let report = harness(&device)
            .run_named(OperationKind::Gemm, &args(&[("m", "2"), ("n", "2"), ("k", "2")]))
            .unwrap();
        assert!(report.result.is_none());
        assert!(report.verification.is_none());
        assert!(report.dump.is_none());
    }

    #[test]
    fn test_sddmm_keeps_pattern_and_counts_nnz() {
        let device = Arc::new(HostDevice::new());
        let report = harness(&device)
            .run_named(
                OperationKind::SddmmCsr,
                &args(&[
                    ("A_num_rows", "6"),
                    ("A_num_cols", "4"),
                    ("B_num_cols", "5"),
                    ("C_sparsity", "0.5"),
                    ("enable_preprocess", ""),
                    ("verify", "true"),
                    ("seed", "3"),
                ]),
            )
            .unwrap();

        // Distinct sampling hits the request exactly
        assert_eq!(report.actual_nnz, Some(15));
        let result = report.result.unwrap();
        let pattern = report.operands.c.as_csr().unwrap();
        assert!(result.as_csr().unwrap().same_pattern(pattern));
        assert!(device.ledger().is_balanced());
    }

    #[test]
    fn test_structured_run_uses_pruned_operand() {
        let device = Arc::new(HostDevice::new());
        let report = harness(&device)
            .run_named(
                OperationKind::StructuredSpmm,
                &args(&[("m", "4"), ("n", "3"), ("k", "8"), ("verify", ""), ("seed", "11")]),
            )
            .unwrap();

        let a = report.operands.a.as_dense().unwrap();
        assert!(crate::compute::structured::is_2_4(a));
        assert!(report.verification.unwrap().passed());
        assert!(device.ledger().is_balanced());
    }

    #[test]
    fn test_warmup_with_accumulation_still_verifies() {
        let device = Arc::new(HostDevice::new());
        let options = HarnessOptions {
            warmup_iterations: 3,
            ..HarnessOptions::default()
        };
        let report = Harness::new(Backend::reference(Arc::clone(&device)), options)
            .run_named(
                OperationKind::Gemm,
                &args(&[
                    ("m", "3"),
                    ("n", "3"),
                    ("k", "3"),
                    ("beta", "0.5"),
                    ("verify", ""),
                ]),
            )
            .unwrap();
        assert!(report.verification.unwrap().passed());
    }

    #[test]
    fn test_parse_failure_is_tagged() {
        let device = Arc::new(HostDevice::new());
        let err = harness(&device)
            .run_named(OperationKind::Gemm, &args(&[("m", "0"), ("n", "2"), ("k", "2")]))
            .unwrap_err();
        assert_eq!(err.stage, Stage::ParseSpec);
        assert_eq!(device.ledger().total_allocations, 0);
    }
}
