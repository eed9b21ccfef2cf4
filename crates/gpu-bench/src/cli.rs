//! Command-line front end shared by the four benchmark programs
//!
//! Flag names keep the underscore spelling of the problem arguments
//! (`--A_num_rows=4`) so existing benchmark scripts keep working. Stdout
//! carries only result lines; diagnostics go through `tracing` on stderr.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use common::config::{
    load_config, load_from_file, BackendKind, BenchConfig, ConfigValidation, LoggingConfig,
};
use common::error::{
    BenchError, BenchFailure, BenchResult, ConfigurationError, EXIT_FAILURE, EXIT_SUCCESS,
};

use crate::device::HostDevice;
use crate::harness::{Backend, Harness, HarnessError, HarnessOptions, RunReport, Stage};
use crate::spec::{
    OperationKind, ProblemSpec, ARG_ALPHA, ARG_BETA, ARG_ENABLE_DUMP, ARG_ENABLE_PREPROCESS,
    ARG_RESULT_PATH_AND_PREFIX, ARG_SEED, ARG_TRANSPOSE_A, ARG_TRANSPOSE_B, ARG_VERIFY,
};

pub const ARG_BACKEND: &str = "backend";
pub const ARG_DEVICE: &str = "device";
pub const ARG_CONFIG: &str = "config";
pub const ARG_LOG_LEVEL: &str = "log-level";
pub const ARG_JSON: &str = "json";

/// Parsed command line for one benchmark program
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub kind: OperationKind,
    /// Problem arguments by name; set flags map to an empty value
    pub named: BTreeMap<String, String>,
    pub backend: Option<BackendKind>,
    pub device: Option<u32>,
    pub config_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub json: bool,
}

/// Flags that take no value, per kind
fn problem_flags(kind: OperationKind) -> Vec<&'static str> {
    let mut flags = vec![ARG_ENABLE_DUMP, ARG_VERIFY];
    match kind {
        OperationKind::Gemm => flags.extend([ARG_TRANSPOSE_A, ARG_TRANSPOSE_B]),
        OperationKind::SddmmCsr => flags.push(ARG_ENABLE_PREPROCESS),
        OperationKind::SpmmCsr | OperationKind::StructuredSpmm => {}
    }
    flags
}

/// Arguments that take a value, per kind
fn problem_values(kind: OperationKind) -> Vec<&'static str> {
    let mut values = kind.dimension_arguments().to_vec();
    values.extend(kind.sparsity_argument());
    values.extend([ARG_RESULT_PATH_AND_PREFIX, ARG_SEED, ARG_ALPHA, ARG_BETA]);
    values
}

fn value_help(name: &str) -> (&'static str, &'static str) {
    match name {
        ARG_RESULT_PATH_AND_PREFIX => ("PATH", "Path and file prefix for dumped matrices"),
        ARG_SEED => ("SEED", "Seed for the random operands (wall clock when absent)"),
        ARG_ALPHA => ("SCALAR", "Scale applied to the product [default: 1]"),
        ARG_BETA => ("SCALAR", "Scale applied to the prior output [default: 0]"),
        _ if name.ends_with("_sparsity") => ("FRACTION", "Fraction of nonzero entries in (0, 1]"),
        _ => ("INT", "Matrix extent"),
    }
}

fn flag_help(name: &str) -> &'static str {
    match name {
        ARG_ENABLE_DUMP => "Write operands and result to disk",
        ARG_ENABLE_PREPROCESS => "Run the SDDMM preprocessing step before timing",
        ARG_VERIFY => "Check the result against the host reference kernels",
        ARG_TRANSPOSE_A => "Use A transposed",
        _ => "Use B transposed",
    }
}

/// `bench-gemm --m=<INT> --n=<INT> --k=<INT> [OPTIONS]`
fn usage_line(kind: OperationKind) -> String {
    let mut usage = kind.tool_name().to_string();
    for name in kind.dimension_arguments() {
        usage.push_str(&format!(" --{name}=<INT>"));
    }
    if let Some(name) = kind.sparsity_argument() {
        usage.push_str(&format!(" --{name}=<FRACTION>"));
    }
    usage.push_str(" [OPTIONS]");
    usage
}

pub fn build_command(kind: OperationKind) -> Command {
    let mut command = Command::new(kind.tool_name())
        .version(env!("CARGO_PKG_VERSION"))
        .about(format!("Times a single {} call on random operands", kind.entry_point()))
        .override_usage(usage_line(kind));

    for name in problem_values(kind) {
        let (value_name, help) = value_help(name);
        command = command.arg(
            Arg::new(name)
                .long(name)
                .help(help)
                .value_name(value_name),
        );
    }
    for name in problem_flags(kind) {
        command = command.arg(
            Arg::new(name)
                .long(name)
                .help(flag_help(name))
                .action(ArgAction::SetTrue),
        );
    }

    command
        .arg(
            Arg::new(ARG_BACKEND)
                .long(ARG_BACKEND)
                .help("Device backend")
                .value_name("BACKEND")
                .value_parser(["reference", "cuda"]),
        )
        .arg(
            Arg::new(ARG_DEVICE)
                .long(ARG_DEVICE)
                .help("Device ordinal")
                .value_name("ORDINAL")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_CONFIG)
                .long(ARG_CONFIG)
                .help("TOML configuration file")
                .value_name("FILE"),
        )
        .arg(
            Arg::new(ARG_LOG_LEVEL)
                .long(ARG_LOG_LEVEL)
                .help("Logging level")
                .value_name("LEVEL")
                .value_parser(["error", "warn", "info", "debug", "trace"]),
        )
        .arg(
            Arg::new(ARG_JSON)
                .long(ARG_JSON)
                .help("Print one JSON summary line instead of text")
                .action(ArgAction::SetTrue),
        )
}

pub fn parse_args<I, T>(kind: OperationKind, args: I) -> Result<CliArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = build_command(kind).try_get_matches_from(args)?;

    let backend = match matches.get_one::<String>(ARG_BACKEND) {
        Some(value) => Some(value.parse::<BackendKind>().map_err(|e| {
            build_command(kind).error(clap::error::ErrorKind::InvalidValue, e.to_string())
        })?),
        None => None,
    };

    Ok(CliArgs {
        kind,
        named: named_args(kind, &matches),
        backend,
        device: matches.get_one::<u32>(ARG_DEVICE).copied(),
        config_path: matches.get_one::<String>(ARG_CONFIG).map(PathBuf::from),
        log_level: matches.get_one::<String>(ARG_LOG_LEVEL).cloned(),
        json: matches.get_flag(ARG_JSON),
    })
}

fn named_args(kind: OperationKind, matches: &ArgMatches) -> BTreeMap<String, String> {
    let mut named = BTreeMap::new();
    for name in problem_values(kind) {
        if let Some(value) = matches.get_one::<String>(name) {
            named.insert(name.to_string(), value.clone());
        }
    }
    for name in problem_flags(kind) {
        if matches.get_flag(name) {
            named.insert(name.to_string(), String::new());
        }
    }
    named
}

/// Layered configuration with the command line applied last
pub fn load_settings(cli: &CliArgs) -> Result<BenchConfig> {
    // An explicit --config must exist; the default file is optional
    let mut config: BenchConfig = match &cli.config_path {
        Some(path) => load_from_file(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(device) = cli.device {
        config.device_ordinal = device;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Runtime and invokers for the configured backend
pub fn build_backend(kind: OperationKind, config: &BenchConfig) -> BenchResult<Backend> {
    match config.backend {
        BackendKind::Reference => Ok(Backend::reference(Arc::new(
            HostDevice::new().with_ordinal(config.device_ordinal),
        ))),
        BackendKind::Cuda => cuda_backend(kind, config.device_ordinal),
    }
}

#[cfg(feature = "cuda")]
fn cuda_backend(kind: OperationKind, ordinal: u32) -> BenchResult<Backend> {
    use crate::compute::{CublasInvoker, CusparseInvoker, CusparseLtInvoker};
    use crate::device::{CudaDevice, DeviceRuntime};

    let runtime: Arc<dyn DeviceRuntime> = Arc::new(CudaDevice::new(ordinal)?);
    let backend = match kind {
        OperationKind::Gemm => Backend::new("cublas", runtime, Arc::new(CublasInvoker::new()?)),
        OperationKind::SpmmCsr | OperationKind::SddmmCsr => {
            Backend::new("cusparse", runtime, Arc::new(CusparseInvoker::new()?))
        }
        OperationKind::StructuredSpmm => {
            let invoker = Arc::new(CusparseLtInvoker::new()?);
            Backend::new("cusparselt", runtime, invoker.clone()).with_structured(invoker)
        }
    };
    Ok(backend)
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend(_kind: OperationKind, _ordinal: u32) -> BenchResult<Backend> {
    Err(BenchError::unsupported(
        "this build has no CUDA support; rebuild with --features cuda",
    ))
}

/// Echo the parsed problem the way the benchmark scripts expect
pub fn write_problem<W: Write>(out: &mut W, spec: &ProblemSpec) -> std::io::Result<()> {
    for (name, value) in spec.describe() {
        writeln!(out, "{name}: {value}")?;
    }
    Ok(())
}

pub fn write_report<W: Write>(out: &mut W, report: &RunReport) -> std::io::Result<()> {
    let entry = report.kind.entry_point();
    if report.kind == OperationKind::SpmmCsr {
        if let Some(nnz) = report.actual_nnz {
            writeln!(
                out,
                "actual A_nnz due to deduplication during random data generation: {nnz}"
            )?;
        }
    }
    writeln!(out, "{entry} elapsed time (ms): {:.6}", report.timing.elapsed_ms)?;
    writeln!(
        out,
        "{entry} throughput (GFLOPS): {:.6}",
        report.timing.throughput_gflops
    )?;
    writeln!(
        out,
        "[DEBUG] {entry} chrono time (microseconds): {}",
        report.timing.wall_clock_us
    )
}

/// Parse, run and print one benchmark
pub fn execute<W: Write>(cli: &CliArgs, out: &mut W) -> Result<RunReport> {
    // Step 1: Configuration and logging
    let config = load_settings(cli)?;
    common::init_logging(&config.logging);
    info!("Starting {} v{}", cli.kind.tool_name(), env!("CARGO_PKG_VERSION"));

    // Step 2: Problem definition
    let spec = ProblemSpec::from_named_args(cli.kind, &cli.named).map_err(|source| {
        HarnessError {
            stage: Stage::ParseSpec,
            source,
        }
    })?;
    if !cli.json {
        write_problem(out, &spec).context("Failed to write to stdout")?;
    }

    // Step 3: Backend
    let backend = build_backend(cli.kind, &config).map_err(|source| HarnessError {
        stage: Stage::CheckDevice,
        source,
    })?;

    // Step 4: Run
    let harness = Harness::new(backend, HarnessOptions::from_config(&config));
    let report = harness.run(&spec)?;

    if cli.json {
        let line = serde_json::to_string(&report).context("Failed to serialize report")?;
        writeln!(out, "{line}").context("Failed to write to stdout")?;
    } else {
        write_report(out, &report).context("Failed to write to stdout")?;
    }
    out.flush().context("Failed to write to stdout")?;
    Ok(report)
}

/// Usage text printed after a rejected problem argument
pub fn usage(kind: OperationKind) -> String {
    build_command(kind).render_usage().to_string()
}

/// Whether the failure came from a bad problem argument
pub fn is_argument_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(failure) = cause.downcast_ref::<HarnessError>() {
            return failure.stage == Stage::ParseSpec
                && matches!(failure.source, BenchError::InvalidArgument { .. });
        }
        if let Some(source) = cause.downcast_ref::<BenchError>() {
            return matches!(source, BenchError::InvalidArgument { .. });
        }
    }
    false
}

/// Process exit code for a failure anywhere in the chain
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<HarnessError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<BenchError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ConfigurationError>() {
            return e.exit_code();
        }
    }
    EXIT_FAILURE
}

/// Entry point for the benchmark binaries; returns the process exit code
pub fn main_with_args<I, T>(kind: OperationKind, args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match parse_args(kind, args) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                EXIT_FAILURE
            } else {
                EXIT_SUCCESS
            };
        }
    };

    let stdout = std::io::stdout();
    match execute(&cli, &mut stdout.lock()) {
        Ok(_) => EXIT_SUCCESS,
        Err(err) => {
            // Configuration failures happen before logging is set up
            common::init_logging(&LoggingConfig::default());
            match err.downcast_ref::<HarnessError>() {
                Some(failure) => error!("{}: {}", cli.kind.tool_name(), failure),
                None => error!("{}: {:#}", cli.kind.tool_name(), err),
            }
            if is_argument_error(&err) {
                eprintln!("{}", usage(kind));
            }
            exit_code(&err)
        }
    }
}
