//! Problem descriptions for a single benchmark run.
//!
//! A [`ProblemSpec`] is built from a flat map of named arguments (the same
//! names the command line uses) and is immutable afterwards. Every check
//! that can reject a run happens here, before any host data is generated or
//! device memory is touched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use common::error::{BenchError, BenchResult};
use serde::Serialize;

/// Which library entry point a run exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Dense general matrix multiply
    Gemm,
    /// CSR sparse times dense
    SpmmCsr,
    /// Dense times dense, sampled by a CSR pattern
    SddmmCsr,
    /// 2:4 structured-sparse times dense
    StructuredSpmm,
}

impl OperationKind {
    /// Binary name, also the default dump prefix
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Gemm => "bench-gemm",
            Self::SpmmCsr => "bench-spmm-csr",
            Self::SddmmCsr => "bench-sddmm-csr",
            Self::StructuredSpmm => "bench-spmma",
        }
    }

    /// Vendor entry point the timed section calls, used in result lines
    pub fn entry_point(&self) -> &'static str {
        match self {
            Self::Gemm => "cublasSgemm",
            Self::SpmmCsr => "cusparseSpMM",
            Self::SddmmCsr => "cusparseSDDMM+CSR",
            Self::StructuredSpmm => "cusparseLtMatmul",
        }
    }

    /// Name of the sparsity argument, if this kind has a sparse operand
    pub fn sparsity_argument(&self) -> Option<&'static str> {
        match self {
            Self::SpmmCsr => Some(ARG_A_SPARSITY),
            Self::SddmmCsr => Some(ARG_C_SPARSITY),
            Self::Gemm | Self::StructuredSpmm => None,
        }
    }

    /// Argument names describing the problem size, in echo order
    pub fn dimension_arguments(&self) -> &'static [&'static str] {
        match self {
            Self::Gemm | Self::StructuredSpmm => &[ARG_M, ARG_N, ARG_K],
            Self::SpmmCsr | Self::SddmmCsr => &[ARG_A_NUM_ROWS, ARG_A_NUM_COLS, ARG_B_NUM_COLS],
        }
    }

    pub fn is_csr(&self) -> bool {
        matches!(self, Self::SpmmCsr | Self::SddmmCsr)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_name())
    }
}

pub const ARG_M: &str = "m";
pub const ARG_N: &str = "n";
pub const ARG_K: &str = "k";
pub const ARG_A_NUM_ROWS: &str = "A_num_rows";
pub const ARG_A_NUM_COLS: &str = "A_num_cols";
pub const ARG_B_NUM_COLS: &str = "B_num_cols";
pub const ARG_A_SPARSITY: &str = "A_sparsity";
pub const ARG_C_SPARSITY: &str = "C_sparsity";
pub const ARG_ENABLE_DUMP: &str = "enable_dump";
pub const ARG_ENABLE_PREPROCESS: &str = "enable_preprocess";
pub const ARG_RESULT_PATH_AND_PREFIX: &str = "result_path_and_prefix";
pub const ARG_SEED: &str = "seed";
pub const ARG_ALPHA: &str = "alpha";
pub const ARG_BETA: &str = "beta";
pub const ARG_TRANSPOSE_A: &str = "transpose_a";
pub const ARG_TRANSPOSE_B: &str = "transpose_b";
pub const ARG_VERIFY: &str = "verify";

/// Width of a structured-sparsity group along K
pub const STRUCTURED_GROUP: usize = 4;

/// Problem dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Dims {
    /// `op(A)` is m×k, `op(B)` is k×n, C is m×n
    Dense { m: usize, n: usize, k: usize },
    /// A is a_rows×a_cols, B is a_cols×b_cols, C is a_rows×b_cols
    Sparse {
        a_rows: usize,
        a_cols: usize,
        b_cols: usize,
    },
}

/// Scalars and operand modes passed to every library call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatmulParams {
    pub alpha: f32,
    pub beta: f32,
    pub transpose_a: bool,
    pub transpose_b: bool,
}

impl Default for MatmulParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.0,
            transpose_a: false,
            transpose_b: false,
        }
    }
}

/// Immutable description of one benchmark instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemSpec {
    kind: OperationKind,
    dims: Dims,
    sparsity: Option<f32>,
    dump_enabled: bool,
    output_prefix: Option<PathBuf>,
    preprocess: bool,
    verify: bool,
    seed: Option<u64>,
    params: MatmulParams,
}

impl ProblemSpec {
    /// Build a spec from named arguments.
    ///
    /// Keys that do not belong to `kind` are ignored. Boolean flags accept an
    /// empty value (bare `--flag`), `true` or `false`.
    pub fn from_named_args(
        kind: OperationKind,
        args: &BTreeMap<String, String>,
    ) -> BenchResult<Self> {
        let dims = match kind {
            OperationKind::Gemm | OperationKind::StructuredSpmm => Dims::Dense {
                m: required_dimension(args, ARG_M)?,
                n: required_dimension(args, ARG_N)?,
                k: required_dimension(args, ARG_K)?,
            },
            OperationKind::SpmmCsr | OperationKind::SddmmCsr => Dims::Sparse {
                a_rows: required_dimension(args, ARG_A_NUM_ROWS)?,
                a_cols: required_dimension(args, ARG_A_NUM_COLS)?,
                b_cols: required_dimension(args, ARG_B_NUM_COLS)?,
            },
        };

        let sparsity = match kind.sparsity_argument() {
            Some(name) => Some(required_sparsity(args, name)?),
            None => None,
        };

        let params = MatmulParams {
            alpha: optional_scalar(args, ARG_ALPHA)?.unwrap_or(1.0),
            beta: optional_scalar(args, ARG_BETA)?.unwrap_or(0.0),
            transpose_a: flag(args, ARG_TRANSPOSE_A)?,
            transpose_b: flag(args, ARG_TRANSPOSE_B)?,
        };
        if kind != OperationKind::Gemm {
            for (name, set) in [
                (ARG_TRANSPOSE_A, params.transpose_a),
                (ARG_TRANSPOSE_B, params.transpose_b),
            ] {
                if set {
                    return Err(BenchError::invalid_argument(
                        name,
                        format!("transposed operands are only supported by {}", OperationKind::Gemm),
                    ));
                }
            }
        }

        let preprocess = flag(args, ARG_ENABLE_PREPROCESS)?;
        if preprocess && kind != OperationKind::SddmmCsr {
            return Err(BenchError::invalid_argument(
                ARG_ENABLE_PREPROCESS,
                format!("only {} has a preprocessing step", OperationKind::SddmmCsr),
            ));
        }

        if let Dims::Dense { k, .. } = dims {
            if kind == OperationKind::StructuredSpmm && k % STRUCTURED_GROUP != 0 {
                return Err(BenchError::invalid_argument(
                    ARG_K,
                    format!("must be a multiple of {STRUCTURED_GROUP} for 2:4 sparsity, got {k}"),
                ));
            }
        }

        let output_prefix = match args.get(ARG_RESULT_PATH_AND_PREFIX) {
            Some(value) if value.trim().is_empty() => {
                return Err(BenchError::invalid_argument(
                    ARG_RESULT_PATH_AND_PREFIX,
                    "must not be empty",
                ))
            }
            Some(value) => Some(PathBuf::from(value)),
            None => None,
        };

        let seed = match args.get(ARG_SEED) {
            Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
                BenchError::invalid_argument(
                    ARG_SEED,
                    format!("expected an unsigned integer, got '{value}'"),
                )
            })?),
            None => None,
        };

        let spec = Self {
            kind,
            dims,
            sparsity,
            dump_enabled: flag(args, ARG_ENABLE_DUMP)?,
            output_prefix,
            preprocess,
            verify: flag(args, ARG_VERIFY)?,
            seed,
            params,
        };
        spec.check_extents()?;
        Ok(spec)
    }

    /// Vendor APIs take 32-bit extents and CSR indices
    fn check_extents(&self) -> BenchResult<()> {
        let limit = i32::MAX as usize;
        for (name, (rows, cols)) in [
            ("A", self.a_shape()),
            ("B", self.b_shape()),
            ("C", self.c_shape()),
        ] {
            let elements = rows.checked_mul(cols).ok_or_else(|| {
                BenchError::invalid_argument(name, format!("{rows}x{cols} overflows"))
            })?;
            if rows > limit || cols > limit || elements > limit {
                return Err(BenchError::invalid_argument(
                    name,
                    format!("{rows}x{cols} exceeds the 32-bit index range"),
                ));
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn sparsity(&self) -> Option<f32> {
        self.sparsity
    }

    pub fn dump_enabled(&self) -> bool {
        self.dump_enabled
    }

    pub fn output_prefix(&self) -> Option<&Path> {
        self.output_prefix.as_deref()
    }

    pub fn preprocess(&self) -> bool {
        self.preprocess
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn params(&self) -> &MatmulParams {
        &self.params
    }

    /// Stored shape of A as `(rows, cols)`, after accounting for transposes
    pub fn a_shape(&self) -> (usize, usize) {
        match self.dims {
            Dims::Dense { m, k, .. } if self.params.transpose_a => (k, m),
            Dims::Dense { m, k, .. } => (m, k),
            Dims::Sparse { a_rows, a_cols, .. } => (a_rows, a_cols),
        }
    }

    /// Stored shape of B as `(rows, cols)`
    pub fn b_shape(&self) -> (usize, usize) {
        match self.dims {
            Dims::Dense { n, k, .. } if self.params.transpose_b => (n, k),
            Dims::Dense { n, k, .. } => (k, n),
            Dims::Sparse { a_cols, b_cols, .. } => (a_cols, b_cols),
        }
    }

    /// Shape of the output C
    pub fn c_shape(&self) -> (usize, usize) {
        match self.dims {
            Dims::Dense { m, n, .. } => (m, n),
            Dims::Sparse { a_rows, b_cols, .. } => (a_rows, b_cols),
        }
    }

    /// Shape of the sparse operand, if any
    pub fn sparse_shape(&self) -> Option<(usize, usize)> {
        match self.kind {
            OperationKind::SpmmCsr => Some(self.a_shape()),
            OperationKind::SddmmCsr => Some(self.c_shape()),
            OperationKind::Gemm | OperationKind::StructuredSpmm => None,
        }
    }

    /// Nonzeros asked for, before deduplication
    pub fn requested_nnz(&self) -> Option<usize> {
        let (rows, cols) = self.sparse_shape()?;
        let sparsity = self.sparsity?;
        Some(requested_nnz(rows, cols, sparsity))
    }

    /// Echo lines for stdout, in argument order
    pub fn describe(&self) -> Vec<(String, String)> {
        let mut lines = Vec::new();
        match self.dims {
            Dims::Dense { m, n, k } => {
                lines.push((ARG_M.to_string(), m.to_string()));
                lines.push((ARG_N.to_string(), n.to_string()));
                lines.push((ARG_K.to_string(), k.to_string()));
            }
            Dims::Sparse {
                a_rows,
                a_cols,
                b_cols,
            } => {
                lines.push((ARG_A_NUM_ROWS.to_string(), a_rows.to_string()));
                lines.push((ARG_A_NUM_COLS.to_string(), a_cols.to_string()));
                lines.push((ARG_B_NUM_COLS.to_string(), b_cols.to_string()));
            }
        }
        if let (Some(name), Some(sparsity)) = (self.kind.sparsity_argument(), self.sparsity) {
            lines.push((name.to_string(), format!("{sparsity:.6}")));
        }
        if self.params != MatmulParams::default() {
            lines.push((ARG_ALPHA.to_string(), self.params.alpha.to_string()));
            lines.push((ARG_BETA.to_string(), self.params.beta.to_string()));
            lines.push((ARG_TRANSPOSE_A.to_string(), self.params.transpose_a.to_string()));
            lines.push((ARG_TRANSPOSE_B.to_string(), self.params.transpose_b.to_string()));
        }
        lines
    }
}

/// `round(rows * cols * sparsity)`, clamped to `rows * cols`
pub fn requested_nnz(rows: usize, cols: usize, sparsity: f32) -> usize {
    let total = rows.saturating_mul(cols);
    let wanted = (total as f64 * f64::from(sparsity)).round();
    if wanted <= 0.0 {
        0
    } else {
        (wanted as usize).min(total)
    }
}

fn required_dimension(args: &BTreeMap<String, String>, name: &str) -> BenchResult<usize> {
    let raw = args
        .get(name)
        .ok_or_else(|| BenchError::invalid_argument(name, "missing required dimension"))?;
    let value = raw.trim().parse::<usize>().map_err(|_| {
        BenchError::invalid_argument(name, format!("expected a positive integer, got '{raw}'"))
    })?;
    if value == 0 {
        return Err(BenchError::invalid_argument(name, "must be greater than zero"));
    }
    Ok(value)
}

fn required_sparsity(args: &BTreeMap<String, String>, name: &str) -> BenchResult<f32> {
    let raw = args
        .get(name)
        .ok_or_else(|| BenchError::invalid_argument(name, "missing required sparsity"))?;
    let value = raw.trim().parse::<f32>().map_err(|_| {
        BenchError::invalid_argument(name, format!("expected a number in (0, 1], got '{raw}'"))
    })?;
    if !(value > 0.0 && value <= 1.0) {
        return Err(BenchError::invalid_argument(
            name,
            format!("must lie in (0, 1], got {value}"),
        ));
    }
    Ok(value)
}

fn optional_scalar(args: &BTreeMap<String, String>, name: &str) -> BenchResult<Option<f32>> {
    let Some(raw) = args.get(name) else {
        return Ok(None);
    };
    let value = raw.trim().parse::<f32>().map_err(|_| {
        BenchError::invalid_argument(name, format!("expected a number, got '{raw}'"))
    })?;
    if !value.is_finite() {
        return Err(BenchError::invalid_argument(name, "must be finite"));
    }
    Ok(Some(value))
}

fn flag(args: &BTreeMap<String, String>, name: &str) -> BenchResult<bool> {
    match args.get(name).map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(value) => match value.as_str() {
            "" | "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(BenchError::invalid_argument(
                name,
                format!("expected true or false, got '{value}'"),
            )),
        },
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

    #[test]
    fn test_gemm_spec() {
        let spec = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[("m", "2"), ("n", "3"), ("k", "4"), ("enable_dump", "")]),
        )
        .unwrap();

        assert_eq!(spec.dims(), Dims::Dense { m: 2, n: 3, k: 4 });
        assert!(spec.dump_enabled());
        assert!(!spec.verify());
        assert_eq!(spec.a_shape(), (2, 4));
        assert_eq!(spec.b_shape(), (4, 3));
        assert_eq!(spec.c_shape(), (2, 3));
        assert_eq!(*spec.params(), MatmulParams::default());
    }

    #[test]
    fn test_transposed_shapes() {
        let spec = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[
                ("m", "2"),
                ("n", "3"),
                ("k", "4"),
                ("transpose_a", "true"),
                ("transpose_b", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(spec.a_shape(), (4, 2));
        assert_eq!(spec.b_shape(), (3, 4));
        assert_eq!(spec.c_shape(), (2, 3));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let err = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[("m", "0"), ("n", "2"), ("k", "2")]),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::InvalidArgument { ref argument, .. } if argument == "m"));
    }

    #[test]
    fn test_missing_and_malformed_dimensions() {
        let err = ProblemSpec::from_named_args(
            OperationKind::SpmmCsr,
            &args(&[("A_num_rows", "4"), ("A_num_cols", "4"), ("A_sparsity", "0.5")]),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("B_num_cols"));

        let err = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[("m", "two"), ("n", "2"), ("k", "2")]),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::InvalidArgument { .. }));
    }

    #[test]
    fn test_sparsity_bounds() {
        for bad in ["0", "-0.1", "1.5", "nan", "abc"] {
            let result = ProblemSpec::from_named_args(
                OperationKind::SddmmCsr,
                &args(&[
                    ("A_num_rows", "4"),
                    ("A_num_cols", "4"),
                    ("B_num_cols", "4"),
                    ("C_sparsity", bad),
                ]),
            );
            assert!(result.is_err(), "sparsity {bad} should be rejected");
        }

        let spec = ProblemSpec::from_named_args(
            OperationKind::SddmmCsr,
            &args(&[
                ("A_num_rows", "4"),
                ("A_num_cols", "5"),
                ("B_num_cols", "6"),
                ("C_sparsity", "1"),
            ]),
        )
        .unwrap();
        assert_eq!(spec.requested_nnz(), Some(24));
        assert_eq!(spec.sparse_shape(), Some((4, 6)));
    }

    #[test]
    fn test_csr_kinds_reject_transposes() {
        let err = ProblemSpec::from_named_args(
            OperationKind::SpmmCsr,
            &args(&[
                ("A_num_rows", "4"),
                ("A_num_cols", "4"),
                ("B_num_cols", "4"),
                ("A_sparsity", "0.5"),
                ("transpose_b", ""),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::InvalidArgument { ref argument, .. } if argument == "transpose_b"));
    }

    #[test]
    fn test_structured_requires_groups_of_four() {
        let err = ProblemSpec::from_named_args(
            OperationKind::StructuredSpmm,
            &args(&[("m", "8"), ("n", "8"), ("k", "6")]),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("multiple of 4"));

        assert!(ProblemSpec::from_named_args(
            OperationKind::StructuredSpmm,
            &args(&[("m", "8"), ("n", "8"), ("k", "16")]),
        )
        .is_ok());
    }

    #[test]
    fn test_preprocess_only_for_sddmm() {
        let err = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[("m", "2"), ("n", "2"), ("k", "2"), ("enable_preprocess", "")]),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::InvalidArgument { .. }));
    }

    #[test]
    fn test_requested_nnz_rounds_and_clamps() {
        assert_eq!(requested_nnz(4, 4, 0.5), 8);
        assert_eq!(requested_nnz(3, 3, 0.5), 5);
        assert_eq!(requested_nnz(10, 10, 0.001), 0);
        assert_eq!(requested_nnz(2, 2, 1.0), 4);
    }

    #[test]
    fn test_extent_overflow_rejected() {
        let err = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[("m", "100000"), ("n", "2"), ("k", "100000")]),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("32-bit"));
    }

    #[test]
    fn test_optional_arguments() {
        let spec = ProblemSpec::from_named_args(
            OperationKind::Gemm,
            &args(&[
                ("m", "2"),
                ("n", "2"),
                ("k", "2"),
                ("seed", "7"),
                ("alpha", "2.5"),
                ("beta", "1"),
                ("result_path_and_prefix", "out/run"),
                ("verify", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(spec.seed(), Some(7));
        assert_eq!(spec.params().alpha, 2.5);
        assert_eq!(spec.params().beta, 1.0);
        assert_eq!(spec.output_prefix(), Some(Path::new("out/run")));
        assert!(spec.verify());
        assert!(!spec.dump_enabled());
    }
}
