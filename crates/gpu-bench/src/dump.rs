//! Result dumps
//!
//! A dump is a set of sibling files sharing one prefix:
//! `{prefix}.txt` holds the problem size, dense operands go to NumPy
//! `.npy` v1.0 files (row-major `<f4`) and CSR operands to Matrix Market
//! coordinate files. Every file is written next to its destination with a
//! `.partial` suffix and renamed into place once complete.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Local};
use common::error::{BenchError, BenchResult};
use serde::Serialize;
use tracing::{debug, info};

use crate::matrix::{CsrMatrix, DenseMatrix, HostMatrix};
use crate::spec::{Dims, ProblemSpec};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGNMENT: usize = 64;

/// Files produced by one dump
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DumpArtifacts {
    pub prefix: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Writes the operands and result of a run under one prefix
#[derive(Debug, Clone)]
pub struct ResultDumper {
    prefix: PathBuf,
}

impl ResultDumper {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Use the run's explicit prefix, or a timestamped one in the working
    /// directory
    pub fn for_spec(spec: &ProblemSpec) -> Self {
        match spec.output_prefix() {
            Some(prefix) => Self::new(prefix),
            None => Self::new(default_prefix(spec.kind().tool_name(), Local::now())),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// `{prefix}.{suffix}`; the suffix is appended, never substituted for an
    /// existing extension
    pub fn path_for(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.prefix.as_os_str());
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Write the size header and the three matrices
    pub fn dump(
        &self,
        spec: &ProblemSpec,
        a: &HostMatrix,
        b: &DenseMatrix,
        c: &HostMatrix,
    ) -> BenchResult<DumpArtifacts> {
        if let Some(parent) = self.prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| BenchError::dump(parent.display().to_string(), e))?;
        }

        let mut files = Vec::with_capacity(4);

        let header = self.path_for("txt");
        let line = size_header(spec, a, c);
        write_atomically(&header, |w| writeln!(w, "{line}"))?;
        files.push(header);

        let b = HostMatrix::Dense(b.clone());
        for (name, matrix) in [("A", a), ("B", &b), ("C", c)] {
            let path = match matrix {
                HostMatrix::Dense(dense) => {
                    let path = self.path_for(&format!("{name}.npy"));
                    write_atomically(&path, |w| write_npy(w, dense))?;
                    path
                }
                HostMatrix::Csr(csr) => {
                    let path = self.path_for(&format!("{name}.mtx"));
                    write_atomically(&path, |w| write_matrix_market(w, csr))?;
                    path
                }
            };
            debug!("Wrote {}", path.display());
            files.push(path);
        }

        info!("Dumped {} files under {}", files.len(), self.prefix.display());
        Ok(DumpArtifacts {
            prefix: self.prefix.clone(),
            files,
        })
    }
}

/// `{tool}.{YYYY-MM-DD-HH-MM}`
pub fn default_prefix(tool: &str, now: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("{tool}.{}", now.format("%Y-%m-%d-%H-%M")))
}

/// `m n k` for dense problems; sparse problems add the actual nnz of the
/// sparse operand and the requested sparsity
fn size_header(spec: &ProblemSpec, a: &HostMatrix, c: &HostMatrix) -> String {
    match spec.dims() {
        Dims::Dense { m, n, k } => format!("{m} {n} {k}"),
        Dims::Sparse {
            a_rows,
            a_cols,
            b_cols,
        } => {
            let nnz = a
                .as_csr()
                .or_else(|| c.as_csr())
                .map(CsrMatrix::nnz)
                .unwrap_or(0);
            let sparsity = spec.sparsity().unwrap_or(0.0);
            format!("{a_rows} {a_cols} {b_cols} {nnz} {sparsity:.6}")
        }
    }
}

/// Serialize `matrix` as a 2-D row-major `.npy` array
pub fn write_npy<W: Write + ?Sized>(w: &mut W, matrix: &DenseMatrix) -> io::Result<()> {
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        matrix.rows(),
        matrix.cols()
    )
    .into_bytes();

    // magic + version + u16 length + header + '\n' is padded to 64 bytes
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (NPY_ALIGNMENT - unpadded % NPY_ALIGNMENT) % NPY_ALIGNMENT;
    header.extend(std::iter::repeat(b' ').take(padding));
    header.push(b'\n');

    let header_len = u16::try_from(header.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "npy header exceeds format 1.0 limit")
    })?;

    w.write_all(NPY_MAGIC)?;
    w.write_all(&[1, 0])?;
    w.write_u16::<LittleEndian>(header_len)?;
    w.write_all(&header)?;
    for value in matrix.to_row_major() {
        w.write_f32::<LittleEndian>(value)?;
    }
    Ok(())
}

/// Serialize `matrix` as a 1-based `coordinate real general` Matrix Market file
pub fn write_matrix_market<W: Write + ?Sized>(w: &mut W, matrix: &CsrMatrix) -> io::Result<()> {
    writeln!(w, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(w, "{} {} {}", matrix.rows(), matrix.cols(), matrix.nnz())?;
    for (row, col, value) in matrix.triplets() {
        writeln!(w, "{} {} {}", row + 1, col + 1, value)?;
    }
    Ok(())
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
) -> BenchResult<()> {
    let mut partial = OsString::from(path.as_os_str());
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    let fail = |e: io::Error| BenchError::dump(path.display().to_string(), e);

    let result = File::create(&partial).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(fail(e));
    }
    fs::rename(&partial, path).map_err(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn spec(kind: crate::spec::OperationKind, pairs: &[(&str, &str)]) -> ProblemSpec {
        let args: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProblemSpec::from_named_args(kind, &args).unwrap()
    }

    #[test]
    fn test_npy_header_and_payload() {
        // 2x3 column-major: row-major payload is 1..6
        let matrix = DenseMatrix::new(2, 3, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]).unwrap();
        let mut buf = Vec::new();
        write_npy(&mut buf, &matrix).unwrap();

        assert_eq!(&buf[..6], NPY_MAGIC);
        assert_eq!(&buf[6..8], &[1, 0]);
        let header_len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
        let data_start = 10 + header_len;
        assert_eq!(data_start % 64, 0);

        let header = std::str::from_utf8(&buf[10..data_start]).unwrap();
        assert!(header.contains("'descr': '<f4'"));
        assert!(header.contains("'fortran_order': False"));
        assert!(header.contains("'shape': (2, 3)"));
        assert!(header.ends_with('\n'));

        let payload: Vec<f32> = buf[data_start..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(payload, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_matrix_market_is_one_based() {
        let csr = CsrMatrix::new(2, 3, vec![0, 1, 2], vec![2, 0], vec![1.5, -2.0]).unwrap();
        let mut buf = Vec::new();
        write_matrix_market(&mut buf, &csr).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "%%MatrixMarket matrix coordinate real general\n2 3 2\n1 3 1.5\n2 1 -2\n"
        );
    }

    #[test]
    fn test_default_prefix_uses_minute_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 59).unwrap();
        assert_eq!(
            default_prefix("bench-gemm", now),
            PathBuf::from("bench-gemm.2024-03-09-14-05")
        );
    }

    #[test]
    fn test_path_for_appends_suffix() {
        let dumper = ResultDumper::new("/tmp/run.v1");
        assert_eq!(dumper.path_for("A.npy"), PathBuf::from("/tmp/run.v1.A.npy"));
    }

    #[test]
    fn test_gemm_dump_layout() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("nested").join("gemm");
        let spec = spec(
            crate::spec::OperationKind::Gemm,
            &[("m", "2"), ("n", "2"), ("k", "2")],
        );
        let a = HostMatrix::Dense(DenseMatrix::zeros(2, 2));
        let b = DenseMatrix::zeros(2, 2);
        let c = HostMatrix::Dense(DenseMatrix::zeros(2, 2));

        let artifacts = ResultDumper::new(&prefix).dump(&spec, &a, &b, &c).unwrap();
        assert_eq!(artifacts.files.len(), 4);
        for file in &artifacts.files {
            assert!(file.exists(), "{} missing", file.display());
        }
        let header = fs::read_to_string(dir.path().join("nested/gemm.txt")).unwrap();
        assert_eq!(header, "2 2 2\n");

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_sparse_header_reports_actual_nnz() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("spmm");
        let spec = spec(
            crate::spec::OperationKind::SpmmCsr,
            &[
                ("A_num_rows", "2"),
                ("A_num_cols", "2"),
                ("B_num_cols", "1"),
                ("A_sparsity", "0.5"),
            ],
        );
        let a = HostMatrix::Csr(CsrMatrix::new(2, 2, vec![0, 1, 1], vec![1], vec![3.0]).unwrap());
        let b = DenseMatrix::zeros(2, 1);
        let c = HostMatrix::Dense(DenseMatrix::zeros(2, 1));

        let artifacts = ResultDumper::new(&prefix).dump(&spec, &a, &b, &c).unwrap();
        assert!(artifacts.files.contains(&dir.path().join("spmm.A.mtx")));
        assert!(artifacts.files.contains(&dir.path().join("spmm.C.npy")));
        let header = fs::read_to_string(dir.path().join("spmm.txt")).unwrap();
        assert_eq!(header, "2 2 1 1 0.500000\n");
    }
}
