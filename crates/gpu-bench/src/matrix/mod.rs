//! Host-side matrices
//!
//! Dense matrices are column-major with `ld == rows`, matching the vendor
//! BLAS convention: element `(i, j)` lives at `values[i + j * ld]`. CSR
//! matrices use 32-bit offsets and indices with ascending, duplicate-free
//! columns within each row.

pub mod generator;

pub use generator::{RandomMatrixGenerator, SamplingMode};

use common::error::{BenchError, BenchResult};
use serde::Serialize;

/// Column-major dense matrix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    ld: usize,
    values: Vec<f32>,
}

impl DenseMatrix {
    /// Wrap column-major values; `values.len()` must equal `rows * cols`
    pub fn new(rows: usize, cols: usize, values: Vec<f32>) -> BenchResult<Self> {
        if values.len() != rows * cols {
            return Err(BenchError::invalid_argument(
                "values",
                format!(
                    "{} values cannot fill a {rows}x{cols} matrix",
                    values.len()
                ),
            ));
        }
        Ok(Self {
            rows,
            cols,
            ld: rows,
            values,
        })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            ld: rows,
            values: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Leading dimension
    pub fn ld(&self) -> usize {
        self.ld
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.values[row + col * self.ld]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.values[row + col * self.ld] = value;
    }

    /// Values in row-major order, as `.npy` files expect
    pub fn to_row_major(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.values.len());
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.push(self.get(i, j));
            }
        }
        out
    }
}

/// Compressed sparse row matrix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsrMatrix {
    rows: usize,
    cols: usize,
    row_offsets: Vec<i32>,
    col_indices: Vec<i32>,
    values: Vec<f32>,
}

impl CsrMatrix {
    /// Validating constructor.
    ///
    /// Offsets must start at zero, never decrease and end at `nnz`; columns
    /// must be in range and strictly ascending within each row.
    pub fn new(
        rows: usize,
        cols: usize,
        row_offsets: Vec<i32>,
        col_indices: Vec<i32>,
        values: Vec<f32>,
    ) -> BenchResult<Self> {
        let invalid = |details: String| BenchError::invalid_argument("csr", details);

        if row_offsets.len() != rows + 1 {
            return Err(invalid(format!(
                "expected {} row offsets, got {}",
                rows + 1,
                row_offsets.len()
            )));
        }
        if col_indices.len() != values.len() {
            return Err(invalid(format!(
                "{} column indices for {} values",
                col_indices.len(),
                values.len()
            )));
        }
        if row_offsets[0] != 0 {
            return Err(invalid(format!("first offset is {}", row_offsets[0])));
        }
        if row_offsets[rows] as usize != values.len() || row_offsets[rows] < 0 {
            return Err(invalid(format!(
                "last offset {} does not match nnz {}",
                row_offsets[rows],
                values.len()
            )));
        }

        for row in 0..rows {
            let (start, end) = (row_offsets[row], row_offsets[row + 1]);
            if end < start {
                return Err(invalid(format!("offsets decrease at row {row}")));
            }
            if end as usize > values.len() {
                return Err(invalid(format!("offset {end} past nnz at row {row}")));
            }
            let mut previous: Option<i32> = None;
            for &col in &col_indices[start as usize..end as usize] {
                if col < 0 || col as usize >= cols {
                    return Err(invalid(format!("column {col} out of range in row {row}")));
                }
                if previous.is_some_and(|p| p >= col) {
                    return Err(invalid(format!(
                        "columns not strictly ascending in row {row}"
                    )));
                }
                previous = Some(col);
            }
        }

        Ok(Self {
            rows,
            cols,
            row_offsets,
            col_indices,
            values,
        })
    }

    /// Build from `(row, col, value)` triples in any order.
    ///
    /// Later duplicates of a coordinate are dropped.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        mut entries: Vec<(usize, usize, f32)>,
    ) -> BenchResult<Self> {
        entries.sort_by_key(|&(row, col, _)| (row, col));
        entries.dedup_by_key(|entry| (entry.0, entry.1));

        let mut row_offsets = vec![0i32; rows + 1];
        let mut col_indices = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        for (row, col, value) in entries {
            if row >= rows {
                return Err(BenchError::invalid_argument(
                    "csr",
                    format!("row {row} out of range for {rows} rows"),
                ));
            }
            row_offsets[row + 1] += 1;
            col_indices.push(col as i32);
            values.push(value);
        }
        for row in 0..rows {
            row_offsets[row + 1] += row_offsets[row];
        }

        Self::new(rows, cols, row_offsets, col_indices, values)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row_offsets(&self) -> &[i32] {
        &self.row_offsets
    }

    pub fn col_indices(&self) -> &[i32] {
        &self.col_indices
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Values only; the sparsity pattern is fixed at construction
    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// `(col, value)` pairs of one row
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let start = self.row_offsets[row] as usize;
        let end = self.row_offsets[row + 1] as usize;
        self.col_indices[start..end]
            .iter()
            .zip(&self.values[start..end])
            .map(|(&col, &value)| (col as usize, value))
    }

    /// `(row, col, value)` for every stored entry, row by row
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.rows).flat_map(move |row| self.row(row).map(move |(col, v)| (row, col, v)))
    }

    pub fn same_pattern(&self, other: &CsrMatrix) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self.row_offsets == other.row_offsets
            && self.col_indices == other.col_indices
    }

    pub fn to_dense(&self) -> DenseMatrix {
        let mut dense = DenseMatrix::zeros(self.rows, self.cols);
        for (row, col, value) in self.triplets() {
            dense.set(row, col, value);
        }
        dense
    }
}

/// Either host representation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum HostMatrix {
    Dense(DenseMatrix),
    Csr(CsrMatrix),
}

impl HostMatrix {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Dense(m) => (m.rows(), m.cols()),
            Self::Csr(m) => (m.rows(), m.cols()),
        }
    }

    /// Stored values, column-major for dense and CSR order for sparse
    pub fn values(&self) -> &[f32] {
        match self {
            Self::Dense(m) => m.values(),
            Self::Csr(m) => m.values(),
        }
    }

    pub fn as_dense(&self) -> Option<&DenseMatrix> {
        match self {
            Self::Dense(m) => Some(m),
            Self::Csr(_) => None,
        }
    }

    pub fn as_csr(&self) -> Option<&CsrMatrix> {
        match self {
            Self::Csr(m) => Some(m),
            Self::Dense(_) => None,
        }
    }
}

impl From<DenseMatrix> for HostMatrix {
    fn from(m: DenseMatrix) -> Self {
        Self::Dense(m)
    }
}

impl From<CsrMatrix> for HostMatrix {
    fn from(m: CsrMatrix) -> Self {
        Self::Csr(m)
    }
}
