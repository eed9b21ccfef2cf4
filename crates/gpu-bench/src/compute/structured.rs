//! 2:4 structured sparsity on the host
//!
//! Along K (the columns of A), every group of four consecutive elements in a
//! row keeps at most two nonzeros. Pruning keeps the two largest magnitudes,
//! ties going to the lower index.
//!
//! Compressed layout, row by row and group by group:
//! - `m·k/2` little-endian `f32` kept values, two per group
//! - `m·k/4` metadata bytes, `pos0 | pos1 << 2` with `pos0 < pos1`

use byteorder::{ByteOrder, LittleEndian};
use common::error::{BenchError, BenchResult};
use tracing::debug;

use super::{ReferenceInvoker, StructuredShape, StructuredSparsity};
use crate::device::{DeviceBuffer, DeviceCompressed, DeviceDense, Stream};
use crate::matrix::DenseMatrix;
use crate::spec::{MatmulParams, STRUCTURED_GROUP};

const KEPT: usize = 2;

/// Zero all but the two largest magnitudes of every group
pub fn prune_2_4(a: &mut DenseMatrix) -> BenchResult<()> {
    check_group_width(a.cols())?;
    for i in 0..a.rows() {
        for start in (0..a.cols()).step_by(STRUCTURED_GROUP) {
            let mut order: Vec<usize> = (start..start + STRUCTURED_GROUP).collect();
            order.sort_by(|&x, &y| {
                a.get(i, y)
                    .abs()
                    .total_cmp(&a.get(i, x).abs())
                    .then(x.cmp(&y))
            });
            for &j in &order[KEPT..] {
                a.set(i, j, 0.0);
            }
        }
    }
    Ok(())
}

/// Whether every group holds at most two nonzeros
pub fn is_2_4(a: &DenseMatrix) -> bool {
    if a.cols() % STRUCTURED_GROUP != 0 {
        return false;
    }
    (0..a.rows()).all(|i| {
        (0..a.cols()).step_by(STRUCTURED_GROUP).all(|start| {
            (start..start + STRUCTURED_GROUP)
                .filter(|&j| a.get(i, j) != 0.0)
                .count()
                <= KEPT
        })
    })
}

/// Bytes of the compressed form of an `m × k` matrix
pub fn compressed_len(m: usize, k: usize) -> usize {
    let groups = m * k / STRUCTURED_GROUP;
    groups * KEPT * std::mem::size_of::<f32>() + groups
}

/// Compress a matrix that already satisfies the pattern
pub fn compress_2_4(a: &DenseMatrix) -> BenchResult<Vec<u8>> {
    check_group_width(a.cols())?;
    let groups_per_row = a.cols() / STRUCTURED_GROUP;
    let groups = a.rows() * groups_per_row;
    let value_bytes = groups * KEPT * 4;
    let mut out = vec![0u8; compressed_len(a.rows(), a.cols())];

    for i in 0..a.rows() {
        for g in 0..groups_per_row {
            let start = g * STRUCTURED_GROUP;
            let mut kept: Vec<usize> = (0..STRUCTURED_GROUP)
                .filter(|&p| a.get(i, start + p) != 0.0)
                .collect();
            if kept.len() > KEPT {
                return Err(BenchError::InvalidPruning {
                    details: format!("row {i}, columns {start}..{} hold {} nonzeros", start + 4, kept.len()),
                });
            }
            // Pad with the lowest unused positions, which hold zeros
            for p in 0..STRUCTURED_GROUP {
                if kept.len() == KEPT {
                    break;
                }
                if !kept.contains(&p) {
                    kept.push(p);
                }
            }
            kept.sort_unstable();

            let group = i * groups_per_row + g;
            for (slot, &p) in kept.iter().enumerate() {
                let offset = (group * KEPT + slot) * 4;
                LittleEndian::write_f32(&mut out[offset..offset + 4], a.get(i, start + p));
            }
            out[value_bytes + group] = (kept[0] | kept[1] << 2) as u8;
        }
    }
    Ok(out)
}

/// Expand a compressed `rows × cols` matrix back to dense
pub fn decompress(rows: usize, cols: usize, bytes: &[u8]) -> BenchResult<DenseMatrix> {
    check_group_width(cols)?;
    let expected = compressed_len(rows, cols);
    if bytes.len() < expected {
        return Err(BenchError::resource(
            "decompress",
            format!("{} bytes given, {expected} needed", bytes.len()),
        ));
    }

    let groups_per_row = cols / STRUCTURED_GROUP;
    let value_bytes = rows * groups_per_row * KEPT * 4;
    let mut dense = DenseMatrix::zeros(rows, cols);
    for i in 0..rows {
        for g in 0..groups_per_row {
            let group = i * groups_per_row + g;
            let meta = bytes[value_bytes + group] as usize;
            for (slot, p) in [meta & 0b11, (meta >> 2) & 0b11].into_iter().enumerate() {
                let offset = (group * KEPT + slot) * 4;
                let value = LittleEndian::read_f32(&bytes[offset..offset + 4]);
                dense.set(i, g * STRUCTURED_GROUP + p, value);
            }
        }
    }
    Ok(dense)
}

fn check_group_width(cols: usize) -> BenchResult<()> {
    if cols % STRUCTURED_GROUP != 0 {
        return Err(BenchError::invalid_argument(
            "k",
            format!("{cols} is not a multiple of {STRUCTURED_GROUP}"),
        ));
    }
    Ok(())
}

fn check_shape(shape: &StructuredShape, a: &DeviceDense) -> BenchResult<()> {
    if a.rows() != shape.m || a.cols() != shape.k {
        return Err(BenchError::invalid_argument(
            "A",
            format!("{}x{} does not match {}x{}", a.rows(), a.cols(), shape.m, shape.k),
        ));
    }
    Ok(())
}

impl StructuredSparsity for ReferenceInvoker {
    fn prune(&self, shape: &StructuredShape, a: &mut DeviceDense, stream: &Stream) -> BenchResult<()> {
        check_shape(shape, a)?;
        stream.synchronize()?;
        let mut host = self.load_dense(a)?;
        prune_2_4(&mut host)?;
        self.store_dense(a, &host)
    }

    fn validate_pruning(&self, shape: &StructuredShape, a: &DeviceDense, stream: &Stream) -> BenchResult<bool> {
        check_shape(shape, a)?;
        stream.synchronize()?;
        Ok(is_2_4(&self.load_dense(a)?))
    }

    fn compressed_size(&self, shape: &StructuredShape, _params: &MatmulParams) -> BenchResult<(usize, usize)> {
        check_group_width(shape.k)?;
        Ok((compressed_len(shape.m, shape.k), 0))
    }

    fn compress(
        &self,
        shape: &StructuredShape,
        _params: &MatmulParams,
        a: &DeviceDense,
        out: &mut DeviceCompressed,
        _scratch: &mut DeviceBuffer<u8>,
        stream: &Stream,
    ) -> BenchResult<()> {
        check_shape(shape, a)?;
        stream.synchronize()?;
        let bytes = compress_2_4(&self.load_dense(a)?)?;
        if out.data().len() < bytes.len() {
            return Err(BenchError::resource(
                "compress",
                format!("{} byte buffer for {} compressed bytes", out.data().len(), bytes.len()),
            ));
        }
        debug!("Compressed {}x{} A into {} bytes", shape.m, shape.k, bytes.len());
        self.device().write(out.data_mut().ptr(), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_major(rows: usize, cols: usize, values: &[f32]) -> DenseMatrix {
        let mut m = DenseMatrix::zeros(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                m.set(i, j, values[i * cols + j]);
            }
        }
        m
    }

    #[test]
    fn test_prune_keeps_two_largest_magnitudes() {
        let mut a = row_major(
            2,
            8,
            &[
                0.1, -0.9, 0.5, 0.3, 1.0, 2.0, 3.0, 4.0, //
                0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 7.0,
            ],
        );
        prune_2_4(&mut a).unwrap();
        assert_eq!(a.to_row_major(), vec![
            0.0, -0.9, 0.5, 0.0, 0.0, 0.0, 3.0, 4.0, //
            0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 7.0,
        ]);
        assert!(is_2_4(&a));
    }

    #[test]
    fn test_unpruned_matrix_fails_check() {
        let a = row_major(1, 4, &[1.0, 2.0, 3.0, 0.0]);
        assert!(!is_2_4(&a));
        assert!(matches!(
            compress_2_4(&a),
            Err(BenchError::InvalidPruning { .. })
        ));
    }

    #[test]
    fn test_compress_restores_pruned_matrix() {
        let mut a = row_major(
            2,
            8,
            &[
                5.0, 0.0, -1.0, 2.0, 0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 3.0, 9.0, 8.0, 7.0, 6.0,
            ],
        );
        prune_2_4(&mut a).unwrap();
        let bytes = compress_2_4(&a).unwrap();
        assert_eq!(bytes.len(), compressed_len(2, 8));
        assert_eq!(bytes.len(), 4 * 2 * 4 + 4);
        assert_eq!(decompress(2, 8, &bytes).unwrap(), a);
    }

    #[test]
    fn test_decompress_rejects_short_buffer() {
        assert!(decompress(2, 8, &[0u8; 10]).is_err());
    }
}
