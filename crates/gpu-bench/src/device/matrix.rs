//! Matrices resident in device memory

use std::sync::Arc;

use common::error::BenchResult;

use super::{DeviceBuffer, DeviceRuntime, Stream, Transfer};
use crate::matrix::{CsrMatrix, DenseMatrix};

/// Column-major dense matrix on the device, `ld == rows`
#[derive(Debug)]
pub struct DeviceDense {
    rows: usize,
    cols: usize,
    values: DeviceBuffer<f32>,
}

impl DeviceDense {
    pub fn allocate(runtime: &Arc<dyn DeviceRuntime>, rows: usize, cols: usize) -> BenchResult<Self> {
        Ok(Self {
            rows,
            cols,
            values: DeviceBuffer::new(runtime, rows * cols)?,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn ld(&self) -> usize {
        self.rows
    }

    pub fn values(&self) -> &DeviceBuffer<f32> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DeviceBuffer<f32> {
        &mut self.values
    }

    pub fn upload<'a>(&'a mut self, host: &'a DenseMatrix, stream: &'a Stream) -> BenchResult<Transfer<'a>> {
        self.values.upload(host.values(), stream)
    }

    /// Copy back to the host, waiting for completion
    pub fn download(&self, stream: &Stream) -> BenchResult<DenseMatrix> {
        DenseMatrix::new(self.rows, self.cols, self.values.to_vec(stream)?)
    }
}

/// CSR matrix on the device with 32-bit offsets and indices
#[derive(Debug)]
pub struct DeviceCsr {
    rows: usize,
    cols: usize,
    nnz: usize,
    row_offsets: DeviceBuffer<i32>,
    col_indices: DeviceBuffer<i32>,
    values: DeviceBuffer<f32>,
}

impl DeviceCsr {
    /// Allocate storage shaped like `host`
    pub fn allocate_like(runtime: &Arc<dyn DeviceRuntime>, host: &CsrMatrix) -> BenchResult<Self> {
        Ok(Self {
            rows: host.rows(),
            cols: host.cols(),
            nnz: host.nnz(),
            row_offsets: DeviceBuffer::new(runtime, host.rows() + 1)?,
            col_indices: DeviceBuffer::new(runtime, host.nnz())?,
            values: DeviceBuffer::new(runtime, host.nnz())?,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    pub fn row_offsets(&self) -> &DeviceBuffer<i32> {
        &self.row_offsets
    }

    pub fn col_indices(&self) -> &DeviceBuffer<i32> {
        &self.col_indices
    }

    pub fn values(&self) -> &DeviceBuffer<f32> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DeviceBuffer<f32> {
        &mut self.values
    }

    /// Enqueue all three arrays; one wait covers them
    pub fn upload<'a>(&'a mut self, host: &'a CsrMatrix, stream: &'a Stream) -> BenchResult<Transfer<'a>> {
        let offsets = self.row_offsets.upload(host.row_offsets(), stream)?;
        let indices = self.col_indices.upload(host.col_indices(), stream)?;
        let values = self.values.upload(host.values(), stream)?;
        Ok(offsets.join(indices).join(values))
    }

    /// Copy back to the host and re-validate the structure
    pub fn download(&self, stream: &Stream) -> BenchResult<CsrMatrix> {
        CsrMatrix::new(
            self.rows,
            self.cols,
            self.row_offsets.to_vec(stream)?,
            self.col_indices.to_vec(stream)?,
            self.values.to_vec(stream)?,
        )
    }
}

/// Structured-sparse A after compression.
///
/// The byte layout is owned by whichever backend produced it.
#[derive(Debug)]
pub struct DeviceCompressed {
    rows: usize,
    cols: usize,
    data: DeviceBuffer<u8>,
}

impl DeviceCompressed {
    /// Storage for a compressed `rows × cols` matrix of `bytes` bytes
    pub fn allocate(
        runtime: &Arc<dyn DeviceRuntime>,
        rows: usize,
        cols: usize,
        bytes: usize,
    ) -> BenchResult<Self> {
        Ok(Self {
            rows,
            cols,
            data: DeviceBuffer::new(runtime, bytes)?,
        })
    }

    /// Logical rows (m)
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Logical columns (k)
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &DeviceBuffer<u8> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DeviceBuffer<u8> {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn test_csr_round_trip_frees_everything() {
        let device = Arc::new(HostDevice::new());
        let runtime: Arc<dyn DeviceRuntime> = device.clone();
        let host = CsrMatrix::new(
            4,
            4,
            vec![0, 3, 4, 7, 9],
            vec![0, 2, 3, 1, 0, 2, 3, 1, 3],
            (1..=9).map(|v| v as f32).collect(),
        )
        .unwrap();

        {
            let stream = Stream::new(&runtime).unwrap();
            let mut csr = DeviceCsr::allocate_like(&runtime, &host).unwrap();
            csr.upload(&host, &stream).unwrap().wait().unwrap();
            assert_eq!(csr.download(&stream).unwrap(), host);
            assert_eq!(device.ledger().live_allocations, 3);
        }
        assert!(device.ledger().is_balanced());
    }

    #[test]
    fn test_dense_round_trip() {
        let runtime: Arc<dyn DeviceRuntime> = Arc::new(HostDevice::new());
        let stream = Stream::new(&runtime).unwrap();
        let host = DenseMatrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut dense = DeviceDense::allocate(&runtime, 2, 3).unwrap();
        dense.upload(&host, &stream).unwrap().wait().unwrap();
        assert_eq!(dense.download(&stream).unwrap(), host);
        assert_eq!(dense.ld(), 2);
    }
}
