//! Seeded random matrix generation

use common::config::GeneratorConfig;
use common::error::{BenchError, BenchResult};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::{CsrMatrix, DenseMatrix};
use crate::spec::requested_nnz;

/// How sparse coordinates are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Independent draws, deduplicated afterwards; actual nnz may fall short
    WithReplacement,
    /// Distinct positions; actual nnz always equals the request
    Distinct,
}

/// Uniform `[low, high)` generator over a `StdRng`
pub struct RandomMatrixGenerator {
    rng: StdRng,
    seed: u64,
    values: Uniform<f32>,
}

impl RandomMatrixGenerator {
    /// Seed from `seed`, or from the wall clock when absent.
    ///
    /// Fails with `InvalidArgument` on a range `Uniform` cannot sample.
    pub fn new(seed: Option<u64>, config: &GeneratorConfig) -> BenchResult<Self> {
        let (low, high) = (config.low, config.high);
        if !(low.is_finite() && high.is_finite() && low < high && (high - low).is_finite()) {
            return Err(BenchError::invalid_argument(
                "generator",
                format!("cannot sample uniformly from [{low}, {high})"),
            ));
        }

        let seed = match seed {
            Some(seed) => seed,
            None => {
                let now = chrono::Utc::now();
                let seed = now
                    .timestamp_nanos_opt()
                    .map(|nanos| nanos as u64)
                    .unwrap_or_else(|| now.timestamp_micros() as u64);
                info!("No seed given, seeding from wall clock: {}", seed);
                seed
            }
        };

        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            values: Uniform::new(low, high),
        })
    }

    /// Seed actually in use, for reproducing a run
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Column-major `rows × cols` matrix of uniform values
    pub fn dense(&mut self, rows: usize, cols: usize) -> DenseMatrix {
        let values: Vec<f32> = (&mut self.rng)
            .sample_iter(self.values)
            .take(rows * cols)
            .collect();
        DenseMatrix {
            rows,
            cols,
            ld: rows,
            values,
        }
    }

    /// Random CSR matrix with `round(rows * cols * sparsity)` requested nonzeros
    pub fn csr(
        &mut self,
        rows: usize,
        cols: usize,
        sparsity: f32,
        mode: SamplingMode,
    ) -> BenchResult<CsrMatrix> {
        let total = rows * cols;
        let requested = requested_nnz(rows, cols, sparsity);

        let positions: Vec<usize> = match mode {
            SamplingMode::WithReplacement => (0..requested)
                .map(|_| {
                    let row = self.rng.gen_range(0..rows);
                    let col = self.rng.gen_range(0..cols);
                    row * cols + col
                })
                .collect(),
            SamplingMode::Distinct => index::sample(&mut self.rng, total, requested).into_vec(),
        };

        let entries = positions
            .into_iter()
            .map(|pos| (pos / cols, pos % cols, self.rng.sample(self.values)))
            .collect();
        let csr = CsrMatrix::from_triplets(rows, cols, entries)?;

        debug!(
            "Generated {}x{} CSR: requested nnz {}, actual nnz {} ({:?})",
            rows,
            cols,
            requested,
            csr.nnz(),
            mode
        );
        Ok(csr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(seed: u64) -> RandomMatrixGenerator {
        RandomMatrixGenerator::new(Some(seed), &GeneratorConfig::default()).unwrap()
    }

    fn assert_well_formed(csr: &CsrMatrix) {
        let offsets = csr.row_offsets();
        assert_eq!(offsets[0], 0);
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(offsets[csr.rows()] as usize, csr.nnz());
        for row in 0..csr.rows() {
            let cols: Vec<usize> = csr.row(row).map(|(c, _)| c).collect();
            assert!(cols.windows(2).all(|w| w[0] < w[1]), "row {row} has duplicates");
        }
    }

    #[test]
    fn test_dense_values_in_range() {
        let m = generator(1).dense(16, 8);
        assert_eq!(m.values().len(), 128);
        assert!(m.values().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_same_seed_same_data() {
        let mut a = generator(42);
        let mut b = generator(42);
        assert_eq!(a.dense(5, 7), b.dense(5, 7));
        assert_eq!(
            a.csr(20, 30, 0.1, SamplingMode::WithReplacement).unwrap(),
            b.csr(20, 30, 0.1, SamplingMode::WithReplacement).unwrap()
        );
        assert_ne!(generator(43).dense(5, 7), generator(42).dense(5, 7));
    }

    #[test]
    fn test_with_replacement_is_deduplicated() {
        // Dense request on a tiny matrix forces collisions
        let csr = generator(7).csr(4, 4, 1.0, SamplingMode::WithReplacement).unwrap();
        assert_well_formed(&csr);
        assert!(csr.nnz() <= 16);
        assert!(csr.nnz() > 0);
    }

    #[test]
    fn test_distinct_hits_requested_nnz() {
        for (rows, cols, sparsity) in [(4, 4, 1.0), (64, 32, 0.05), (100, 3, 0.5)] {
            let csr = generator(9).csr(rows, cols, sparsity, SamplingMode::Distinct).unwrap();
            assert_well_formed(&csr);
            assert_eq!(csr.nnz(), requested_nnz(rows, cols, sparsity));
        }
    }

    #[test]
    fn test_unsampleable_range_is_an_error() {
        for (low, high) in [(-3e38, 3e38), (1.0, 1.0), (0.0, f32::INFINITY)] {
            let config = GeneratorConfig { low, high };
            assert!(matches!(
                RandomMatrixGenerator::new(Some(1), &config),
                Err(BenchError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn test_wall_clock_seed_is_reported() {
        let g = RandomMatrixGenerator::new(None, &GeneratorConfig::default()).unwrap();
        let mut replay = generator(g.seed());
        let mut g = g;
        assert_eq!(g.dense(3, 3), replay.dense(3, 3));
    }
}
