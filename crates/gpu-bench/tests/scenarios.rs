//! End-to-end runs against the host-simulated device

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use gpu_bench::compute::{ComputeInvoker, Operation, ReferenceInvoker};
use gpu_bench::device::{DeviceBuffer, DeviceCsr, DeviceDense, DeviceRuntime, HostDevice, Stream};
use gpu_bench::matrix::{CsrMatrix, DenseMatrix};
use gpu_bench::spec::MatmulParams;
use gpu_bench::timing::throughput_gflops;
use gpu_bench::{Backend, Harness, HarnessOptions, OperationKind};
use tempfile::TempDir;

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
fn test_gemm_two_by_two_on_device() {
    let device = Arc::new(HostDevice::new());
    let runtime: Arc<dyn DeviceRuntime> = device.clone();
    let invoker = ReferenceInvoker::new(Arc::clone(&device));
    {
        let stream = Stream::new(&runtime).unwrap();
        let a_host = DenseMatrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b_host = DenseMatrix::new(2, 2, vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let mut a = DeviceDense::allocate(&runtime, 2, 2).unwrap();
        let mut b = DeviceDense::allocate(&runtime, 2, 2).unwrap();
        let mut c = DeviceDense::allocate(&runtime, 2, 2).unwrap();
        a.upload(&a_host, &stream).unwrap().wait().unwrap();
        b.upload(&b_host, &stream).unwrap().wait().unwrap();
        c.values_mut().zero(&stream).unwrap();

        let params = MatmulParams::default();
        let mut workspace = DeviceBuffer::<u8>::new(&runtime, 0).unwrap();
        let mut operation = Operation::Gemm {
            a: &a,
            b: &b,
            c: &mut c,
        };
        assert_eq!(invoker.workspace_size(&operation, &params).unwrap(), 0);
        invoker
            .compute(&mut operation, &params, &mut workspace, &stream)
            .unwrap();

        let result = c.download(&stream).unwrap();
        assert_eq!(result.get(0, 0), 23.0);
        assert_eq!(result.get(0, 1), 31.0);
        assert_eq!(result.get(1, 0), 34.0);
        assert_eq!(result.get(1, 1), 46.0);
    }
    assert!(device.ledger().is_balanced());
}

#[test]
fn test_spmm_four_by_four_on_device() {
    let device = Arc::new(HostDevice::new());
    let runtime: Arc<dyn DeviceRuntime> = device.clone();
    let invoker = ReferenceInvoker::new(Arc::clone(&device));
    {
        let stream = Stream::new(&runtime).unwrap();
        let a_host = CsrMatrix::new(
            4,
            4,
            vec![0, 3, 4, 7, 9],
            vec![0, 2, 3, 1, 0, 2, 3, 1, 3],
            (1..=9).map(|v| v as f32).collect(),
        )
        .unwrap();
        let b_host = DenseMatrix::new(4, 3, (1..=12).map(|v| v as f32).collect()).unwrap();
        let mut a = DeviceCsr::allocate_like(&runtime, &a_host).unwrap();
        let mut b = DeviceDense::allocate(&runtime, 4, 3).unwrap();
        let mut c = DeviceDense::allocate(&runtime, 4, 3).unwrap();
        a.upload(&a_host, &stream).unwrap().wait().unwrap();
        b.upload(&b_host, &stream).unwrap().wait().unwrap();
        c.values_mut().zero(&stream).unwrap();

        let params = MatmulParams::default();
        let mut workspace = DeviceBuffer::<u8>::new(&runtime, 0).unwrap();
        let mut operation = Operation::Spmm {
            a: &a,
            b: &b,
            c: &mut c,
        };
        invoker
            .compute(&mut operation, &params, &mut workspace, &stream)
            .unwrap();

        let result = c.download(&stream).unwrap();
        assert_eq!(
            result.values(),
            &[19.0, 8.0, 51.0, 52.0, 43.0, 24.0, 123.0, 120.0, 67.0, 40.0, 195.0, 188.0]
        );
    }
    assert!(device.ledger().is_balanced());
}

#[test]
fn test_generated_csr_is_well_formed() {
    let device = Arc::new(HostDevice::new());
    let report = harness(&device)
        .run_named(
            OperationKind::SpmmCsr,
            &args(&[
                ("A_num_rows", "32"),
                ("A_num_cols", "16"),
                ("B_num_cols", "4"),
                ("A_sparsity", "0.3"),
                ("seed", "21"),
            ]),
        )
        .unwrap();

    let a = report.operands.a.as_csr().unwrap();
    let offsets = a.row_offsets();
    assert_eq!(offsets.len(), 33);
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(offsets[32] as usize, a.nnz());
    assert_eq!(report.actual_nnz, Some(a.nnz()));
    // Sampling with replacement can only lose entries
    assert!(a.nnz() <= 154);
    for row in 0..32 {
        let columns: Vec<usize> = a.row(row).map(|(col, _)| col).collect();
        assert!(columns.windows(2).all(|w| w[0] < w[1]), "row {row} has duplicates");
    }
    assert_eq!(
        report.timing.flop_count,
        (a.nnz() * 4) as u64,
        "SpMM throughput counts stored nonzeros"
    );
}

#[test]
fn test_same_seed_gives_identical_dumps() {
    let dir = TempDir::new().unwrap();
    let mut contents = Vec::new();

    for run in ["first", "second"] {
        let prefix = dir.path().join(run).join("sddmm");
        let device = Arc::new(HostDevice::new());
        let report = harness(&device)
            .run_named(
                OperationKind::SddmmCsr,
                &args(&[
                    ("A_num_rows", "8"),
                    ("A_num_cols", "6"),
                    ("B_num_cols", "5"),
                    ("C_sparsity", "0.25"),
                    ("seed", "1234"),
                    ("enable_dump", ""),
                    ("result_path_and_prefix", prefix.to_str().unwrap()),
                ]),
            )
            .unwrap();

        let dump = report.dump.unwrap();
        assert_eq!(dump.prefix, prefix);
        let files: Vec<Vec<u8>> = dump.files.iter().map(|p| fs::read(p).unwrap()).collect();
        contents.push((report.operands, files));
    }

    assert_eq!(contents[0].0, contents[1].0);
    assert_eq!(contents[0].1, contents[1].1);
}

#[test]
fn test_dump_file_structure() {
    let dir = TempDir::new().unwrap();
    let prefix = dir.path().join("nested").join("spmm");
    let device = Arc::new(HostDevice::new());
    let report = harness(&device)
        .run_named(
            OperationKind::SpmmCsr,
            &args(&[
                ("A_num_rows", "4"),
                ("A_num_cols", "4"),
                ("B_num_cols", "2"),
                ("A_sparsity", "0.5"),
                ("seed", "5"),
                ("enable_dump", ""),
                ("result_path_and_prefix", prefix.to_str().unwrap()),
            ]),
        )
        .unwrap();

    let nnz = report.actual_nnz.unwrap();
    let header = fs::read_to_string(dir.path().join("nested/spmm.txt")).unwrap();
    assert_eq!(header, format!("4 4 2 {nnz} 0.500000\n"));

    let mtx = fs::read_to_string(dir.path().join("nested/spmm.A.mtx")).unwrap();
    assert!(mtx.starts_with("%%MatrixMarket matrix coordinate real general\n"));
    assert_eq!(mtx.lines().count(), 2 + nnz);

    for dense in ["spmm.B.npy", "spmm.C.npy"] {
        let bytes = fs::read(dir.path().join("nested").join(dense)).unwrap();
        assert_eq!(&bytes[..6], b"\x93NUMPY");
        // 64-byte aligned header followed by eight f32 values
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes.len(), 10 + header_len + 8 * 4);
    }

    let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "partial"))
        .collect();
    assert!(leftovers.is_empty());
    assert!(device.ledger().is_balanced());
}

#[test]
fn test_throughput_of_two_by_two_in_one_millisecond() {
    let gflops = throughput_gflops(8, 1.0);
    assert!((gflops - 1.6e-5).abs() < 1e-12);
    assert!(throughput_gflops(8, 0.0).is_infinite());
}
