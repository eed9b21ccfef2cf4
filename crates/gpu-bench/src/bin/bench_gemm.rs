//! Times one cuBLAS SGEMM call
use gpu_bench::{cli, OperationKind};

fn main() {
    std::process::exit(cli::main_with_args(OperationKind::Gemm, std::env::args_os()));
}
