//! Times one cuSPARSE CSR SpMM call
use gpu_bench::{cli, OperationKind};

fn main() {
    std::process::exit(cli::main_with_args(OperationKind::SpmmCsr, std::env::args_os()));
}
