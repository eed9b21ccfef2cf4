//! Times one cuSPARSE CSR SDDMM call
use gpu_bench::{cli, OperationKind};

fn main() {
    std::process::exit(cli::main_with_args(OperationKind::SddmmCsr, std::env::args_os()));
}
