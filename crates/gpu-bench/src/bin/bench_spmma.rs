//! Times one cuSPARSELt 2:4 structured SpMM call
use gpu_bench::{cli, OperationKind};

fn main() {
    std::process::exit(cli::main_with_args(OperationKind::StructuredSpmm, std::env::args_os()));
}
