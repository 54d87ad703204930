//! `mlprep` command line.
//!
//! ```bash
//! mlprep check pipelines/customers.yaml
//! mlprep run pipelines/customers.yaml --streaming --memory-limit 2GB
//! ```
//!
//! Exit codes: 0 success, 2 configuration error, 3 schema error,
//! 4 validation failure, 5 I/O error, 1 anything else.

#![warn(clippy::all, rust_2018_idioms)]
#![expect(clippy::print_stdout, clippy::print_stderr)]

mod cli;

use clap::Parser as _;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match cli::run_command(cli) {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(cli::exit_code(&err))
        }
    }
}
