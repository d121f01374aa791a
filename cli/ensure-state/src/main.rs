//! ensure-state - converge a virtual machine to a declared runtime state
//!
//! Exits 0 when the machine needed nothing or the one declared action was
//! applied, and 1 on any failure.

use clap::Parser;

mod cli;
mod config;
mod error;
mod logging;

use cli::Cli;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose);
    let verbose = cli.verbose > 0;

    if let Err(e) = cli.run() {
        error::print_error(&e, verbose);
        std::process::exit(1);
    }
}
