mod commands;
mod logging;
mod util;

use std::process::ExitCode;

use clap::Parser;
use commands::{Cli, Subcommands};

fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();
    match cli.command {
        Subcommands::Usage(args) => match commands::usage(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Subcommands::Simulate(args) => match commands::simulate(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Subcommands::Completions(args) => {
            commands::completions(args);
            ExitCode::SUCCESS
        }
    }
}
