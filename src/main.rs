use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use ivrd::cli::{self, Cli};
use ivrd::telemetry;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let log_format = cli.log_format;
    let options = match cli.into_options() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}\n\n{}", cli::short_usage());
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = telemetry::initialise(log_format) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    match ivrd::run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "ivrd", error = %err, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
