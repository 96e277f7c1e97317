use clap::Parser;
use sdk_http_client::cli::error::CliError;
use sdk_http_client::cli::logs;
use sdk_http_client::cli::probe::{ProbeArgs, run};
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let args = ProbeArgs::parse();

    if let Err(err) = logs::init(args.log_level) {
        eprintln!("Failed to initialize tracing: {err:?}");
        return err.into();
    }

    match run(&args) {
        Ok(result) => {
            println!("{result}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("probe failed: {err}");
            ExitCode::from(err)
        }
    }
}
