use std::io;
use std::process::ExitCode;

use clap::Parser;
use procrastinate_cli::{Cli, run};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    procrastinate_observability::init_with_verbosity(
        cli.global.verbosity(),
        cli.global.log_format.into(),
    );

    let app = cli.global.app();
    match run(&cli.command, &app, &mut io::stdout()).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
