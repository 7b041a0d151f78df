//! Demo app: `procrastinate-demo client` defers sample jobs, every other
//! subcommand behaves like `procrastinate` with the demo tasks registered.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use procrastinate_cli::demo::{defer_demo_jobs, demo_app};
use procrastinate_cli::{Command, GlobalArgs, Outcome, run};
use procrastinate_infra::PgConnector;

#[derive(Parser, Debug)]
#[command(name = "procrastinate-demo")]
#[command(about = "Procrastinate demo app")]
struct DemoCli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: DemoCommand,
}

#[derive(Subcommand, Debug)]
enum DemoCommand {
    /// Defer a batch of demo jobs
    Client,
    #[command(flatten)]
    App(Command),
}

async fn execute(cli: DemoCli) -> anyhow::Result<Outcome> {
    let connector = Arc::new(PgConnector::new(cli.global.connector_config()));
    let app = demo_app(connector).context("failed to register demo tasks")?;
    match &cli.command {
        DemoCommand::Client => {
            app.open().await.context("could not connect to the database")?;
            let ids = defer_demo_jobs(&app).await;
            app.close().await?;
            for id in ids? {
                println!("deferred job {id}");
            }
            Ok(Outcome::Success)
        }
        DemoCommand::App(command) => run(command, &app, &mut io::stdout()).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = DemoCli::parse();
    procrastinate_observability::init_with_verbosity(
        cli.global.verbosity(),
        cli.global.log_format.into(),
    );

    match execute(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
