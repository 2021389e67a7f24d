//! Local test-cluster bootstrapper.
//!
//! Materializes a reproducible Gunkan topology under a base directory, issues its certificate chain, renders the
//! discovery agent configuration, then runs every service until interrupted.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use sandbox_app::prelude::*;
use sandbox_error::GenericError;
use tracing::{error, info};

mod config;
use self::config::{Action, Cli};

mod driver;
use self::driver::Driver;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli).await {
        Ok(()) => info!("gunkan-sandbox stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    let config = cli.load_config()?;
    let driver = Driver::from_config(config)?;

    match cli.action.unwrap_or(Action::Run) {
        Action::Plan => {
            for line in driver.plan() {
                println!("{}", line);
            }
        }
        Action::Render => {
            driver.prepare().await?;
            info!(services = driver.topology().len(), "Sandbox rendered.");
        }
        Action::Run => {
            info!(services = driver.topology().len(), "gunkan-sandbox starting...");

            // Handlers are registered before anything is spawned, so an early interrupt is never lost.
            let mut termination = TerminationRequest::from_os_signals()?;
            let report = driver.run(&mut termination).await?;

            info!(
                reaped = report.statuses.len(),
                forced = report.forced.len(),
                "Sandbox shut down."
            );
        }
    }

    Ok(())
}
