mod bootstrap;
mod cli;
mod logging;
mod server;

use clap::Parser;
use tracing::{error, info};

use crate::cli::Cli;

fn main() {
    let cli = Cli::parse();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error:#}");
            std::process::exit(2);
        }
    };

    let _logging_guard = match logging::init(&config) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {error:#}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(error = %error, "failed to build the async runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(server::run(config)) {
        error!(error = %err, "fatal error");
        std::process::exit(1);
    }
    info!("shutdown complete");
}
