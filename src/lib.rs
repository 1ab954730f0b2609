pub mod bus;
pub mod camera;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod logging;
pub mod module;
pub mod pipeline;
pub mod publish;
pub mod server;
pub mod settings;
pub mod shutdown;
pub mod tasks;

use std::process::ExitCode;
use std::time::Duration;

pub use server::{Server, ServerError};

use config::Cli;

/// How long shutdown waits for all vision loops together.
const STOP_DEADLINE: Duration = Duration::from_secs(2);

/// Run the server until Ctrl-C. Fails when setup fails or any module
/// does not stop cleanly.
pub fn run(cli: &Cli) -> ExitCode {
    let config = match cli.server_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::build(&config, cli.store_path()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to build server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.start() {
        tracing::error!("Failed to start vision modules: {e}");
        server.shutdown(STOP_DEADLINE);
        return ExitCode::FAILURE;
    }

    wait_for_ctrl_c();
    tracing::info!("Shutting down");

    let report = server.shutdown(STOP_DEADLINE);
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        for (camera, reason) in &report.failed {
            tracing::error!("'{camera}' failed to stop: {reason}");
        }
        ExitCode::FAILURE
    }
}

fn wait_for_ctrl_c() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build signal runtime: {e}");
            return;
        }
    };
    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
    }
}
