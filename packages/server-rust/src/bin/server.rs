//! Cloud Run service entry point.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use cloudrun_server::config::{AppConfig, CliArgs};
use cloudrun_server::network::{api_router, install_signal_handlers, NetworkModule, ShutdownTrigger};
use cloudrun_server::service::middleware::install_backtrace_hook;
use cloudrun_server::storage::{self, register_pool_release};
use cloudrun_server::telemetry::init_tracing;
use cloudrun_server::{build_pipeline, ShutdownCoordinator, ShutdownRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::try_from(CliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(config.log_format) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    install_backtrace_hook();

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    let pool = storage::connect(&config.database)
        .await
        .context("failed to connect to database")?;

    let registry = Arc::new(ShutdownRegistry::new());
    register_pool_release(&registry, pool)?;

    let mut server = NetworkModule::new(config.network.clone());
    server.start().await?;

    let trigger = ShutdownTrigger::new();
    install_signal_handlers(trigger.clone()).context("failed to install signal handlers")?;

    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&registry),
        server.handle(),
        config.network.shutdown_timeout,
    );
    let shutdown = tokio::spawn(coordinator.run(trigger.clone()));

    let served = server.serve(build_pipeline(api_router(), &config.service)).await;
    if let Err(e) = &served {
        error!(error = %e, "server stopped unexpectedly");
        trigger.request();
    }

    let report = shutdown.await.context("shutdown task failed")?;
    if served.is_ok() && report.is_success() {
        info!("server exited");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
