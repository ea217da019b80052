// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_harness::{
    config::load_settings, logging, orchestrator::Orchestrator, ProgressHandler,
};
use std::{process::ExitCode, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(err) => {
            logging::init("info");
            error!(error = err.to_string(), "failure to load configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.app.log_level);
    info!(rabbitmq = ?settings.rabbitmq, workload = ?settings.workload, "starting harness");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("ctrl-c received, shutting down workers");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!(error = err.to_string(), "failure to listen for ctrl-c"),
        }
        // The sender is kept alive on purpose: a closed channel is not a
        // shutdown request, so receivers must never observe one.
        std::future::pending::<()>().await;
    });

    let handler = Arc::new(ProgressHandler::new(std::io::stdout()));
    let orchestrator = Orchestrator::new(&settings, handler);

    let mut progress = orchestrator.progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let summary = *progress.borrow_and_update();
            info!(
                published = summary.published,
                acknowledged = summary.acknowledged,
                failed_workers = summary.failed_workers,
                "workload progress"
            );
        }
    });

    match orchestrator.run(shutdown_rx).await {
        Ok(summary) if summary.failed_workers == 0 => ExitCode::SUCCESS,
        Ok(summary) => {
            warn!(failed_workers = summary.failed_workers, "some workers failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = err.to_string(), "harness aborted");
            ExitCode::FAILURE
        }
    }
}
