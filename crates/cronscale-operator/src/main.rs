use std::sync::Arc;

use clap::Parser;
use cronscale_operator::{
    cli::{APP_NAME, Command, Opts},
    client::Client,
    crd, driver, health, logging,
    utils::signal::{SignalError, SignalWatcher},
};
use snafu::{ResultExt, Snafu};
use tracing::{error, info};

const LOG_ENV: &str = "CRONSCALE_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print CustomResourceDefinition"))]
    PrintCrd { source: crd::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateKubeClient { source: kube::Error },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: SignalError },

    #[snafu(display("health server failed"))]
    HealthServer { source: health::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    let run = match opts.command {
        Command::Crd => return crd::print_yaml_schema().context(PrintCrdSnafu),
        Command::Run(run) => run,
    };

    logging::initialize_logging(LOG_ENV, APP_NAME, run.log_format)
        .context(InitializeLoggingSnafu)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        watch_namespace = %run.watch_namespace,
        "starting {APP_NAME}"
    );

    let kube_client = kube::Client::try_default()
        .await
        .context(CreateKubeClientSnafu)?;
    let client = Arc::new(Client::new(kube_client, Some(run.field_manager.clone())));
    let shutdown = SignalWatcher::shutdown().context(WatchSignalsSnafu)?;
    let health_listener = health::bind(run.health_bind_address)
        .await
        .context(HealthServerSnafu)?;

    let (mut loops, statuses) = driver::spawn_loops(
        &client,
        run.watch_namespace.scopes(),
        &run.loop_config(),
        &shutdown,
    );
    let health_server = tokio::spawn(health::serve(health_listener, statuses, shutdown.clone()));

    while let Some(result) = loops.join_next().await {
        if let Err(join_error) = result {
            error!(
                error = &join_error as &dyn std::error::Error,
                "control loop terminated unexpectedly"
            );
        }
    }

    match health_server.await {
        Ok(result) => result.context(HealthServerSnafu)?,
        Err(join_error) => error!(
            error = &join_error as &dyn std::error::Error,
            "health server terminated unexpectedly"
        ),
    }

    info!("shut down");
    Ok(())
}
