use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use act_runner::config::RunnerConfig;
use act_runner::daemon::Daemon;
use act_runner::engine;
use act_runner::logging;
use act_runner::runner::{HandlerRegistry, ProcessHandler};
use act_runner::session::WsConnector;

const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fleet worker that polls a CI server for builds and runs them.
#[derive(Debug, Parser)]
#[command(name = "act-runner", version)]
struct Cli {
    /// Load environment variables from this file before reading configuration.
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = dotenvy::from_path(&cli.env_file) {
        if !e.not_found() {
            return Err(e).with_context(|| format!("failed to read {}", cli.env_file.display()));
        }
    }

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = RunnerConfig::from_env().context("failed to load runner configuration")?;
    let _log_guard = logging::init(&config.log).context("failed to initialize logging")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.session.server_url,
        labels = ?config.identity.labels().iter().map(ToString::to_string).collect::<Vec<_>>(),
        "act-runner starting"
    );

    if config.identity.needs_container_engine() {
        engine::probe(&config.docker_host, ENGINE_PROBE_TIMEOUT)
            .await
            .context("labels require a container engine")?;
    }

    let mut handlers = HandlerRegistry::new();
    for event in &config.executor.events {
        handlers.register(Arc::new(ProcessHandler::from_config(
            event.clone(),
            &config.executor,
        )));
    }

    let shutdown = CancellationToken::new();
    listen_for_signals(shutdown.clone()).context("failed to install signal handlers")?;

    let connector = Arc::new(WsConnector::from_policy(&config.session));
    let identity = Arc::new(config.identity);
    let span = tracing::info_span!("runner", uuid = %identity.uuid(), name = %identity.name());
    let daemon = Daemon::new(
        identity,
        config.session,
        config.task,
        connector,
        handlers,
        shutdown,
    );

    daemon.run().instrument(span).await?;
    Ok(())
}

#[cfg(unix)]
fn listen_for_signals(shutdown: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn listen_for_signals(shutdown: CancellationToken) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            shutdown.cancel();
        }
    });
    Ok(())
}
