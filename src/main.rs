use anyhow::Context as _;
use clap::Parser;
use kulku::cli::{Cli, Command, RunArgs};
use kulku::config::ControllerConfig;
use kulku::controller::cdevents::HttpEventSink;
use kulku::controller::clock::SystemClock;
use kulku::controller::prometheus::PrometheusProvider;
use kulku::controller::{Context, ControlPlane, Engine, ReconcilerRegistry};
use kulku::runtime::{RetryingRuntime, SimulatedRuntime};
use kulku::server::{
    bind, build_router, create_metrics, serve, shutdown_channel, wait_for_signal, ReadinessState,
};
use kulku::store::{MemoryStore, StateStore};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Log filter for `-v` count; `RUST_LOG` wins when set
fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Environment config with command line overrides applied
fn load_config(args: &RunArgs) -> anyhow::Result<ControllerConfig> {
    let mut config = ControllerConfig::from_env()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(ref path) = args.state_file {
        config.state_file = Some(path.clone());
    }
    if let Some(ref address) = args.prometheus_address {
        config.prometheus_address = Some(address.clone());
    }
    if let Some(ref url) = args.cdevents_sink_url {
        config.cdevents_enabled = true;
        config.cdevents_sink_url = Some(url.clone());
    }
    Ok(config)
}

async fn run_daemon(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    info!(
        port = config.http_port,
        workers = config.workers,
        "Starting kulku controller"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().context("failed to create metrics registry")?;

    let store = match config.state_file {
        Some(ref path) => MemoryStore::open(path)?,
        None => {
            info!("No state file configured, state is kept in memory only");
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);

    let simulated: Arc<SimulatedRuntime> = Arc::new(SimulatedRuntime::new().with_bus(store.bus()));
    let runtime = Arc::new(RetryingRuntime::new(
        simulated,
        config.call_timeout,
        config.call_retries,
    ));

    let sink = HttpEventSink::new(config.cdevents_enabled, config.cdevents_sink_url.clone());
    info!(enabled = config.cdevents_enabled, "CDEvents sink configured");

    let mut ctx = Context::new(store.clone(), runtime, Arc::new(SystemClock), config.clone())
        .with_cdevents_sink(Arc::new(sink))
        .with_metrics(metrics.clone());
    match config.prometheus_address {
        Some(ref address) => {
            info!(address = %address, "Prometheus provider configured");
            ctx = ctx.with_metrics_provider(Arc::new(PrometheusProvider::new(
                address.clone(),
                config.call_timeout,
            )));
        }
        None => info!("Prometheus address not configured, canary analysis disabled"),
    }
    let ctx = Arc::new(ctx);

    let engine = Arc::new(Engine::new(ctx.clone(), ReconcilerRegistry::standard()));
    let control = Arc::new(ControlPlane::new(ctx.clone()).with_queue(engine.queue()));

    let listener = bind(config.http_port)
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    let router = build_router(readiness.clone(), metrics, control);
    let server_handle = tokio::spawn(serve(listener, router, shutdown_signal.clone()));

    let engine_handle = tokio::spawn(engine.clone().run(shutdown_signal.clone()));

    readiness.set_ready();
    info!("Controller ready, reconciling");

    match wait_for_signal().await {
        Ok(signal) => info!(signal = signal, "Initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to wait for termination signal, shutting down"),
    }
    readiness.set_not_ready();
    shutdown_controller.shutdown();

    info!("Stopping components...");
    if let Err(e) = engine_handle.await {
        warn!(error = %e, "Engine task ended abnormally");
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "HTTP server failed"),
        Err(e) => warn!(error = %e, "HTTP server task ended abnormally"),
    }
    // The engine flushes on exit; flush again in case it never started
    store.flush().await?;

    info!("kulku controller shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose))),
        )
        .init();

    match cli.command {
        Command::Run(args) => run_daemon(args).await,
        command => {
            if let Err(e) = command.execute(&cli.server).await {
                eprintln!("error: {}", e);
                std::process::exit(e.exit_code());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
