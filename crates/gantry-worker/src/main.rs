//! Gantry worker binary.
//!
//! Claims routed build envelopes from the shared queue and drives each one
//! through the execution engine against the configured container runtime.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gantry_client::{ControlPlane, RestClient};
use gantry_core::{Error, Result};
use gantry_executor::{Engine, EngineConfig};
use gantry_queue::{Queue, QueuedItem};
use gantry_runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "gantry", about = "Gantry CI build worker", version)]
struct Config {
    /// Control-plane base URL
    #[arg(long, env = "GANTRY_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Worker-to-server auth bearer token
    #[arg(long, env = "GANTRY_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    /// Queue backend (postgres, memory)
    #[arg(long, env = "GANTRY_QUEUE_DRIVER", default_value = "postgres")]
    queue_driver: String,

    /// Queue backend address
    #[arg(long, env = "GANTRY_QUEUE_ADDR")]
    queue_addr: Option<String>,

    /// Routing labels this worker serves
    #[arg(long, env = "GANTRY_WORKER_ROUTES", value_delimiter = ',')]
    routes: Vec<String>,

    /// Container runtime driver (docker, kubernetes)
    #[arg(long, env = "GANTRY_RUNTIME_DRIVER", default_value = "docker")]
    runtime_driver: String,

    /// Namespace for the kubernetes driver
    #[arg(long, env = "GANTRY_RUNTIME_NAMESPACE")]
    runtime_namespace: Option<String>,

    /// External secret store address; secrets resolve against the control
    /// plane when unset
    #[arg(long, env = "GANTRY_SECRET_ADDR")]
    secret_addr: Option<String>,

    /// External secret store token
    #[arg(long, env = "GANTRY_SECRET_TOKEN", default_value = "", hide_env_values = true)]
    secret_token: String,

    /// Maximum concurrently executing stages per build
    #[arg(long, env = "GANTRY_EXECUTOR_THREADS", default_value_t = 1)]
    threads: usize,

    /// Default per-build timeout in minutes
    #[arg(long, env = "GANTRY_BUILD_TIMEOUT", default_value_t = 30)]
    build_timeout: u64,

    /// Hostname reported into build containers
    #[arg(long, env = "HOSTNAME", default_value = "")]
    hostname: String,

    /// Log filter directive
    #[arg(long, env = "GANTRY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_tracing(directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(directive)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    if let Err(err) = init_tracing(&config.log_level) {
        eprintln!("invalid log level: {err}");
        std::process::exit(1);
    }

    match run(config).await {
        Ok(()) => {}
        Err(err @ Error::RuntimeUnavailable(_)) => {
            error!(error = %err, "runtime unreachable at startup");
            std::process::exit(2);
        }
        Err(err) => {
            error!(error = %err, "worker failed to start");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let runtime = gantry_runtime::new(
        config.runtime_driver.parse()?,
        config.runtime_namespace.clone(),
    )
    .await?;
    runtime.ping().await?;

    let queue = gantry_queue::new(
        config.queue_driver.parse()?,
        config.queue_addr.as_deref(),
    )
    .await?;

    let mut client = RestClient::new(&config.server, config.token.clone())?;
    if let Some(address) = &config.secret_addr {
        client = client.with_secret_store(address, config.secret_token.clone())?;
    }

    let worker_id = format!("{}-{}", config.hostname, uuid::Uuid::new_v4());
    info!(worker = %worker_id, routes = ?config.routes, "starting worker");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });

    operate(&config, &worker_id, runtime, client, queue, shutdown).await;
    Ok(())
}

/// Claim-and-execute loop. One build at a time; polling backs off when the
/// queue is empty or erroring.
async fn operate(
    config: &Config,
    worker_id: &str,
    runtime: Arc<dyn Runtime>,
    client: RestClient,
    queue: Arc<dyn Queue>,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match queue.pop(worker_id, &config.routes).await {
            Ok(Some(item)) => {
                execute_build(config, &runtime, &client, &queue, &shutdown, item).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to claim from queue");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }

    info!("worker stopped");
}

async fn execute_build(
    config: &Config,
    runtime: &Arc<dyn Runtime>,
    client: &RestClient,
    queue: &Arc<dyn Queue>,
    shutdown: &CancellationToken,
    item: QueuedItem,
) {
    let package = item.package.clone();
    info!(
        build = package.build.number,
        repo = %package.repo.full_name,
        "claimed build"
    );

    let scoped: Arc<dyn ControlPlane> = Arc::new(
        client.for_build(&package.repo.full_name, package.build.number),
    );

    let engine = Engine::new(
        EngineConfig {
            hostname: config.hostname.clone(),
            server: config.server.clone(),
            threads: config.threads,
            ..Default::default()
        },
        runtime.clone(),
        scoped,
        package,
    );

    // The watchdog cancels the build token on timeout or worker shutdown;
    // teardown still runs under its own scope.
    let minutes = if item.package.repo.timeout > 0 {
        item.package.repo.timeout as u64
    } else {
        config.build_timeout
    };
    let token = engine.cancellation_token();
    let watch_shutdown = shutdown.clone();
    let watchdog = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {
                warn!("build timeout exceeded");
            }
            _ = watch_shutdown.cancelled() => {}
        }
        token.cancel();
    });

    let result = engine.run().await;
    watchdog.abort();

    match result {
        Ok(()) => {
            if let Err(err) = queue.ack(item.id).await {
                warn!(error = %err, "failed to ack queue item");
            }
        }
        Err(err) => {
            error!(error = %err, "build failed");
            if let Err(ack) = queue.fail(item.id, &err.to_string()).await {
                warn!(error = %ack, "failed to report queue item failure");
            }
        }
    }
}
