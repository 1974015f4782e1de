use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use groupkind_controller::controller::{
    Controller, ControllerConfig, EventRecorder, KubeEventRecorder, LogEventRecorder,
    DEFAULT_FIELD_MANAGER,
};
use groupkind_controller::crd::App;
use groupkind_controller::registry::KindRegistry;
use groupkind_controller::store::{InMemoryStore, KubeStore, Store};
use groupkind_controller::Error;
use kube::core::DynamicObject;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show cluster information
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Number of parallel reconciles
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds between full resyncs of all Apps (0 disables)
    #[arg(long, env = "RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,

    /// Seconds to wait for the initial cache sync
    #[arg(long, env = "SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,

    /// Seconds in-flight reconciles may run after a shutdown signal
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// Field manager recorded on patches
    #[arg(long, env = "FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    /// Port of the health and metrics endpoint
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run against an in-process store instead of a cluster
    #[arg(long, env = "IN_MEMORY")]
    in_memory: bool,

    /// YAML documents loaded into the in-process store at startup
    #[arg(long, requires = "in_memory")]
    seed: Option<PathBuf>,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            namespace: self.namespace.clone(),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            resync_period: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            field_manager: self.field_manager.clone(),
            ..ControllerConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to inspect (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("groupkind-controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: kube::Api<App> = match &args.namespace {
        Some(ns) => kube::Api::namespaced(client, ns),
        None => kube::Api::all(client),
    };
    let apps = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed Apps: {}", apps.items.len());
    for kind in KindRegistry::builtin().kinds() {
        println!("Watched kind: {}", kind);
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .init(),
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!("Starting groupkind-controller v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(KindRegistry::builtin());
    let (store, recorder): (Arc<dyn Store>, Arc<dyn EventRecorder>) = if args.in_memory {
        let store = InMemoryStore::new(registry.clone());
        if let Some(path) = &args.seed {
            let count = seed(&store, &registry, path).await?;
            info!(count, path = %path.display(), "seeded in-memory store");
        }
        info!("Running against the in-memory store");
        (Arc::new(store), Arc::new(LogEventRecorder))
    } else {
        let client = kube::Client::try_default()
            .await
            .map_err(Error::KubeError)?;
        info!("Connected to Kubernetes cluster");
        (
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(KubeEventRecorder::new(client, args.field_manager.clone())),
        )
    };

    let controller = Controller::new(args.controller_config(), store, registry, recorder)?;
    let shutdown = CancellationToken::new();

    #[cfg(feature = "rest-api")]
    {
        let state = Arc::new(groupkind_controller::rest_api::ApiState {
            readiness: controller.readiness(),
        });
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.http_port));
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) =
                groupkind_controller::rest_api::run_server(state, addr, server_shutdown).await
            {
                error!("HTTP server error: {:?}", e);
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            shutdown.cancel();
        });
    }

    controller.run(shutdown).await
}

/// Wait for Ctrl+C
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}

/// Load every YAML document in `path` into the store
async fn seed(
    store: &InMemoryStore,
    registry: &KindRegistry,
    path: &Path,
) -> Result<usize, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;

    let mut count = 0;
    for document in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| {
            Error::ConfigError(format!("Invalid YAML in {}: {}", path.display(), e))
        })?;
        if value.is_null() {
            continue;
        }
        let mut object: DynamicObject = serde_yaml::from_value(value).map_err(|e| {
            Error::ConfigError(format!("Invalid object in {}: {}", path.display(), e))
        })?;

        let kind_name = object
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or_else(|| Error::ConfigError("Seed object without a kind".to_string()))?;
        let kind = registry.resolve(&kind_name)?;
        if kind.namespaced && object.metadata.namespace.is_none() {
            object.metadata.namespace = Some("default".to_string());
        }
        registry.validate(&kind_name, &object)?;

        store.upsert(kind, object).await;
        count += 1;
    }
    Ok(count)
}
