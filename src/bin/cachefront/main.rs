use anyhow::Context;
use cachefront::{
    Address,
    net::{Listener, ListenerKind},
    proxy::{Cluster, ClusterConfig},
    session,
};
use clap::Parser;
use serde::Deserialize;
use std::{
    backtrace::Backtrace,
    fs::OpenOptions,
    net::SocketAddr,
    panic::PanicHookInfo,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

#[global_allocator]
static ALLOCATOR: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Protocol-aware proxy for Memcache and Redis backend fleets.
#[derive(Debug, Parser)]
#[clap(version)]
struct Args {
    /// Path to the TOML configuration file.
    #[clap(long, default_value = "cachefront.toml")]
    config: PathBuf,

    /// Override the configured listen endpoint.
    #[clap(long)]
    listen: Option<Address>,

    /// Override the configured log file.
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Override the configured worker thread count (0 = current thread).
    #[clap(long)]
    worker_threads: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct Config {
    /// Client listen endpoint: an IP address and port, or a Unix socket
    /// path.
    listen: Address,

    /// Prometheus scrape endpoint. The proxy only records; exposition is
    /// wired by the operator's scrape sidecar.
    #[serde(default)]
    prometheus: Option<SocketAddr>,

    /// 0 = current-thread runtime.
    #[serde(default)]
    worker_threads: usize,

    /// Logs go to stdout unless a file is given.
    #[serde(default)]
    log_file: Option<PathBuf>,

    cluster: ClusterConfig,
}

impl Config {
    fn load(args: &Args) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read config file {}", args.config.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", args.config.display()))?;
        if let Some(listen) = &args.listen {
            config.listen = listen.clone();
        }
        if let Some(log_file) = &args.log_file {
            config.log_file = Some(log_file.clone());
        }
        if let Some(worker_threads) = args.worker_threads {
            config.worker_threads = worker_threads;
        }
        Ok(config)
    }
}

fn panic_hook(info: &PanicHookInfo) {
    let payload = info.payload();
    let payload = if let Some(s) = payload.downcast_ref::<&str>() {
        Some(*s)
    } else {
        payload.downcast_ref().map(String::as_str)
    };

    let location = info.location().map(ToString::to_string);
    let backtrace = Backtrace::capture();

    error!(
        payload = payload,
        location = location,
        backtrace = ?backtrace,
        "A panic occurred",
    );
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env()?;
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_env_filter(env_filter);
    if let Some(log_file) = &config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_writer(file).with_ansi(false).init();
        std::panic::set_hook(Box::new(panic_hook));
    } else {
        subscriber.init();
    }

    info!("Starting cachefront");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("{config:?}");

    let mut runtime = if config.worker_threads > 0 {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.worker_threads(config.worker_threads);
        builder
    } else {
        tokio::runtime::Builder::new_current_thread()
    };
    let result = runtime
        .enable_io()
        .enable_time()
        .build()
        .map_err(Into::into)
        .and_then(|runtime| runtime.block_on(run(config)));
    let exit_code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Proxy encountered an error: {e:#}");
            ExitCode::FAILURE
        }
    };

    info!("Proxy stopped");

    Ok(exit_code)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cluster = Cluster::new(&config.cluster)?;
    if let Some(addr) = config.prometheus {
        info!("Prometheus scrape endpoint configured at {addr}");
    }

    let listener = config
        .listen
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("Listening on {}", config.listen);

    let sessions = TaskTracker::new();
    let shutdown = CancellationToken::new();
    match listener {
        ListenerKind::Tcp(listener) => {
            tokio::spawn(accept_loop(
                listener,
                cluster,
                sessions.clone(),
                shutdown.clone(),
            ));
        }
        ListenerKind::Unix(listener) => {
            tokio::spawn(accept_loop(
                listener,
                cluster,
                sessions.clone(),
                shutdown.clone(),
            ));
        }
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    info!("Shutting down");
    shutdown.cancel();
    sessions.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, sessions.wait())
        .await
        .is_err()
    {
        warn!("Shutdown grace period expired with sessions still active");
    }

    if let Address::Unix(path) = &config.listen
        && let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove Unix socket file '{}': {e}", path.display());
    }
    Ok(())
}

async fn accept_loop<L: Listener>(
    listener: L,
    cluster: Arc<Cluster>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let stream = select! {
            () = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    continue;
                }
            },
        };
        sessions.spawn(session::run(cluster.clone(), stream, shutdown.clone()));
    }
}
