use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bedrockproxy_api::envelope::DaemonEvent;
use bedrockproxy_core::manager::BroadcastFn;
use bedrockproxy_core::{DataStore, ProcessSupervisor, ServerManager};
use bedrockproxy_ws::ConnectionManager;
use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Control-plane listen port. Overrides the `PORT` environment
    /// variable and the default of 8080.
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
    /// Data directory override. Defaults to
    /// `<user docs>/PEXData/BedrockProxy`.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Verbose level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Disable colors from output.
    #[arg(long)]
    no_color: bool,
    /// Raise the maximum number of open files allowed to avoid issues
    /// under many concurrently proxied servers.
    #[arg(long)]
    raise_ulimit: bool,
}

fn main() {
    let args = Args::parse();
    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_colors(!args.no_color)
        .init()
        .unwrap();

    if args.raise_ulimit {
        let ulimit = fdlimit::raise_fd_limit().unwrap_or(0);
        log::info!("Raised ulimit to {}", ulimit);
    }

    if let Err(err) = run(args) {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    let store = Arc::new(DataStore::new(data_dir.clone()));
    store
        .ensure_directories()
        .await
        .with_context(|| format!("unreadable data directory {:?}", data_dir))?;
    log::info!("Using data directory {:?}", data_dir);

    let app_config = store.load_config().await.context("failed to load config.json")?;
    log::debug!("Loaded config: {:#?}", app_config);

    let connections = ConnectionManager::new();
    let broadcast: BroadcastFn = {
        // A single ordered channel with one consumer task, rather than
        // `tokio::spawn`-per-event: the runtime gives no ordering guarantee
        // between independently spawned tasks, and §4.4 requires events to
        // reach any one subscriber in emission order.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DaemonEvent>();
        let consumer_connections = connections.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                consumer_connections.broadcast(event).await;
            }
        });
        Arc::new(move |event| {
            let _ = tx.send(event);
        })
    };

    let supervisor = ProcessSupervisor::new();
    let manager = ServerManager::new(store.clone(), supervisor, broadcast);
    manager.install_supervisor_bridge().await;
    manager
        .load()
        .await
        .context("failed to load server catalogue")?;

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8080);
    let bind_address: SocketAddr = ([0, 0, 0, 0], port).into();

    bedrockproxy_ws::start(
        bind_address,
        manager.clone(),
        store,
        connections.clone(),
        shutdown_signal(manager, connections),
    )
    .await
    .context("control plane server failed")?;

    log::info!("Shutdown complete");
    Ok(())
}

fn default_data_dir() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("PEXData")
        .join("BedrockProxy")
}

/// Waits for `SIGINT`/`SIGTERM`, then runs the shutdown sequence (§4.4):
/// stop every non-offline record (bounded by the manager's own 10s
/// budget), broadcast `server.shutdown`, and close every client
/// connection. The listen socket itself is closed by axum's graceful
/// shutdown once this future resolves.
async fn shutdown_signal(manager: Arc<ServerManager>, connections: Arc<ConnectionManager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutdown requested, stopping all servers...");
    manager.stop_all().await;
    connections.broadcast(DaemonEvent::ServerShutdown).await;
    connections.cleanup().await;
}
