//! netbd daemon - NBD server exposing named block-storage exports.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use netbd::control::serve_control;
use netbd::{Config, DEFAULT_EXPORT_SIZE_BYTES, Daemon, ExportConfig, Listener, NbdError, Network};

#[derive(Parser)]
#[command(name = "netbd", about = "NBD server exposing named block-storage exports")]
struct Cli {
    /// Path to config file. If omitted, serves one 1 GiB in-memory export.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address: host:port for tcp, a socket path for unix.
    #[arg(long)]
    address: Option<String>,

    /// Listener transport ("tcp" or "unix").
    #[arg(long)]
    network: Option<Network>,

    /// Serve a single in-memory export with this name instead of the
    /// configured exports.
    #[arg(long)]
    name: Option<String>,

    /// Description of the single in-memory export.
    #[arg(long)]
    description: Option<String>,

    /// Size in bytes of the single in-memory export.
    #[arg(long)]
    size: Option<u64>,

    /// Refuse write, trim and write-zeroes commands.
    #[arg(long)]
    read_only: bool,

    #[arg(long)]
    minimum_block_size: Option<u32>,

    #[arg(long)]
    preferred_block_size: Option<u32>,

    #[arg(long)]
    maximum_block_size: Option<u32>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.address {
            config.server.address = address.clone();
        }
        if let Some(network) = self.network {
            config.server.network = network;
        }
        if self.read_only {
            config.options.read_only = true;
        }
        if let Some(size) = self.minimum_block_size {
            config.options.minimum_block_size = size;
        }
        if let Some(size) = self.preferred_block_size {
            config.options.preferred_block_size = size;
        }
        if let Some(size) = self.maximum_block_size {
            config.options.maximum_block_size = size;
        }

        if self.name.is_some() || self.description.is_some() || self.size.is_some() {
            config.exports = vec![ExportConfig {
                name: self.name.clone().unwrap_or_else(|| "default".to_string()),
                description: self
                    .description
                    .clone()
                    .unwrap_or_else(|| "The default export".to_string()),
                backend: format!(
                    "memory:?size={}",
                    self.size.unwrap_or(DEFAULT_EXPORT_SIZE_BYTES)
                ),
            }];
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let daemon = Daemon::from_config(config)
        .await
        .context("Failed to create daemon")?;

    // Setup control socket
    let socket_path = daemon.config().socket.clone();
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    remove_stale_socket(&socket_path)?;
    let control_listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind: {}", socket_path.display()))?;

    let address = daemon.address().to_string();
    let network = daemon.config().server.network;
    let mut nbd_handle = match network {
        Network::Tcp => {
            let listener = TcpListener::bind(&address)
                .await
                .with_context(|| format!("Failed to bind NBD listener: {}", address))?;
            spawn_listener(daemon.clone(), listener)
        }
        Network::Unix => {
            remove_stale_socket(Path::new(&address))?;
            let listener = UnixListener::bind(&address)
                .with_context(|| format!("Failed to bind NBD listener: {}", address))?;
            spawn_listener(daemon.clone(), listener)
        }
    };

    let exports = daemon.registry().len().await;
    info!(
        socket = %socket_path.display(),
        address = %address,
        network = %network,
        exports,
        read_only = daemon.options().read_only,
        "netbd started"
    );

    // Spawn control socket handler
    let control_handle = tokio::spawn({
        let daemon = daemon.clone();
        async move {
            loop {
                match control_listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_control(stream, &daemon).await {
                                error!(error = %e, "Control connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        break;
                    }
                }
            }
        }
    });

    let result = tokio::select! {
        signal = shutdown_signal() => signal,
        served = &mut nbd_handle => match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("NBD server error")),
            Err(e) => Err(anyhow::Error::new(e).context("NBD server task failed")),
        },
    };

    // Clean up
    nbd_handle.abort();
    control_handle.abort();
    let _ = std::fs::remove_file(&socket_path);
    if network == Network::Unix {
        let _ = std::fs::remove_file(&address);
    }

    result
}

fn spawn_listener<L>(daemon: Daemon, listener: L) -> JoinHandle<Result<(), NbdError>>
where
    L: Listener + 'static,
{
    tokio::spawn(async move { daemon.listen(listener).await })
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        tokio::select! {
            ctrl_c = signal::ctrl_c() => {
                ctrl_c.context("Failed to wait for Ctrl+C")?;
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl+C")?;
        info!("Received SIGINT");
    }
    Ok(())
}
