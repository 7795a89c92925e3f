use nodegate::config::{Config, CONFIG_ENV};
use nodegate::exec::SystemShell;
use nodegate::proxy::{ProxyServer, ProxyState};
use nodegate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nodegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: first argument, then NODEGATE_CONFIG, then defaults
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty()))
        .map(PathBuf::from);

    let config = Config::load_with_env(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    match config_path {
        Some(ref path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file given, using defaults"),
    }

    print_startup_banner(&config);

    // Write PID file (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file_path();
    let pid_file = write_pid_file(&pid_file_path)?;
    info!(path = %pid_file_path.display(), "PID file written and locked");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let state = Arc::new(ProxyState::new(&config, Arc::new(SystemShell::new())));

    // Probe the runtime once at startup
    match state.resolver().runtime().list_clusters().await {
        Ok(clusters) => info!(
            runtime = %config.runtime.command,
            clusters = clusters.len(),
            "Container runtime reachable"
        ),
        Err(e) => warn!(
            runtime = %config.runtime.command,
            error = %e,
            "Container runtime not usable yet, requests will fail until it is"
        ),
    }

    let server = ProxyServer::new(addr, Arc::clone(&state), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    info!(url = %format!("http://{}/", addr), "Open the landing page in a browser");

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    drop(pid_file);
    if let Err(e) = std::fs::remove_file(&pid_file_path) {
        warn!(path = %pid_file_path.display(), error = %e, "Failed to remove PID file");
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        // Truncated only once the lock is held
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
        .map_err(|e| anyhow::anyhow!("Failed to write PID file '{}': {}", path.display(), e))
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting cluster console proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        command = %config.runtime.command,
        container_prefix = %config.runtime.container_prefix,
        exec_timeout_secs = config.runtime.exec_timeout_secs,
        fetch_max_time_secs = config.runtime.fetch_max_time_secs,
        cache_ttl_secs = config.resolver.cache_ttl_secs,
        "Container runtime settings"
    );
}
