use std::path::PathBuf;
use std::sync::Arc;
use tierwarden::config::Config;
use tierwarden::control::{self, ControlRequest};
use tierwarden::events::SupervisorEvent;
use tierwarden::ports::SystemPortTable;
use tierwarden::registry::SystemRegistry;
use tierwarden::supervisor::Supervisor;
use tierwarden::{PKG_NAME, VERSION};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Signals waiting for the dispatcher
const CONTROL_CHANNEL_CAPACITY: usize = 8;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tierwarden=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tierwarden.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let auto_start = config.supervisor.auto_start;
    let supervisor = Supervisor::spawn(
        config,
        Arc::new(SystemRegistry::new()),
        Arc::new(SystemPortTable),
    );

    let forwarder = tokio::spawn(forward_events(supervisor.subscribe()));

    // Handlers are installed before the first start so an early SIGTERM stops it
    let (request_tx, request_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let listener = listen_for_signals(request_tx)?;
    if !auto_start {
        info!("Auto start disabled; send SIGUSR1 to start the servers");
    }

    let result = control::serve(supervisor, request_rx, auto_start).await;
    listener.abort();
    forwarder.abort();

    result?;
    info!("Shutdown complete");
    Ok(())
}

/// Translate SIGINT/SIGTERM (shutdown), SIGHUP (recycle) and SIGUSR1 (start)
#[cfg(unix)]
fn listen_for_signals(requests: mpsc::Sender<ControlRequest>) -> anyhow::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    ControlRequest::Shutdown
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    ControlRequest::Shutdown
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, recycling backend...");
                    ControlRequest::Recycle
                }
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, starting servers...");
                    ControlRequest::Start
                }
            };
            if requests.send(request).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn listen_for_signals(requests: mpsc::Sender<ControlRequest>) -> anyhow::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down...");
        let _ = requests.send(ControlRequest::Shutdown).await;
    }))
}

/// Report start progress; log lines and alerts already reach `tracing` directly
async fn forward_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::Progress { step, percent }) => {
                info!(percent, ?step, "Start progress");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        listen_port = config.supervisor.listen_port,
        backend_port = config.supervisor.backend_port,
        recycle_interval_mins = config.supervisor.recycle_interval_mins,
        health_check_interval_secs = config.supervisor.health_check_interval_secs,
        auto_start = config.supervisor.auto_start,
        "Supervisor settings"
    );
    info!(
        root = %config.proxy.root.display(),
        executable = %config.proxy.executable,
        config_file = %config.proxy.config_file().display(),
        "Proxy installation"
    );
    info!(
        root = %config.backend.root.display(),
        executable = %config.backend.executable,
        max_requests = config.backend.max_requests,
        "Backend installation"
    );
}
