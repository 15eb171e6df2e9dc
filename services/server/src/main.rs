// server: Control-plane server binary.
//
// Flags: -d  run as a detached daemon.
//
// Config comes from CAMLINK_CONFIG or /etc/camlink/server.toml.  Startup
// errors (bad flags, unreadable config or certificates) exit -1; the
// daemonisation fork must happen before the tokio runtime exists, so the
// runtime is built by hand.

use server::control::{ControlServer, ServerTuning};
use server::restream::{run_bridge, RestreamBridge};
use std::env;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let mut run_as_daemon = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-d" => run_as_daemon = true,
            other => {
                eprintln!("unknown argument: {other}");
                exit(-1);
            }
        }
    }

    if run_as_daemon {
        match server::daemon::daemonize() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                eprintln!("daemonize failed: {e}");
                exit(-1);
            }
        }
    }

    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = env::var("CAMLINK_CONFIG")
        .unwrap_or_else(|_| "/etc/camlink/server.toml".to_owned());
    let config = match cl_config::file::load_config_from_path(config_path.as_ref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load config");
            exit(-1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            exit(-1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!(error = %e, "server failed to start");
        exit(-1);
    }
}

async fn serve(config: Arc<cl_config::MemoryConfig>) -> Result<(), server::control::ServerError> {
    let config: Arc<dyn cl_config::ConfigQuery> = config;
    let control = ControlServer::bind(Arc::clone(&config), ServerTuning::default()).await?;
    let handle = control.handle();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));

    // The media restreamer feeds viewer events into this channel.
    let (restream_tx, restream_rx) = tokio::sync::mpsc::unbounded_channel();
    let bridge = RestreamBridge::new(handle, Arc::clone(&config));
    let bridge_task = tokio::spawn(run_bridge(bridge, restream_rx, shutdown_rx));
    let _restream_tx = restream_tx;

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    let _ = control_task.await;
    let _ = bridge_task.await;
    info!("server shut down gracefully");
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
