// devicebox: Device-side agent binary.
//
// Usage: devicebox <server-host>
//
// TLS identity comes from ./client.crt and ./client.key; an optional
// ./server-ca.crt pins the CA the server certificate must chain to.

use devicebox::media::ProcessMediaFactory;
use devicebox::{AuthConfig, DeviceClient, DeviceClientConfig, Tuning};
use std::env;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CERTIFICATE_FILE: &str = "./client.crt";
const KEY_FILE: &str = "./client.key";
const SERVER_CA_FILE: &str = "./server-ca.crt";

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let mut args = env::args().skip(1);
    let Some(server_host) = args.next() else {
        error!("missing server host name");
        exit(-1);
    };
    if args.next().is_some() {
        error!("unexpected extra arguments");
        exit(-1);
    }

    info!(host = %server_host, "server host");

    let certificate = match std::fs::read_to_string(CERTIFICATE_FILE) {
        Ok(pem) => pem,
        Err(e) => {
            error!(path = CERTIFICATE_FILE, error = %e, "failed to read certificate file");
            exit(-1);
        }
    };
    let key = match std::fs::read_to_string(KEY_FILE) {
        Ok(pem) => pem,
        Err(e) => {
            error!(path = KEY_FILE, error = %e, "failed to read key file");
            exit(-1);
        }
    };
    let server_ca_pem = match std::fs::read_to_string(SERVER_CA_FILE) {
        Ok(pem) => Some(pem),
        Err(_) if !Path::new(SERVER_CA_FILE).exists() => None,
        Err(e) => {
            error!(path = SERVER_CA_FILE, error = %e, "failed to read server CA file");
            exit(-1);
        }
    };

    let tuning = Tuning::default();
    let client_config = DeviceClientConfig {
        server_host,
        server_port: cl_config::DEFAULT_CONTROL_PORT,
        auth: AuthConfig {
            certificate_pem: format!("{certificate}{key}"),
            server_ca_pem,
        },
        reconnect_interval: tuning.reconnect_interval,
    };

    if let Err(e) = DeviceClient::check_identity(&client_config) {
        error!(error = %e, "client identity unusable");
        exit(-1);
    }

    let factory = Arc::new(ProcessMediaFactory::new(&tuning));
    let (controller, events_rx) = devicebox::spawn_controller(factory, tuning);
    let client = DeviceClient::new(client_config, controller.clone(), events_rx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let client_task = tokio::spawn(client.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = client_task.await;
    let _ = controller.shutdown().await;
    info!("shut down gracefully");
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
