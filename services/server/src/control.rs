//! Control server: accepts device TLS connections and exposes the
//! stream-request entry points the restream side drives.
//!
//! Desires are recorded in the session registry first and forwarded to the
//! live session second, so a request against an offline device is not lost:
//! it replays when the device next reaches Ready.

use crate::registry::{SessionCommand, SessionRegistry};
use crate::session;
use crate::tls::{self, TlsError};
use cl_config::ConfigQuery;
use cl_protocol::{DeviceId, SourceId, StreamDst};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerTuning {
    /// Delay before re-issuing a RequestStream after a failed StreamStatus.
    pub stream_retry: Duration,
    /// Server certificate reload period, shared with the restream side.
    pub certificate_refresh: Duration,
}

impl Default for ServerTuning {
    fn default() -> Self {
        Self {
            stream_retry: Duration::from_secs(10),
            certificate_refresh: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub(crate) struct ServerState {
    pub config: Arc<dyn ConfigQuery>,
    pub registry: Mutex<SessionRegistry>,
    pub tuning: ServerTuning,
}

/// The accepting side of the control plane.
pub struct ControlServer {
    listener: TcpListener,
    acceptor: Arc<RwLock<TlsAcceptor>>,
    state: Arc<ServerState>,
}

impl ControlServer {
    /// Build the TLS context and bind the control port from config.
    pub async fn bind(
        config: Arc<dyn ConfigQuery>,
        tuning: ServerTuning,
    ) -> Result<Self, ServerError> {
        let acceptor = tls::build_acceptor(config.as_ref())?;
        let port = config.server_settings().control_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(addr = %listener.local_addr()?, "control server listening");

        Ok(Self {
            listener,
            acceptor: Arc::new(RwLock::new(acceptor)),
            state: Arc::new(ServerState {
                config,
                registry: Mutex::new(SessionRegistry::default()),
                tuning,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Entry points usable while the accept loop runs.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept connections until `shutdown` flips.  Also refreshes the
    /// server certificate on the configured period.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let ControlServer {
            listener,
            acceptor,
            state,
        } = self;

        tokio::spawn(refresh_certificate(
            Arc::clone(&state),
            Arc::clone(&acceptor),
            shutdown_rx.clone(),
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            let acceptor = acceptor.read().await.clone();
                            tokio::spawn(session::serve(tcp, peer, acceptor, Arc::clone(&state)));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("control server stopped");
    }
}

async fn refresh_certificate(
    state: Arc<ServerState>,
    acceptor: Arc<RwLock<TlsAcceptor>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = state.tuning.certificate_refresh;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        match tls::build_acceptor(state.config.as_ref()) {
            Ok(fresh) => {
                *acceptor.write().await = fresh;
                info!("server certificate refreshed");
            }
            Err(e) => error!(error = %e, "certificate refresh failed, keeping previous"),
        }
    }
}

// ---------------------------------------------------------------------------
// Control handle
// ---------------------------------------------------------------------------

/// Clonable entry points for the restream bridge and operators.
#[derive(Clone)]
pub struct ControlHandle {
    state: Arc<ServerState>,
}

impl ControlHandle {
    /// Record that `source_id` should stream to `dst` and forward to the
    /// device when it has an active session.
    pub async fn request_stream(&self, device_id: &DeviceId, source_id: SourceId, dst: StreamDst) {
        let mut registry = self.state.registry.lock().await;
        let context = registry.get(device_id);
        context.stream_requested(source_id.clone(), dst.clone());

        match context.active() {
            Some(session) => {
                debug!(
                    device_id = %device_id,
                    source_id = %source_id,
                    dst = %dst,
                    "requesting stream"
                );
                let _ = session.send(SessionCommand::RequestStream(source_id));
            }
            None => debug!(
                device_id = %device_id,
                source_id = %source_id,
                "stream requested for not connected device"
            ),
        }
    }

    /// Remove the desire and forward a StopStream when connected.
    pub async fn stop_stream(&self, device_id: &DeviceId, source_id: &SourceId) {
        let mut registry = self.state.registry.lock().await;
        let context = registry.get(device_id);
        context.stop_requested(source_id);

        match context.active() {
            Some(session) => {
                debug!(device_id = %device_id, source_id = %source_id, "requesting stream stop");
                let _ = session.send(SessionCommand::StopStream(source_id.clone()));
            }
            None => debug!(
                device_id = %device_id,
                source_id = %source_id,
                "stream stop requested for not connected device"
            ),
        }
    }

    /// The device's desired streams in request order.
    pub async fn desired_streams(&self, device_id: &DeviceId) -> Vec<(SourceId, StreamDst)> {
        let registry = self.state.registry.lock().await;
        registry
            .find(device_id)
            .map(|context| context.desired_streams())
            .unwrap_or_default()
    }

    /// Whether the device currently has an active session.
    pub async fn is_connected(&self, device_id: &DeviceId) -> bool {
        let registry = self.state.registry.lock().await;
        registry
            .find(device_id)
            .map(|context| context.active().is_some())
            .unwrap_or(false)
    }
}
