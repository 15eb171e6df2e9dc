//! One inbound device session.
//!
//! The TLS handshake authenticates the device (pinned certificate, subject
//! commonName = device id).  An unknown device id, or a device that already
//! has an active session, is not forcibly closed: the connection idles
//! until the peer drops, which avoids thrashing during overlapping
//! reconnects.  A bound session serves the greeting, delivers config,
//! restores the desired streams on ClientReady, and re-issues a failed
//! stream request after the retry delay.

use crate::control::ServerState;
use crate::registry::SessionCommand;
use crate::tls;
use cl_config::Device;
use cl_protocol::{
    read_message, write_message, ClientConfig, CloudCredentials, ControlMessage, DeviceId,
    FrameReader, FrameWriter, ProtocolError, RequestStream, SourceId, StopStream, VideoSource,
};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected message type {0} from device")]
    UnexpectedMessage(u16),
}

/// Serve one accepted TCP connection to completion.
pub(crate) async fn serve(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
) {
    info!(peer = %peer, "session created");

    let tls = match acceptor.accept(tcp).await {
        Ok(tls) => tls,
        Err(e) => {
            info!(peer = %peer, error = %e, "tls handshake failed");
            return;
        }
    };

    let device_id = {
        let (_, connection) = tls.get_ref();
        let Some(cert) = connection.peer_certificates().and_then(|certs| certs.first()) else {
            info!(peer = %peer, "no client certificate after handshake");
            return;
        };
        match tls::device_id_from_certificate(cert) {
            Ok(id) => id,
            Err(e) => {
                info!(peer = %peer, error = %e, "client certificate rejected");
                return;
            }
        }
    };
    info!(peer = %peer, device_id = %device_id, "secure channel established");

    let Some(device) = state.config.find_device(&device_id) else {
        error!(device_id = %device_id, "unknown device");
        idle_until_close(tls).await;
        return;
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    {
        let mut registry = state.registry.lock().await;
        if !registry.get(&device_id).attach(&device_id, command_tx) {
            error!(device_id = %device_id, "device already connected");
            drop(registry);
            idle_until_close(tls).await;
            return;
        }
    }

    let result = run_session(tls, &device, &state, command_rx).await;
    match result {
        Ok(()) => debug!(device_id = %device_id, "session closed by peer"),
        Err(e) => warn!(device_id = %device_id, error = %e, "session ended"),
    }

    state.registry.lock().await.get(&device_id).detach(&device_id);
}

/// Read and discard until the peer closes.  Used for sessions refused past
/// the handshake.
async fn idle_until_close(mut tls: TlsStream<TcpStream>) {
    let mut scratch = [0u8; 4096];
    loop {
        match tls.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn run_session(
    tls: TlsStream<TcpStream>,
    device: &Device,
    state: &Arc<ServerState>,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<(), SessionError> {
    let (read_half, write_half) = tokio::io::split(tls);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    // One retry timer per session; a newer failure replaces a pending one.
    let mut retry: Option<(SourceId, Pin<Box<Sleep>>)> = None;

    loop {
        tokio::select! {
            message = read_message(&mut reader) => {
                let message = match message {
                    Ok(message) => message,
                    Err(ProtocolError::Frame(cl_protocol::FrameError::Closed)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                handle_message(message, device, state, &mut writer, &mut retry).await?;
            }
            command = command_rx.recv() => {
                match command {
                    Some(SessionCommand::RequestStream(source_id)) => {
                        send_request_stream(&mut writer, state, &device.id, source_id).await?;
                    }
                    Some(SessionCommand::StopStream(source_id)) => {
                        debug!(source_id = %source_id, "sending StopStream");
                        write_message(
                            &mut writer,
                            &ControlMessage::StopStream(StopStream { source_id }),
                        )
                        .await?;
                    }
                    None => return Ok(()),
                }
            }
            _ = wait_retry(&mut retry), if retry.is_some() => {
                if let Some((source_id, _)) = retry.take() {
                    send_request_stream(&mut writer, state, &device.id, source_id).await?;
                }
            }
        }
    }
}

async fn wait_retry(retry: &mut Option<(SourceId, Pin<Box<Sleep>>)>) {
    match retry {
        Some((_, sleep)) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn handle_message<W>(
    message: ControlMessage,
    device: &Device,
    state: &Arc<ServerState>,
    writer: &mut FrameWriter<W>,
    retry: &mut Option<(SourceId, Pin<Box<Sleep>>)>,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    match message {
        ControlMessage::ClientGreeting => {
            debug!("got ClientGreeting");
            write_message(writer, &ControlMessage::ServerGreeting).await?;
        }
        ControlMessage::ClientConfigRequest => {
            debug!("got ClientConfigRequest");
            let config = build_client_config(device, state);
            write_message(writer, &ControlMessage::ClientConfigReply(config)).await?;
        }
        ControlMessage::ClientReady => {
            debug!("got ClientReady");
            let desired = {
                let registry = state.registry.lock().await;
                registry
                    .find(&device.id)
                    .map(|context| context.desired_streams())
                    .unwrap_or_default()
            };
            for (source_id, _) in desired {
                debug!(source_id = %source_id, "restoring stream");
                send_request_stream(writer, state, &device.id, source_id).await?;
            }
        }
        ControlMessage::StreamStatus(status) => {
            if status.success {
                debug!(source_id = %status.source_id, "source is streaming");
            } else {
                debug!(source_id = %status.source_id, "source is NOT streaming");
                let still_desired = {
                    let registry = state.registry.lock().await;
                    registry
                        .find(&device.id)
                        .and_then(|context| context.should_stream(&status.source_id))
                        .is_some()
                };
                if still_desired {
                    debug!(source_id = %status.source_id, "scheduling stream retry");
                    *retry = Some((
                        status.source_id,
                        Box::pin(tokio::time::sleep(state.tuning.stream_retry)),
                    ));
                }
            }
        }
        other => {
            warn!(message_type = other.message_type(), "unexpected message kind");
            return Err(SessionError::UnexpectedMessage(other.message_type()));
        }
    }
    Ok(())
}

fn build_client_config(device: &Device, state: &Arc<ServerState>) -> ClientConfig {
    let sources = state
        .config
        .device_sources(&device.id)
        .into_iter()
        .map(|source| VideoSource {
            id: source.id,
            uri: source.uri,
            user: String::new(),
            password: String::new(),
            cloud_max_storage: source.cloud_max_storage,
        })
        .collect();

    ClientConfig {
        sources,
        cloud: CloudCredentials {
            token: device.cloud_token.clone(),
        },
    }
}

/// Send a RequestStream if the source is still desired.  The destination is
/// looked up at send time so a StopStream that raced in wins.
async fn send_request_stream<W>(
    writer: &mut FrameWriter<W>,
    state: &Arc<ServerState>,
    device_id: &DeviceId,
    source_id: SourceId,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let destination = {
        let registry = state.registry.lock().await;
        registry
            .find(device_id)
            .and_then(|context| context.should_stream(&source_id))
    };
    let Some(destination) = destination else {
        return Ok(());
    };

    debug!(source_id = %source_id, destination = %destination, "requesting stream");
    write_message(
        writer,
        &ControlMessage::RequestStream(RequestStream {
            source_id,
            destination,
        }),
    )
    .await?;
    Ok(())
}
