//! Mock control-plane server for device-client tests.
//!
//! Speaks the real framed protocol over TLS (no client-certificate
//! demand), answers the handshake from a canned config, records every
//! message it receives, and lets tests inject server-initiated messages or
//! drop the connection to exercise reconnect behaviour.

use crate::certs;
use cl_protocol::{read_message, write_message, ControlMessage, FrameReader, FrameWriter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;

/// Test-injected behaviour for the live connection.
#[derive(Debug)]
enum MockDirective {
    Send(ControlMessage),
    Drop,
}

pub struct MockControlServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    directives: Arc<Mutex<Option<mpsc::UnboundedSender<MockDirective>>>>,
    connections: Arc<AtomicUsize>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockControlServer {
    /// Start on a random port, serving `config` to every connection.
    pub async fn start(config: cl_protocol::ClientConfig) -> Self {
        let identity = certs::server_cert();
        let acceptor = build_acceptor(&identity);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock control server");
        let addr = listener.local_addr().expect("local addr");

        let received: Arc<Mutex<Vec<ControlMessage>>> = Arc::default();
        let directives: Arc<Mutex<Option<mpsc::UnboundedSender<MockDirective>>>> = Arc::default();
        let connections: Arc<AtomicUsize> = Arc::default();

        let task = {
            let received = Arc::clone(&received);
            let directives = Arc::clone(&directives);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, _peer)) = listener.accept().await else {
                        break;
                    };
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    let (directive_tx, directive_rx) = mpsc::unbounded_channel();
                    *directives.lock().await = Some(directive_tx);

                    // Serve connections one at a time; reconnect tests rely
                    // on the previous connection ending first.
                    handle_connection(tls, config.clone(), Arc::clone(&received), directive_rx)
                        .await;
                }
            })
        };

        Self {
            addr,
            received,
            directives,
            connections,
            _task: task,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Everything received so far, in arrival order.
    pub async fn received(&self) -> Vec<ControlMessage> {
        self.received.lock().await.clone()
    }

    /// Inject a server-initiated message into the live connection.
    pub async fn send(&self, message: ControlMessage) {
        if let Some(directives) = self.directives.lock().await.as_ref() {
            let _ = directives.send(MockDirective::Send(message));
        }
    }

    /// Drop the live connection.
    pub async fn drop_connection(&self) {
        if let Some(directives) = self.directives.lock().await.as_ref() {
            let _ = directives.send(MockDirective::Drop);
        }
    }

    /// Poll until `predicate` holds over the received messages.
    pub async fn wait_until(
        &self,
        predicate: impl Fn(&[ControlMessage]) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.received.lock().await) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until at least `count` connections have been accepted.
    pub async fn wait_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connection_count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn build_acceptor(identity: &certs::TestCert) -> TlsAcceptor {
    let mut pem = identity.cert_pem.as_bytes();
    let chain = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .expect("server cert");
    let mut pem = identity.key_pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut pem)
        .expect("server key")
        .expect("server key present");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .expect("server tls config");
    TlsAcceptor::from(Arc::new(config))
}

async fn handle_connection(
    tls: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
    config: cl_protocol::ClientConfig,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    mut directive_rx: mpsc::UnboundedReceiver<MockDirective>,
) {
    let (read_half, write_half) = tokio::io::split(tls);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    loop {
        tokio::select! {
            message = read_message(&mut reader) => {
                let Ok(message) = message else { break };
                received.lock().await.push(message.clone());

                let reply = match message {
                    ControlMessage::ClientGreeting => Some(ControlMessage::ServerGreeting),
                    ControlMessage::ClientConfigRequest => {
                        Some(ControlMessage::ClientConfigReply(config.clone()))
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    if write_message(&mut writer, &reply).await.is_err() {
                        break;
                    }
                }
            }
            directive = directive_rx.recv() => {
                match directive {
                    Some(MockDirective::Send(message)) => {
                        if write_message(&mut writer, &message).await.is_err() {
                            break;
                        }
                    }
                    Some(MockDirective::Drop) | None => break,
                }
            }
        }
    }
}
