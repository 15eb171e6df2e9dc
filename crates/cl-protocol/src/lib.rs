// cl-protocol: Control-channel message types and serialization.
//
// Every message on the wire is a length-prefixed frame carrying a typed,
// JSON-encoded body.  The frame layout lives in [`framing`]; this module
// defines the message set and the mapping between wire type codes and
// message bodies.

use serde::{Deserialize, Serialize};

pub mod framing;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_LEN};

// ---------------------------------------------------------------------------
// Shared identifier types
// ---------------------------------------------------------------------------

/// Unique identifier of a remote camera box; also the commonName of its TLS
/// client certificate.
pub type DeviceId = String;

/// Unique identifier of a video source attached to a device.
pub type SourceId = String;

/// Name of a playback user.  The empty string denotes the anonymous user.
pub type UserName = String;

/// URL a restream sink expects the device to push media to.
pub type StreamDst = String;

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// One video source as delivered to a device in its config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSource {
    pub id: SourceId,
    /// Capture URI (typically rtsp:// or http://).
    pub uri: String,
    /// Credentials for the capture URI; empty when the source is open.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Cloud mirror cap in megabytes.  0 disables cloud mirroring for the
    /// source; the device converts to bytes locally.
    #[serde(default)]
    pub cloud_max_storage: u64,
}

/// Cloud-storage credentials for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub token: String,
}

/// Full device configuration, pushed by the server on request and on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub sources: Vec<VideoSource>,
    pub cloud: CloudCredentials,
}

/// Server-to-device command: start publishing a source to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStream {
    pub source_id: SourceId,
    pub destination: StreamDst,
}

/// Device-to-server report of a stream outcome.
///
/// `success = true` is sent once the publisher is playing.  A later failure
/// or end-of-stream sends `success = false` for the same source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub source_id: SourceId,
    pub success: bool,
}

/// Server-to-device command: stop publishing a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopStream {
    pub source_id: SourceId,
}

// ---------------------------------------------------------------------------
// Top-level message enum
// ---------------------------------------------------------------------------

/// All control-channel messages.
///
/// Handshake order on every new connection:
/// ClientGreeting → ServerGreeting → ClientConfigRequest → ClientConfigReply
/// → ClientReady, then server-initiated RequestStream / StopStream interleave
/// with client-initiated StreamStatus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ClientGreeting,
    ServerGreeting,
    ClientConfigRequest,
    ClientConfigReply(ClientConfig),
    ClientConfigUpdated(ClientConfig),
    ClientReady,
    RequestStream(RequestStream),
    StreamStatus(StreamStatus),
    StopStream(StopStream),
}

/// Wire type codes.  Frozen; new messages append.
pub mod message_type {
    pub const CLIENT_GREETING: u16 = 1;
    pub const SERVER_GREETING: u16 = 2;
    pub const CLIENT_CONFIG_REQUEST: u16 = 3;
    pub const CLIENT_CONFIG_REPLY: u16 = 4;
    pub const CLIENT_CONFIG_UPDATED: u16 = 5;
    pub const CLIENT_READY: u16 = 6;
    pub const REQUEST_STREAM: u16 = 7;
    pub const STREAM_STATUS: u16 = 8;
    pub const STOP_STREAM: u16 = 9;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("body decode for type {message_type}: {source}")]
    Decode {
        message_type: u16,
        source: serde_json::Error,
    },
    #[error("body encode: {0}")]
    Encode(serde_json::Error),
}

impl ControlMessage {
    /// The wire type code for this message.
    pub fn message_type(&self) -> u16 {
        use message_type::*;
        match self {
            ControlMessage::ClientGreeting => CLIENT_GREETING,
            ControlMessage::ServerGreeting => SERVER_GREETING,
            ControlMessage::ClientConfigRequest => CLIENT_CONFIG_REQUEST,
            ControlMessage::ClientConfigReply(_) => CLIENT_CONFIG_REPLY,
            ControlMessage::ClientConfigUpdated(_) => CLIENT_CONFIG_UPDATED,
            ControlMessage::ClientReady => CLIENT_READY,
            ControlMessage::RequestStream(_) => REQUEST_STREAM,
            ControlMessage::StreamStatus(_) => STREAM_STATUS,
            ControlMessage::StopStream(_) => STOP_STREAM,
        }
    }

    /// Serialize the message body.  Bodyless messages encode as zero bytes.
    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let encoded = match self {
            ControlMessage::ClientGreeting
            | ControlMessage::ServerGreeting
            | ControlMessage::ClientConfigRequest
            | ControlMessage::ClientReady => Vec::new(),
            ControlMessage::ClientConfigReply(config)
            | ControlMessage::ClientConfigUpdated(config) => {
                serde_json::to_vec(config).map_err(ProtocolError::Encode)?
            }
            ControlMessage::RequestStream(request) => {
                serde_json::to_vec(request).map_err(ProtocolError::Encode)?
            }
            ControlMessage::StreamStatus(status) => {
                serde_json::to_vec(status).map_err(ProtocolError::Encode)?
            }
            ControlMessage::StopStream(request) => {
                serde_json::to_vec(request).map_err(ProtocolError::Encode)?
            }
        };
        Ok(encoded)
    }

    /// Parse a message body as the schema indicated by `message_type`.
    pub fn decode(message_type: u16, body: &[u8]) -> Result<ControlMessage, ProtocolError> {
        use message_type::*;

        fn parse<'a, T: Deserialize<'a>>(
            message_type: u16,
            body: &'a [u8],
        ) -> Result<T, ProtocolError> {
            serde_json::from_slice(body).map_err(|source| ProtocolError::Decode {
                message_type,
                source,
            })
        }

        match message_type {
            CLIENT_GREETING => Ok(ControlMessage::ClientGreeting),
            SERVER_GREETING => Ok(ControlMessage::ServerGreeting),
            CLIENT_CONFIG_REQUEST => Ok(ControlMessage::ClientConfigRequest),
            CLIENT_CONFIG_REPLY => Ok(ControlMessage::ClientConfigReply(parse(
                message_type,
                body,
            )?)),
            CLIENT_CONFIG_UPDATED => Ok(ControlMessage::ClientConfigUpdated(parse(
                message_type,
                body,
            )?)),
            CLIENT_READY => Ok(ControlMessage::ClientReady),
            REQUEST_STREAM => Ok(ControlMessage::RequestStream(parse(message_type, body)?)),
            STREAM_STATUS => Ok(ControlMessage::StreamStatus(parse(message_type, body)?)),
            STOP_STREAM => Ok(ControlMessage::StopStream(parse(message_type, body)?)),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Read one frame and decode it as a [`ControlMessage`].
pub async fn read_message<R>(reader: &mut FrameReader<R>) -> Result<ControlMessage, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let (message_type, body) = reader.read_frame().await?;
    ControlMessage::decode(message_type, &body)
}

/// Encode a [`ControlMessage`] and write it as one frame.
pub async fn write_message<W>(
    writer: &mut FrameWriter<W>,
    message: &ControlMessage,
) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let body = message.encode_body()?;
    writer.write_frame(message.message_type(), &body).await?;
    Ok(())
}
