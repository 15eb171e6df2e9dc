/// Tests for the length-prefixed framing layer: round trips, partial
/// delivery, and limit enforcement.
use cl_protocol::framing::{FrameError, FrameReader, FrameWriter, HEADER_LEN, MAX_FRAME_LEN};
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

/// Test: encode then decode yields the original (type, body).
#[tokio::test]
async fn frame_round_trip() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, _server_write) = tokio::io::split(server);
    let (_client_read, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::new(client_write);
    let mut reader = FrameReader::new(server_read);

    writer.write_frame(7, b"hello frame").await.expect("write");
    let (message_type, body) = reader.read_frame().await.expect("read");

    assert_eq!(message_type, 7);
    assert_eq!(body, b"hello frame");
}

/// Test: an empty body is a valid frame.
#[tokio::test]
async fn empty_body_round_trip() {
    let (client, server) = tokio::io::duplex(1024);
    let (server_read, _sw) = tokio::io::split(server);
    let (_cr, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::new(client_write);
    let mut reader = FrameReader::new(server_read);

    writer.write_frame(1, b"").await.expect("write");
    let (message_type, body) = reader.read_frame().await.expect("read");

    assert_eq!(message_type, 1);
    assert!(body.is_empty());
}

/// Test: several frames written back to back are read in order.
#[tokio::test]
async fn frames_preserve_submission_order() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, _sw) = tokio::io::split(server);
    let (_cr, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::new(client_write);
    let mut reader = FrameReader::new(server_read);

    for i in 0u16..5 {
        writer
            .write_frame(i, format!("body-{i}").as_bytes())
            .await
            .expect("write");
    }
    for i in 0u16..5 {
        let (message_type, body) = reader.read_frame().await.expect("read");
        assert_eq!(message_type, i);
        assert_eq!(body, format!("body-{i}").as_bytes());
    }
}

// ---------------------------------------------------------------------------
// Partial delivery
// ---------------------------------------------------------------------------

/// Test: a frame delivered one byte at a time completes only when the full
/// body has arrived.
#[tokio::test]
async fn partial_reads_are_buffered() {
    let (mut client, server) = tokio::io::duplex(1024);
    let (server_read, _sw) = tokio::io::split(server);
    let mut reader = FrameReader::new(server_read);

    let body = b"split across many writes";
    let mut wire = Vec::new();
    wire.extend_from_slice(&3u16.to_be_bytes());
    wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
    wire.extend_from_slice(body);

    let feeder = tokio::spawn(async move {
        for byte in wire {
            client.write_all(&[byte]).await.expect("feed");
            tokio::task::yield_now().await;
        }
        client
    });

    let (message_type, read_body) = reader.read_frame().await.expect("read");
    assert_eq!(message_type, 3);
    assert_eq!(read_body, body);
    drop(feeder.await.expect("feeder"));
}

/// Test: a stream that ends mid-frame reports Closed, not a bogus frame.
#[tokio::test]
async fn truncated_frame_reports_closed() {
    let (mut client, server) = tokio::io::duplex(1024);
    let (server_read, _sw) = tokio::io::split(server);
    let mut reader = FrameReader::new(server_read);

    // Header promising 10 bytes, then only 3 before close.
    let mut wire = Vec::new();
    wire.extend_from_slice(&9u16.to_be_bytes());
    wire.extend_from_slice(&10u32.to_be_bytes());
    wire.extend_from_slice(b"abc");
    client.write_all(&wire).await.expect("feed");
    drop(client);

    match reader.read_frame().await {
        Err(FrameError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Test: a header advertising more than the configured maximum is refused
/// before any body bytes are read.
#[tokio::test]
async fn oversized_frame_is_refused_on_decode() {
    let (mut client, server) = tokio::io::duplex(1024);
    let (server_read, _sw) = tokio::io::split(server);
    let mut reader = FrameReader::new(server_read);

    let mut wire = Vec::new();
    wire.extend_from_slice(&1u16.to_be_bytes());
    wire.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
    client.write_all(&wire).await.expect("feed");

    match reader.read_frame().await {
        Err(FrameError::Oversized { len, max }) => {
            assert_eq!(len, MAX_FRAME_LEN + 1);
            assert_eq!(max, MAX_FRAME_LEN);
        }
        other => panic!("expected Oversized, got {other:?}"),
    }
}

/// Test: the writer refuses oversized bodies instead of emitting a frame the
/// peer would reject.
#[tokio::test]
async fn writer_refuses_oversized_body() {
    let (client, _server) = tokio::io::duplex(HEADER_LEN);
    let (_cr, client_write) = tokio::io::split(client);
    let mut writer = FrameWriter::new(client_write);

    let body = vec![0u8; MAX_FRAME_LEN + 1];
    match writer.write_frame(1, &body).await {
        Err(FrameError::Oversized { .. }) => {}
        other => panic!("expected Oversized, got {other:?}"),
    }
}
