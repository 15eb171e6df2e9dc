/// Cloud client tests: the upload concurrency cap and executor reset
/// semantics.
use devicebox::cloud::{CloudClient, CloudEndpoints, CloudError, MAX_UPLOADS};
use cl_test_utils::MockCloudApi;
use std::path::PathBuf;
use std::time::Duration;

fn endpoints(mock: &MockCloudApi) -> CloudEndpoints {
    CloudEndpoints {
        api_base: mock.base_url(),
        content_base: mock.base_url(),
    }
}

fn scratch_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "cl-cloud-client-{}-{name}",
        std::process::id()
    ));
    std::fs::write(&path, b"segment-bytes").expect("scratch file");
    path
}

/// Test: with MAX_UPLOADS uploads in flight, the next one completes
/// immediately with the distinguished (0, "") skip and no network request.
#[tokio::test]
async fn excess_upload_is_skipped() {
    let mock = MockCloudApi::start().await;
    mock.set_upload_delay(Duration::from_millis(500)).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let handle = client.handle();

    let slow_a = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.upload(scratch_file("cap-a"), "/s1/a".to_owned()).await })
    };
    let slow_b = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.upload(scratch_file("cap-b"), "/s1/b".to_owned()).await })
    };

    // Let the first two reach the provider before the third is submitted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let skipped = handle
        .upload(scratch_file("cap-c"), "/s1/c".to_owned())
        .await
        .expect("skip result");
    assert_eq!(skipped, (0, String::new()));

    let (status_a, _) = slow_a.await.expect("join").expect("upload a");
    let (status_b, _) = slow_b.await.expect("join").expect("upload b");
    assert_eq!(status_a, 200);
    assert_eq!(status_b, 200);

    let uploads = mock.uploads().await;
    assert_eq!(uploads.len(), MAX_UPLOADS, "skipped upload must not hit the network");
    assert!(uploads.contains(&"/s1/a".to_owned()));
    assert!(uploads.contains(&"/s1/b".to_owned()));

    client.shutdown().await;
}

/// Test: once the in-flight uploads complete, the cap frees up.
#[tokio::test]
async fn cap_releases_after_completion() {
    let mock = MockCloudApi::start().await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let handle = client.handle();

    for name in ["seq-a", "seq-b", "seq-c", "seq-d"] {
        let (status, _) = handle
            .upload(scratch_file(name), format!("/s1/{name}"))
            .await
            .expect("upload");
        assert_eq!(status, 200);
    }
    assert_eq!(mock.uploads().await.len(), 4);

    client.shutdown().await;
}

/// Test: reset discards in-flight requests (their futures resolve with
/// Dropped) and a fresh executor serves new requests.
#[tokio::test]
async fn reset_discards_in_flight_requests() {
    let mock = MockCloudApi::start().await;
    mock.set_upload_delay(Duration::from_millis(2_000)).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let handle = client.handle();

    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.upload(scratch_file("slow"), "/s1/slow".to_owned()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.reset().await;

    match pending.await.expect("join") {
        Err(CloudError::Dropped) => {}
        other => panic!("expected Dropped, got {other:?}"),
    }

    // Stale handles stay dropped; the fresh executor works with a new token.
    match handle.list_folder("/s1/".to_owned(), true).await {
        Err(CloudError::Dropped) => {}
        other => panic!("expected Dropped from stale handle, got {other:?}"),
    }

    mock.set_upload_delay(Duration::ZERO).await;
    client.set_token("tok".to_owned());
    let (status, _) = client
        .handle()
        .upload(scratch_file("fresh"), "/s1/fresh".to_owned())
        .await
        .expect("fresh upload");
    assert_eq!(status, 200);

    client.shutdown().await;
}

/// Test: after shutdown every request resolves with Dropped.
#[tokio::test]
async fn shutdown_drops_everything() {
    let mock = MockCloudApi::start().await;
    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let handle = client.handle();

    client.shutdown().await;
    match handle.latest_cursor("/s1/".to_owned(), true).await {
        Err(CloudError::Dropped) => {}
        other => panic!("expected Dropped, got {other:?}"),
    }
}
