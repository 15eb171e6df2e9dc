/// Cloud folder tests against the mock provider: mirroring, incremental
/// updates, paging, eviction, and the post-acknowledgement accounting.
use devicebox::cloud::{CloudClient, CloudEndpoints, CloudFolder};
use cl_test_utils::MockCloudApi;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(50);

fn endpoints(mock: &MockCloudApi) -> CloudEndpoints {
    CloudEndpoints {
        api_base: mock.base_url(),
        content_base: mock.base_url(),
    }
}

async fn wait_for_total(folder: &CloudFolder, expected: u64) {
    for _ in 0..100 {
        if folder.total_bytes().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "folder never reached {expected} bytes (at {})",
        folder.total_bytes().await
    );
}

/// Test: the initial listing mirrors existing files and the poll picks up
/// later additions and deletions.
#[tokio::test]
async fn sync_mirrors_listing_and_updates() {
    let mock = MockCloudApi::start().await;
    mock.add_file("/s1/a.mp4", "2026-05-01T10:00:00Z", 100).await;
    mock.add_file("/s1/b.mp4", "2026-05-01T10:00:05Z", 50).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let mut folder = CloudFolder::new(client.handle(), POLL);
    folder.start_sync("/s1/".to_owned());

    wait_for_total(&folder, 150).await;

    mock.add_file("/s1/c.mp4", "2026-05-01T10:00:10Z", 25).await;
    wait_for_total(&folder, 175).await;

    mock.mark_deleted("/s1/a.mp4").await;
    wait_for_total(&folder, 75).await;

    folder.shutdown().await;
    client.shutdown().await;
}

/// Test: a paged listing (has_more) is drained before idling.
#[tokio::test]
async fn paged_listing_is_drained() {
    let mock = MockCloudApi::start().await;
    mock.set_page_size(1).await;
    mock.add_file("/s1/a.mp4", "2026-05-01T10:00:00Z", 10).await;
    mock.add_file("/s1/b.mp4", "2026-05-01T10:00:01Z", 20).await;
    mock.add_file("/s1/c.mp4", "2026-05-01T10:00:02Z", 30).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let mut folder = CloudFolder::new(client.handle(), POLL);
    folder.start_sync("/s1/".to_owned());

    wait_for_total(&folder, 60).await;

    folder.shutdown().await;
    client.shutdown().await;
}

/// Test: the worked eviction scenario.  Three 40-byte segments against a
/// 50-byte cap evict exactly the two oldest; once the provider's `deleted`
/// entries come back, the local total drops to 40.
#[tokio::test]
async fn shrink_evicts_oldest_until_under_cap() {
    let mock = MockCloudApi::start().await;
    mock.add_file("/s1/p1", "2026-05-01T10:00:01Z", 40).await;
    mock.add_file("/s1/p2", "2026-05-01T10:00:02Z", 40).await;
    mock.add_file("/s1/p3", "2026-05-01T10:00:03Z", 40).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let mut folder = CloudFolder::new(client.handle(), POLL);
    folder.start_sync("/s1/".to_owned());
    wait_for_total(&folder, 120).await;

    folder.shrink_to(50).await;

    // Exactly one batch with exactly the two oldest paths.
    for _ in 0..100 {
        if !mock.delete_batches().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        mock.delete_batches().await,
        vec![vec!["/s1/p1".to_owned(), "/s1/p2".to_owned()]]
    );

    // Local accounting follows the acknowledgement, not the request.
    wait_for_total(&folder, 40).await;

    folder.shutdown().await;
    client.shutdown().await;
}

/// Test: when evicting the oldest entry alone lands the folder exactly on
/// the cap, only that entry is deleted; the total settles on the cap once
/// the provider acknowledges.
#[tokio::test]
async fn shrink_stops_at_exact_boundary() {
    let mock = MockCloudApi::start().await;
    mock.add_file("/s1/p1", "2026-05-01T10:00:01Z", 50).await;
    mock.add_file("/s1/p2", "2026-05-01T10:00:02Z", 50).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let mut folder = CloudFolder::new(client.handle(), POLL);
    folder.start_sync("/s1/".to_owned());
    wait_for_total(&folder, 100).await;

    folder.shrink_to(50).await;

    for _ in 0..100 {
        if !mock.delete_batches().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        mock.delete_batches().await,
        vec![vec!["/s1/p1".to_owned()]]
    );

    wait_for_total(&folder, 50).await;

    folder.shutdown().await;
    client.shutdown().await;
}

/// Test: at or under the cap no delete batch is issued.
#[tokio::test]
async fn shrink_is_noop_at_or_under_cap() {
    let mock = MockCloudApi::start().await;
    mock.add_file("/s1/p1", "2026-05-01T10:00:01Z", 40).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let mut folder = CloudFolder::new(client.handle(), POLL);
    folder.start_sync("/s1/".to_owned());
    wait_for_total(&folder, 40).await;

    folder.shrink_to(40).await;
    folder.shrink_to(100).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(mock.delete_batches().await.is_empty());

    folder.shutdown().await;
    client.shutdown().await;
}

/// Test: shutdown stops the poll task; later provider changes are not
/// observed.
#[tokio::test]
async fn shutdown_stops_polling() {
    let mock = MockCloudApi::start().await;
    mock.add_file("/s1/a.mp4", "2026-05-01T10:00:00Z", 10).await;

    let mut client = CloudClient::new(endpoints(&mock));
    client.set_token("tok".to_owned());
    let mut folder = CloudFolder::new(client.handle(), POLL);
    folder.start_sync("/s1/".to_owned());
    wait_for_total(&folder, 10).await;
    assert!(folder.active());

    folder.shutdown().await;
    assert!(!folder.active());

    mock.add_file("/s1/late.mp4", "2026-05-01T10:00:09Z", 99).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(folder.total_bytes().await, 10);

    client.shutdown().await;
}
