/// Restream bridge tests: authentication, authorisation, and the
/// first/last-reader edges driving desired streams.
use cl_config::hash::{make_hash, HashType};
use cl_config::{
    CertificateSource, Device, MemoryConfig, PlaySource, ServerSettings, Source, User,
};
use cl_test_utils::certs;
use server::restream::Action;
use server::{ControlHandle, ControlServer, RestreamBridge, RestreamEvent, ServerTuning};
use std::sync::Arc;
use tokio::sync::watch;

fn bridge_config() -> MemoryConfig {
    let mut config = MemoryConfig::new(ServerSettings {
        host: "cams.example.net".to_owned(),
        control_port: 0,
        restream_port: 9554,
        ..ServerSettings::default()
    });
    config.set_certificate(CertificateSource::Inline(
        certs::server_cert().identity_pem(),
    ));

    let device_id = "d1".to_owned();
    config.add_device(Device {
        id: device_id.clone(),
        certificate_pem: certs::device_cert("d1").cert_pem,
        cloud_token: String::new(),
    });
    config.add_device_source(
        &device_id,
        Source {
            id: "s1".to_owned(),
            uri: "rtsp://10.0.0.2/main".to_owned(),
            cloud_max_storage: 0,
        },
    );
    config.add_device_source(
        &device_id,
        Source {
            id: "s2".to_owned(),
            uri: "rtsp://10.0.0.3/main".to_owned(),
            cloud_max_storage: 0,
        },
    );

    config.add_user(User {
        name: "alice".to_owned(),
        hash_type: HashType::Sha256,
        password_salt: "salt".to_owned(),
        password_hash: make_hash(HashType::Sha256, "letmein", "salt"),
    });
    config.add_user_source(
        &"alice".to_owned(),
        PlaySource {
            device_id: device_id.clone(),
            source_id: "s1".to_owned(),
        },
    );

    // Anonymous viewers may watch s2.
    config.add_user(User {
        name: String::new(),
        hash_type: HashType::Sha1,
        password_salt: String::new(),
        password_hash: String::new(),
    });
    config.add_user_source(
        &String::new(),
        PlaySource {
            device_id,
            source_id: "s2".to_owned(),
        },
    );

    config
}

async fn start_bridge() -> (RestreamBridge, ControlHandle, watch::Sender<bool>) {
    let config = Arc::new(bridge_config());
    let control = ControlServer::bind(
        Arc::clone(&config) as Arc<dyn cl_config::ConfigQuery>,
        ServerTuning::default(),
    )
    .await
    .expect("bind control server");
    let handle = control.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(control.run(shutdown_rx));

    let bridge = RestreamBridge::new(handle.clone(), config);
    (bridge, handle, shutdown_tx)
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

#[test]
fn source_id_is_the_first_path_segment() {
    assert_eq!(RestreamBridge::extract_source_id("/s1"), "s1");
    assert_eq!(RestreamBridge::extract_source_id("/s1/track0"), "s1");
    assert_eq!(RestreamBridge::extract_source_id("s1"), "s1");
    assert_eq!(RestreamBridge::extract_source_id("/"), "");
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn password_authentication() {
    let (bridge, _handle, _shutdown) = start_bridge().await;

    assert!(bridge.authenticate(&"alice".to_owned(), "letmein"));
    assert!(!bridge.authenticate(&"alice".to_owned(), "wrong"));
    assert!(!bridge.authenticate(&"mallory".to_owned(), "letmein"));
    // The anonymous user authenticates with anything.
    assert!(bridge.authenticate(&String::new(), ""));
}

#[tokio::test]
async fn anonymous_play_skips_authentication() {
    let (bridge, _handle, _shutdown) = start_bridge().await;

    assert!(!bridge.authentication_required("/s2", false));
    assert!(bridge.authentication_required("/s2", true));
    assert!(bridge.authentication_required("/s1", false));
    assert!(bridge.authentication_required("/", false));
}

// ---------------------------------------------------------------------------
// Authorisation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn play_and_record_authorisation() {
    let (bridge, _handle, _shutdown) = start_bridge().await;
    let alice = "alice".to_owned();
    let device = "d1".to_owned();

    // Alice may play s1 but not record it.
    assert!(bridge.authorize(&alice, Action::Access, "/s1", false));
    assert!(!bridge.authorize(&alice, Action::Construct, "/s1", true));

    // The device records its own sources but does not play them.
    assert!(bridge.authorize(&device, Action::Construct, "/s1", true));
    assert!(!bridge.authorize(&device, Action::Access, "/s1", false));

    // Unknown principals and unknown sources fail.
    assert!(!bridge.authorize(&"mallory".to_owned(), Action::Access, "/s1", false));
    assert!(!bridge.authorize(&alice, Action::Access, "/ghost", false));
    assert!(!bridge.authorize(&alice, Action::Access, "/", false));
}

// ---------------------------------------------------------------------------
// Reader edges
// ---------------------------------------------------------------------------

/// Test: the first reader records the desire with the restream URL built
/// from the server settings; the last reader withdraws it.
#[tokio::test]
async fn reader_edges_drive_desired_streams() {
    let (mut bridge, handle, _shutdown) = start_bridge().await;
    let device_id = "d1".to_owned();

    bridge
        .handle_event(RestreamEvent::FirstReader {
            user: "alice".to_owned(),
            path: "/s1".to_owned(),
        })
        .await;

    assert_eq!(
        handle.desired_streams(&device_id).await,
        vec![(
            "s1".to_owned(),
            "rtsps://cams.example.net:9554/s1".to_owned()
        )]
    );

    bridge
        .handle_event(RestreamEvent::LastReader {
            path: "/s1".to_owned(),
        })
        .await;
    assert!(handle.desired_streams(&device_id).await.is_empty());
}

/// Test: a reader on a path no user may play records nothing.
#[tokio::test]
async fn unauthorised_reader_records_nothing() {
    let (mut bridge, handle, _shutdown) = start_bridge().await;

    bridge
        .handle_event(RestreamEvent::FirstReader {
            user: "alice".to_owned(),
            path: "/s2".to_owned(),
        })
        .await;
    bridge
        .handle_event(RestreamEvent::FirstReader {
            user: "mallory".to_owned(),
            path: "/s1".to_owned(),
        })
        .await;

    assert!(handle.desired_streams(&"d1".to_owned()).await.is_empty());
}

/// Test: recorder edges only touch path bookkeeping, never desires.
#[tokio::test]
async fn recorder_edges_do_not_touch_desires() {
    let (mut bridge, handle, _shutdown) = start_bridge().await;

    bridge
        .handle_event(RestreamEvent::RecorderConnected {
            path: "/s1".to_owned(),
        })
        .await;
    bridge
        .handle_event(RestreamEvent::RecorderDisconnected {
            path: "/s1".to_owned(),
        })
        .await;

    assert!(handle.desired_streams(&"d1".to_owned()).await.is_empty());
}
