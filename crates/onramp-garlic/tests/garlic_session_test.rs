//! Garlic session behavior against an in-process SAM bridge

mod common;

use common::{FakeSam, FakeSamOptions, PEER_GREETING};
use onramp_core::{Keystore, KeystoreKind, ListenKind, Listener, OnrampError, Phase, Stage};
use onramp_garlic::{GarlicSession, I2pKeys};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_identity_is_stable_across_sessions() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();

    let first = GarlicSession::new("stable", sam.config(), Keystore::in_dir(dir.path()));
    let keys = first.keys().await.unwrap();
    first.close().await.unwrap();

    let second = GarlicSession::new("stable", sam.config(), Keystore::in_dir(dir.path()));
    assert_eq!(second.keys().await.unwrap(), keys);
    assert_eq!(sam.stats.generated(), 1);

    let on_disk = Keystore::in_dir(dir.path())
        .read_identity(KeystoreKind::I2p, "stable")
        .unwrap()
        .unwrap();
    assert_eq!(I2pKeys::from_file_bytes(&on_disk).unwrap(), keys);
}

#[tokio::test]
async fn test_empty_key_file_is_regenerated() -> anyhow::Result<()> {
    let sam = FakeSam::start().await;
    let dir = TempDir::new()?;
    let keystore = Keystore::in_dir(dir.path());

    let path = keystore.identity_path(KeystoreKind::I2p, "empty")?;
    std::fs::write(&path, b"")?;

    let session = GarlicSession::new("empty", sam.config(), keystore);
    let keys = session.keys().await?;

    assert_eq!(sam.stats.generated(), 1);
    assert!(!std::fs::read(&path)?.is_empty());
    assert!(keys.base32()?.ends_with(".b32.i2p"));
    Ok(())
}

#[tokio::test]
async fn test_listen_is_idempotent() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("idem", sam.config(), Keystore::in_dir(dir.path()));

    let first = session.listen(None).await.unwrap();
    let hellos = sam.stats.hellos();
    let second = session.listen(Some(ListenKind::Stream)).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    // Control connection plus the stream session connection
    assert_eq!(hellos, 2);
    assert_eq!(sam.stats.hellos(), hellos);
    assert_eq!(sam.stats.sessions(), vec!["idem".to_string()]);
    assert_eq!(session.phase().await, Phase::SessionActive);
    assert_eq!(first.addr(), session.keys().await.unwrap().base32().unwrap());
}

#[tokio::test]
async fn test_concurrent_first_listens_establish_once() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = Arc::new(GarlicSession::new(
        "race",
        sam.config(),
        Keystore::in_dir(dir.path()),
    ));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.listen(None).await })
        })
        .collect();

    let mut listeners = Vec::new();
    for task in tasks {
        listeners.push(task.await.unwrap().unwrap());
    }

    assert!(listeners.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(sam.stats.generated(), 1);
    assert_eq!(sam.stats.sessions().len(), 1);
}

#[tokio::test]
async fn test_foreign_address_dials_null_conn() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("null", sam.config(), Keystore::in_dir(dir.path()));

    let mut conn = session.dial("tcp", "example.com:80").await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    assert_eq!(conn.read_to_end(&mut buf).await.unwrap(), 0);

    assert_eq!(sam.stats.hellos(), 0);
}

#[tokio::test]
async fn test_dial_resolves_and_connects() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("dialer", sam.config(), Keystore::in_dir(dir.path()));

    let mut conn = session.dial("tcp", "echo.i2p:80").await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert_eq!(sam.stats.lookups(), 1);
    assert_eq!(sam.stats.connects(), 1);
}

#[tokio::test]
async fn test_dial_unknown_name_is_dial_error() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("dialer", sam.config(), Keystore::in_dir(dir.path()));

    let result = session.dial("tcp", "missing.i2p").await;
    assert!(matches!(result, Err(OnrampError::Dial { .. })));
    assert_eq!(sam.stats.connects(), 0);
}

#[tokio::test]
async fn test_accept_delivers_peer_stream() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("server", sam.config(), Keystore::in_dir(dir.path()));

    let listener = session.listen(None).await.unwrap();
    let (mut conn, peer) = listener.accept().await.unwrap();

    assert!(peer.ends_with(".b32.i2p"));
    let mut buf = vec![0u8; PEER_GREETING.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, PEER_GREETING);
}

#[tokio::test]
async fn test_deleted_keys_yield_new_identity() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();

    let session = GarlicSession::new("rotate", sam.config(), Keystore::in_dir(dir.path()));
    let old = session.keys().await.unwrap();
    session.delete_keys().unwrap();

    // The live session keeps its identity
    assert_eq!(session.keys().await.unwrap(), old);

    let fresh = GarlicSession::new("rotate", sam.config(), Keystore::in_dir(dir.path()));
    assert_ne!(fresh.keys().await.unwrap(), old);
    assert_eq!(sam.stats.generated(), 2);
}

#[tokio::test]
async fn test_delete_missing_keys_fails() {
    let dir = TempDir::new().unwrap();
    let keystore = Keystore::in_dir(dir.path());
    let result = onramp_garlic::delete_garlic_keys(&keystore, "never-created");
    assert!(matches!(result, Err(OnrampError::Identity(_))));
}

#[tokio::test]
async fn test_cancelled_dial_context_fails_fast() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("cancel", sam.config(), Keystore::in_dir(dir.path()));

    let token = CancellationToken::new();
    token.cancel();

    let result = session.dial_context(&token, "tcp", "echo.i2p:80").await;
    assert!(matches!(result, Err(OnrampError::Cancelled)));
    assert_eq!(sam.stats.hellos(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("closer", sam.config(), Keystore::in_dir(dir.path()));

    let listener = session.listen(None).await.unwrap();
    session.close().await.unwrap();
    session.close().await.unwrap();

    assert!(matches!(listener.accept().await, Err(OnrampError::Closed)));
    assert!(matches!(session.listen(None).await, Err(OnrampError::Closed)));
    assert!(matches!(
        session.dial("tcp", "echo.i2p").await,
        Err(OnrampError::Closed)
    ));
}

#[tokio::test]
async fn test_rejected_session_keeps_completed_stages() {
    common::init_tracing();
    let sam = FakeSam::start_with(FakeSamOptions {
        reject_sessions: true,
    })
    .await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("rejected", sam.config(), Keystore::in_dir(dir.path()));

    let err = match session.listen(None).await {
        Err(e) => e,
        Ok(_) => panic!("session creation should be rejected"),
    };
    assert_eq!(err.stage(), Some(Stage::Session));
    assert_eq!(session.phase().await, Phase::IdentityReady);

    // Retrying does not regenerate the identity
    assert!(session.listen(None).await.is_err());
    assert_eq!(sam.stats.generated(), 1);
}

#[tokio::test]
async fn test_connect_establishes_eagerly() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();

    let session = GarlicSession::connect("eager", sam.config(), Keystore::in_dir(dir.path()))
        .await
        .unwrap();

    assert_eq!(session.phase().await, Phase::SessionActive);
    assert_eq!(sam.stats.sessions(), vec!["eager".to_string()]);
    assert!(session.to_string().ends_with(".b32.i2p"));
}

#[tokio::test]
async fn test_network_reflects_listener_kind() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let session = GarlicSession::new("kinds", sam.config(), Keystore::in_dir(dir.path()));

    session.listen(Some(ListenKind::Datagram)).await.unwrap();
    assert_eq!(session.network().await, "udp");
    assert!(sam.stats.sessions().contains(&"kinds-dg".to_string()));

    session.listen(Some(ListenKind::Stream)).await.unwrap();
    assert_eq!(session.network().await, "tcp");
}

#[tokio::test]
async fn test_listen_tls_bootstraps_certificate() {
    let sam = FakeSam::start().await;
    let dir = TempDir::new().unwrap();
    let keystore = Keystore::in_dir(dir.path());
    let session = GarlicSession::new("secure", sam.config(), keystore.clone());

    let listener = session.listen_tls(None).await.unwrap();
    let hostname = session.keys().await.unwrap().base32().unwrap();
    assert_eq!(listener.addr(), hostname);

    let tls_root = keystore.resolve(KeystoreKind::Tls).unwrap();
    assert!(tls_root.join(format!("{}.crt", hostname)).is_file());
    assert!(tls_root.join(format!("{}.pem", hostname)).is_file());
    assert!(tls_root.join(format!("{}.crl", hostname)).is_file());
}
