//! NATS directory store against a live JetStream server
//!
//! Run with a local server (`nats-server -js`) and
//! `cargo test --test nats_directory_test -- --ignored`. `NATS_URL`
//! overrides the default address.

use bytes::Bytes;

use botpool::config::NatsArgs;
use botpool::directory::{DirectoryStore, NatsDirectory, SetOp};
use botpool::PoolError;

async fn connect() -> NatsDirectory {
    let args = NatsArgs {
        nats_url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into()),
        nats_user: None,
        nats_password: None,
        kv_bucket: format!("botpool-test-{}", uuid::Uuid::new_v4().simple()),
    };
    NatsDirectory::connect(&args, "botpool-test").await.unwrap()
}

#[tokio::test]
#[ignore = "integration-real: needs a JetStream-enabled NATS server"]
async fn test_conditional_delete_keeps_newer_owner() {
    let store = connect().await;

    store.set("BOT-b1", Bytes::from_static(b"10.0.0.1")).await.unwrap();
    // A takeover lands before the old owner withdraws
    let replaced = store
        .swap("BOT-b1", Bytes::from_static(b"10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(replaced, Some(Bytes::from_static(b"10.0.0.1")));

    assert!(!store.delete_if_eq("BOT-b1", b"10.0.0.1").await.unwrap());
    assert_eq!(
        store.get("BOT-b1").await.unwrap(),
        Some(Bytes::from_static(b"10.0.0.2"))
    );

    assert!(store.delete_if_eq("BOT-b1", b"10.0.0.2").await.unwrap());
    assert_eq!(store.get("BOT-b1").await.unwrap(), None);
    // Swapping onto a delete marker reports no previous owner
    assert_eq!(
        store.swap("BOT-b1", Bytes::from_static(b"10.0.0.3")).await.unwrap(),
        None
    );
}

#[tokio::test]
#[ignore = "integration-real: needs a JetStream-enabled NATS server"]
async fn test_clear_repairs_malformed_set() {
    let store = connect().await;
    store
        .set("SERVER-10.0.0.1", Bytes::from_static(b"BOT-a BOT-b"))
        .await
        .unwrap();

    let err = store
        .update_set("SERVER-10.0.0.1", SetOp::Insert("b1".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::MalformedRecord(_)));

    store.update_set("SERVER-10.0.0.1", SetOp::Clear).await.unwrap();
    store
        .update_set("SERVER-10.0.0.1", SetOp::Insert("b1".into()))
        .await
        .unwrap();
    let members = store.members("SERVER-10.0.0.1").await.unwrap();
    assert_eq!(members.into_iter().collect::<Vec<_>>(), vec!["b1".to_string()]);
}
