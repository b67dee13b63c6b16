#![cfg(feature = "transport-memory")]
use bytes::Bytes;
use mq_load::transport::{ConnectOptions, Engine, TopicFilter, TransportBuilder};
use std::time::Duration;

#[tokio::test]
async fn append_pull_memory_smoke() {
    let t = TransportBuilder::connect(Engine::Memory, ConnectOptions::default())
        .await
        .expect("connect");
    t.create_topic(b"smoke-append").await.expect("create");
    t.append(b"smoke-append", Bytes::from_static(b"hello\n"))
        .await
        .expect("append");
    let mut buf = Vec::new();
    let n = t.pull(b"smoke-append", 0, 10, &mut buf).await.expect("pull");
    assert_eq!(n, 1);
    assert_eq!(&buf[0][..], b"hello\n");
}

#[tokio::test]
async fn connections_share_the_default_broker() {
    let a = TransportBuilder::connect(Engine::Memory, ConnectOptions::default())
        .await
        .expect("connect a");
    let b = TransportBuilder::connect(Engine::Memory, ConnectOptions::default())
        .await
        .expect("connect b");
    a.create_topic(b"smoke-shared").await.expect("create");
    let mut sub = b.subscribe(b"smoke-shared").await.expect("subscribe");
    a.append(b"smoke-shared", Bytes::from_static(b"x"))
        .await
        .expect("append");
    tokio::time::timeout(Duration::from_secs(1), sub.changed())
        .await
        .expect("notified")
        .expect("changed");
    sub.shutdown().await.expect("release");

    let filter = TopicFilter::new("smoke-", "", "").unwrap();
    let topics = b.list_topics(&filter).await.expect("list");
    assert!(topics.contains(&Bytes::from_static(b"smoke-shared")));
}

#[tokio::test]
async fn nats_without_feature_or_server_fails_to_connect() {
    let mut opts = ConnectOptions::default();
    opts.params.insert("url".into(), "nats://127.0.0.1:1".into());
    assert!(TransportBuilder::connect(Engine::Nats, opts).await.is_err());
}
