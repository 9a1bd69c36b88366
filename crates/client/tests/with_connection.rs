//! Scoped borrowing through the client facade and the lazy factory.

use std::time::Duration;

use pretty_assertions::assert_eq;
use sftp_pool::testing::MockConnector;
use sftp_pool::{ConnectionConfig, DestroyReason, KeyedPool, PoolConfig, PoolEvent};
use sftp_pool_client::{Client, ClientFactory, Settings};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Pool(#[from] sftp_pool::Error),
    #[error("remote: {0}")]
    Remote(String),
}

fn client(connector: MockConnector) -> Client<MockConnector> {
    let config = PoolConfig::default().with_min_idle_per_key(0);
    let pool = KeyedPool::new(connector, config).unwrap();
    pool.register(ConnectionConfig::new("h", 22, "u", "pw").with_key("k"));
    Client::new(pool)
}

async fn settle(pool: &KeyedPool<MockConnector>) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while pool.active_count(None) > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("connection was never returned");
}

#[tokio::test]
async fn failed_work_still_returns_the_connection() {
    let client = client(MockConnector::new());

    let err = client
        .with_connection("k", async |conn| {
            conn.set_cwd("/tmp/half-written");
            Err::<(), _>(AppError::Remote("permission denied".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Remote(_)));

    // The failure did not invalidate the session; it was reset and parked.
    assert_eq!(client.pool().idle_count(Some("k")), 1);
    let cwd = client
        .with_connection("k", async |conn| Ok::<_, AppError>(conn.cwd().to_owned()))
        .await
        .unwrap();
    assert_eq!(cwd, "/home/mock");
}

#[tokio::test]
async fn borrow_errors_convert_into_the_caller_error() {
    let client = client(MockConnector::new());
    let err = client
        .with_connection("nope", async |_| Ok::<_, AppError>(()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Pool(sftp_pool::Error::ConfigNotFound { .. })
    ));
}

#[tokio::test]
async fn connection_broken_during_work_is_not_recycled() {
    let connector = MockConnector::new();
    let client = client(connector.clone());
    let mut events = client.pool().events();

    client
        .with_connection("k", async |conn| {
            conn.kill();
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();

    assert_eq!(client.pool().idle_count(None), 0);
    assert_eq!(connector.stats().live, 0);
    let reason = loop {
        if let PoolEvent::Destroyed { reason, .. } = events.recv().await.unwrap() {
            break reason;
        }
    };
    assert_eq!(reason, DestroyReason::PassivationFailed);
}

#[tokio::test(start_paused = true)]
async fn cancelled_work_returns_the_connection() {
    let client = client(MockConnector::new());

    let work = client.with_connection("k", async |_| {
        std::future::pending::<()>().await;
        Ok::<_, AppError>(())
    });
    assert!(tokio::time::timeout(Duration::from_secs(5), work).await.is_err());

    settle(client.pool()).await;
    assert_eq!(client.pool().idle_count(Some("k")), 1);
}

#[tokio::test]
async fn keyed_client_runs_against_its_key() {
    let client = client(MockConnector::new());
    client.register(ConnectionConfig::new("other", 22, "u", "pw").with_key("other"));

    let keyed = client.bind("other");
    let key = keyed
        .run(async |conn| Ok::<_, AppError>(conn.key().to_owned()))
        .await
        .unwrap();
    assert_eq!(key, "other");
    assert_eq!(client.pool().idle_count(Some("k")), 0);
}

#[tokio::test]
async fn factory_builds_the_pool_once() {
    let connector = MockConnector::new().with_connect_delay(Duration::from_millis(20));
    let factory = ClientFactory::new(connector.clone(), PoolConfig::default())
        .unwrap()
        .with_connection(ConnectionConfig::new("h", 22, "u", "pw").with_key("k"));

    let (a, b, c) = tokio::join!(factory.pool(), factory.pool(), factory.pool());
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(std::ptr::eq(a, b) && std::ptr::eq(b, c));
    // One pre-filled idle connection, not one per caller.
    assert_eq!(connector.stats().connects, 1);

    factory
        .client()
        .await
        .unwrap()
        .with_connection("k", async |conn| Ok::<_, AppError>(conn.id()))
        .await
        .unwrap();
    assert_eq!(connector.stats().connects, 1);
    assert_eq!(a.stats().borrowed, 1);

    factory.close().await;
    assert!(a.is_closed());
    assert_eq!(connector.stats().live, 0);
}

#[tokio::test]
async fn factory_from_settings_registers_every_connection() {
    let settings: Settings = serde_json::from_str(
        r#"{
            "pool": { "min_idle_per_key": 0 },
            "connections": {
                "inbox":  { "host": "files.example.com", "user": "in", "password": "a", "base_path": "/in" },
                "outbox": { "host": "files.example.com", "user": "out", "password": "b", "auto_disconnect": true }
            }
        }"#,
    )
    .unwrap();
    let connector = MockConnector::new();
    let factory = ClientFactory::from_settings(connector.clone(), settings).unwrap();

    let pool = factory.pool().await.unwrap();
    let mut keys = pool.registry().keys();
    keys.sort();
    assert_eq!(keys, ["inbox", "outbox"]);

    let inbox = factory
        .client_for(ConnectionConfig::new("files.example.com", 22, "in", "a").with_key("inbox"))
        .await
        .unwrap();
    inbox
        .run(async |conn| {
            conn.set_cwd("/in/today");
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();
    // Returned sessions go back to the configured base path.
    let cwd = inbox
        .run(async |conn| Ok::<_, AppError>(conn.cwd().to_owned()))
        .await
        .unwrap();
    assert_eq!(cwd, "/in");
    assert_eq!(pool.idle_count(Some("inbox")), 1);

    let outbox = factory.client().await.unwrap().bind("outbox");
    outbox.run(async |_| Ok::<_, AppError>(())).await.unwrap();
    // auto_disconnect destroys on return.
    assert_eq!(pool.idle_count(Some("outbox")), 0);
    assert_eq!(connector.stats().live, 1);
}
