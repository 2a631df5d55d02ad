//! Pool bounds observed through the client and directly.

use std::sync::Arc;
use std::time::Duration;

use integrations_mailer::errors::codes;
use integrations_mailer::mocks::{test_messages, test_transport_config, MockConnector};
use integrations_mailer::{ConnectionPool, PoolConfig, SendContext, SmtpClient};

fn pool_config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn test_sessions_never_exceed_max_connections() {
    let connector = MockConnector::new();
    connector.set_latency(Duration::from_millis(20));
    let client = SmtpClient::builder()
        .transport(test_transport_config())
        .pool(pool_config(2))
        .connector(Arc::new(connector.clone()))
        .build()
        .unwrap();

    client
        .send_bulk_messages(&SendContext::background(), test_messages(8), 8)
        .await
        .unwrap();

    assert!(connector.connect_count() <= 2);
    assert!(connector.max_in_flight() <= 2);
    assert_eq!(connector.sent().len(), 8);

    let status = client.pool_status();
    assert_eq!(status.max_size, 2);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_closed_pool_fails_fast() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(1), test_transport_config(), Arc::new(connector.clone()));
    let ctx = SendContext::background();

    let conn = pool.acquire(&ctx, "req-1").await.unwrap();
    pool.release(conn, "req-1").await;
    pool.close().await;

    let started = tokio::time::Instant::now();
    let err = pool.acquire(&ctx, "req-2").await.unwrap_err();
    assert_eq!(err.code(), codes::POOL_CLOSED);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(connector.quit_count(), 1);
    assert!(pool.status().closed);
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_pool_usable() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(1), test_transport_config(), Arc::new(connector.clone()));

    let held = pool.acquire(&SendContext::background(), "holder").await.unwrap();

    let ctx = SendContext::background();
    ctx.cancel();
    assert!(pool.acquire(&ctx, "waiter").await.is_err());

    pool.release(held, "holder").await;
    let again = pool.acquire(&SendContext::background(), "next").await.unwrap();
    assert_eq!(connector.connect_count(), 1);
    pool.release(again, "next").await;
    assert_eq!(pool.status().pending, 0);
}
