//! Bulk Send Example
//!
//! This example demonstrates how to:
//! - Send many messages concurrently through one pool
//! - Throttle with the rate limiter
//! - Report partial failures
//!
//! Runs against the in-memory transport so it needs no server.

use std::sync::Arc;
use std::time::Duration;

use integrations_mailer::mocks::{test_transport_config, MockConnector};
use integrations_mailer::{
    init_logging, BulkSendError, LogFormat, LoggingConfig, Message, PoolConfig, RateLimitPolicy, SendContext,
    SmtpClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LoggingConfig {
        level: "info".to_string(),
        format: LogFormat::Json,
    })?;

    let connector = MockConnector::new();
    connector.set_latency(Duration::from_millis(25));
    connector.reject_recipient("user13@example.com");

    let client = SmtpClient::builder()
        .transport(test_transport_config())
        .pool(PoolConfig {
            max_connections: 4,
            ..PoolConfig::default()
        })
        .rate_limit(RateLimitPolicy {
            requests_per_minute: 600,
            burst: 20,
            enabled: true,
        })
        .connector(Arc::new(connector.clone()))
        .build()?;

    let messages: Vec<Message> = (0..25)
        .map(|i| {
            Message::new("Newsletter <news@example.com>")
                .to(format!("user{}@example.com", i))
                .subject(format!("Issue #{}", i))
                .body("This week's highlights...")
        })
        .collect();

    let ctx = SendContext::background().with_timeout(Duration::from_secs(30));
    println!("Sending {} messages...", messages.len());

    match client.send_bulk_messages(&ctx, messages, 8).await {
        Ok(()) => println!("All messages delivered"),
        Err(BulkSendError::Partial { failed, total, failures }) => {
            println!("{} of {} messages failed", failed, total);
            for (index, error) in failures {
                println!("  #{}: {}", index, error);
            }
        }
        Err(BulkSendError::Cancelled) => println!("Bulk send cancelled"),
    }

    println!("Connections opened: {}", connector.connect_count());
    if let Some(metrics) = client.metrics() {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }

    client.close().await;
    Ok(())
}
