//! # Mailer
//!
//! Outbound SMTP delivery client with:
//! - RFC 5322 message construction (plain text, HTML, attachments)
//! - Pooled SMTP sessions over STARTTLS or implicit TLS
//! - OAuth2 (XOAUTH2) or PLAIN authentication
//! - Token-bucket rate limiting and retry with jittered backoff
//! - Concurrent bulk sends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_mailer::{Message, SendContext, SmtpClient, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TransportConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let client = SmtpClient::builder().transport(transport).build()?;
//!
//!     let message = Message::new("sender@example.com")
//!         .to("recipient@example.com")
//!         .subject("Hello from Rust!")
//!         .body("This is a test email.");
//!
//!     client.send_message(&SendContext::background(), &message).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod context;
pub mod errors;
pub mod types;
pub mod validation;

// Wire protocol and sessions
pub mod protocol;
pub mod transport;
pub mod pool;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Client
pub mod client;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{
    AuthStrategy, CachingTokenManager, InMemoryTokenStore, OAuth2Config, OAuth2Provider, OAuth2Token,
    ProviderEndpoints, RefreshTokenSource, StaticTokenManager, StoredToken, TokenManager, TokenSource, TokenStore,
};
pub use client::{ClientStats, SendState, SmtpClient, SmtpClientBuilder};
pub use config::{LogFormat, LoggingConfig, MailerConfig, PoolConfig, RateLimitPolicy, RetryPolicy, TransportConfig};
pub use context::{Interrupted, SendContext};
pub use errors::{BulkSendError, ErrorKind, MailError, MailResult};
pub use mime::MessageBuilder;
pub use observability::{init_logging, MailMetrics, MetricsSink, MetricsSnapshot, NoopMetrics};
pub use pool::ConnectionPool;
pub use resilience::{RateLimiter, RetryManager};
pub use types::{Address, Attachment, Message, PoolStatus, ProviderType};
pub use validation::MessageValidator;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
