//! Main SMTP client implementation.
//!
//! Provides a high-level interface for sending messages with:
//! - Connection pooling
//! - OAuth2 or PLAIN authentication
//! - Rate limiting and retry with backoff
//! - Concurrent bulk sends

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::auth::{AuthStrategy, TokenManager};
use crate::config::{MailerConfig, PoolConfig, RateLimitPolicy, RetryPolicy, TransportConfig};
use crate::context::SendContext;
use crate::errors::{codes, BulkSendError, MailError, MailResult};
use crate::mime::MessageBuilder;
use crate::observability::{MailMetrics, MetricsSink, MetricsSnapshot, Timer};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resilience::{RateLimiter, RetryManager};
use crate::transport::{Connector, SmtpConnector, TransportError};
use crate::types::{Address, Message, PoolStatus, ProviderType};
use crate::validation::MessageValidator;

/// Concurrency used by bulk sends when zero is requested.
pub const DEFAULT_BULK_CONCURRENCY: usize = 5;

/// Stage of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Not started.
    Idle,
    /// Checking the message.
    Validating,
    /// Rendering MIME.
    Building,
    /// Waiting for a pooled session.
    AcquiringConnection,
    /// AUTH exchange.
    Authenticating,
    /// MAIL, RCPT and DATA.
    Transmitting,
    /// Returning the session.
    Releasing,
    /// Delivered.
    Succeeded,
    /// Gave up.
    Failed,
}

impl SendState {
    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SendState::Idle => "idle",
            SendState::Validating => "validating",
            SendState::Building => "building",
            SendState::AcquiringConnection => "acquiring-connection",
            SendState::Authenticating => "authenticating",
            SendState::Transmitting => "transmitting",
            SendState::Releasing => "releasing",
            SendState::Succeeded => "succeeded",
            SendState::Failed => "failed",
        }
    }
}

fn enter(state: SendState, request_id: &str, attempt: u32) {
    tracing::debug!(request_id, attempt, state = state.as_str(), "Send state changed");
}

/// Rate limiter settings as reported by [`SmtpClient::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Whether limiting is active.
    pub enabled: bool,
    /// Sustained rate.
    pub requests_per_minute: u32,
    /// Bucket capacity.
    pub burst: u32,
}

/// Client state summary.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    pub port: u16,
    /// Provider identity.
    pub provider: ProviderType,
    /// Authentication strategy name.
    pub auth: &'static str,
    /// Pool usage.
    pub pool: PoolStatus,
    /// Rate limiter settings.
    pub rate_limit: RateLimitStats,
    /// Retry policy.
    pub retry: RetryPolicy,
}

/// Transaction failure plus whether the session survived it.
struct Failure {
    error: MailError,
    reusable: bool,
}

struct ClientInner {
    transport: TransportConfig,
    pool: ConnectionPool,
    auth: AuthStrategy,
    validator: MessageValidator,
    builder: MessageBuilder,
    retry: RetryManager,
    rate_limiter: RateLimiter,
    metrics: Arc<dyn MetricsSink>,
    collector: Option<Arc<MailMetrics>>,
}

/// High-level SMTP client. Clones share the pool, limiter and metrics.
#[derive(Clone)]
pub struct SmtpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpClient")
            .field("host", &self.inner.transport.host)
            .field("port", &self.inner.transport.port)
            .field("auth", &self.inner.auth.name())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl SmtpClient {
    /// Creates a client dialing real servers.
    pub fn new(
        transport: TransportConfig,
        pool: PoolConfig,
        retry: RetryPolicy,
        rate_limit: RateLimitPolicy,
        token_manager: Option<Arc<dyn TokenManager>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> MailResult<Self> {
        let mut builder = Self::builder()
            .transport(transport)
            .pool(pool)
            .retry(retry)
            .rate_limit(rate_limit)
            .metrics_sink(metrics);
        if let Some(manager) = token_manager {
            builder = builder.token_manager(manager);
        }
        builder.build()
    }

    /// Creates a client from loaded configuration, without OAuth2.
    pub fn from_config(config: MailerConfig) -> MailResult<Self> {
        Self::builder().config(config).build()
    }

    /// Creates a builder for the client.
    pub fn builder() -> SmtpClientBuilder {
        SmtpClientBuilder::default()
    }

    /// Sends one message: rate-limit wait, then validate, build, and deliver
    /// under the retry policy.
    pub async fn send_message(&self, ctx: &SendContext, message: &Message) -> MailResult<()> {
        let inner = &self.inner;
        let request_id = uuid::Uuid::new_v4().to_string();
        let timer = Timer::start("send_message");

        tracing::info!(
            request_id = %request_id,
            recipients = message.recipient_count(),
            provider = %inner.transport.provider,
            "Sending message"
        );

        if let Err(interrupted) = inner.rate_limiter.wait(ctx).await {
            inner.metrics.record_send_duration(timer.stop());
            inner.metrics.record_message_failed("rate_limited");
            tracing::warn!(request_id = %request_id, reason = %interrupted, "Rate limit wait interrupted");
            return Err(MailError::timeout(codes::RATE_LIMITED, "interrupted while waiting for rate limiter")
                .with_request_id(&request_id)
                .with_cause(interrupted));
        }

        let attempts = AtomicU32::new(0);
        let result = inner
            .retry
            .execute_with_retry(
                ctx,
                || {
                    let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    self.attempt(ctx, message, &request_id, attempt)
                },
                &request_id,
            )
            .await;

        let duration = timer.stop();
        inner.metrics.record_send_duration(duration);
        let attempt = attempts.load(Ordering::Relaxed);

        match &result {
            Ok(()) => {
                enter(SendState::Succeeded, &request_id, attempt);
                inner.metrics.record_message_sent();
                tracing::info!(
                    request_id = %request_id,
                    attempts = attempt,
                    duration_ms = duration.as_millis() as u64,
                    "Message sent"
                );
            }
            Err(e) => {
                enter(SendState::Failed, &request_id, attempt);
                inner.metrics.record_message_failed(e.kind().as_str());
                tracing::error!(
                    request_id = %request_id,
                    attempts = attempt,
                    duration_ms = duration.as_millis() as u64,
                    error = %e,
                    "Message send failed"
                );
            }
        }
        result
    }

    async fn attempt(&self, ctx: &SendContext, message: &Message, request_id: &str, attempt: u32) -> MailResult<()> {
        let inner = &self.inner;

        enter(SendState::Validating, request_id, attempt);
        inner.validator.validate(message, request_id)?;

        enter(SendState::Building, request_id, attempt);
        let data = inner.builder.build(message, request_id)?;

        enter(SendState::AcquiringConnection, request_id, attempt);
        let identity = inner.auth.identity_for(&message.from);
        let mut conn = inner.pool.acquire_as(ctx, identity.as_deref(), request_id).await?;

        let outcome = self
            .transact(ctx, &mut conn, message, identity.as_deref(), &data, request_id, attempt)
            .await;

        enter(SendState::Releasing, request_id, attempt);
        match outcome {
            Ok(()) => {
                inner.pool.release(conn, request_id).await;
                Ok(())
            }
            Err(failure) => {
                self.recover(ctx, conn, failure.reusable, request_id).await;
                Err(failure.error)
            }
        }
    }

    async fn transact(
        &self,
        ctx: &SendContext,
        conn: &mut PooledConnection,
        message: &Message,
        identity: Option<&str>,
        data: &str,
        request_id: &str,
        attempt: u32,
    ) -> Result<(), Failure> {
        let inner = &self.inner;

        let needs_auth = match (identity, conn.session().authenticated_as()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(wanted), Some(current)) if wanted.eq_ignore_ascii_case(current) => false,
            (Some(wanted), Some(current)) => {
                return Err(Failure {
                    error: MailError::authentication(
                        inner.auth.failure_code(),
                        format!("session is authenticated as {}, not {}", current, wanted),
                    )
                    .with_request_id(request_id),
                    reusable: false,
                });
            }
        };

        if needs_auth {
            enter(SendState::Authenticating, request_id, attempt);
            let mechanism = inner
                .auth
                .mechanism(ctx, &message.from, request_id)
                .await
                .map_err(|error| {
                    inner.metrics.record_auth_failure();
                    Failure { error, reusable: true }
                })?;

            let failure_code = inner.auth.failure_code();
            self.round_trip(ctx, request_id, conn.session().authenticate(&mechanism), |_| {
                MailError::authentication(failure_code, "SMTP authentication failed")
            })
            .await
            .map_err(|failure| {
                inner.metrics.record_auth_failure();
                failure
            })?;
        }

        enter(SendState::Transmitting, request_id, attempt);
        let from = envelope_address(&message.from);
        self.round_trip(ctx, request_id, conn.session().mail(&from), |_| {
            MailError::connection(codes::MAIL_FROM_FAILED, format!("sender <{}> rejected", from))
        })
        .await?;

        for recipient in message.all_recipients() {
            let to = envelope_address(recipient);
            self.round_trip(ctx, request_id, conn.session().rcpt(&to), |_| {
                MailError::connection(codes::RCPT_TO_FAILED, format!("recipient <{}> rejected", to))
            })
            .await?;
        }

        self.round_trip(ctx, request_id, conn.session().data(data), |e| match e {
            TransportError::Rejected { command, .. } if command == "DATA" => {
                MailError::connection(codes::DATA_START_FAILED, "server refused DATA")
            }
            _ => MailError::connection(codes::DATA_WRITE_FAILED, "failed to transmit message data"),
        })
        .await
    }

    /// Runs one transport call under the transport timeout and the context.
    async fn round_trip<T, F, E>(&self, ctx: &SendContext, request_id: &str, call: F, on_error: E) -> Result<T, Failure>
    where
        F: Future<Output = Result<T, TransportError>>,
        E: FnOnce(&TransportError) -> MailError,
    {
        match ctx.run(Some(self.inner.transport.timeout), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let reusable = !e.is_fatal();
                Err(Failure {
                    error: on_error(&e).with_request_id(request_id).with_cause(e),
                    reusable,
                })
            }
            Err(interrupted) => Err(Failure {
                error: MailError::from(interrupted).with_request_id(request_id),
                reusable: false,
            }),
        }
    }

    /// Returns a session after a failed transaction: reset and reuse it when
    /// possible, otherwise discard it.
    async fn recover(&self, ctx: &SendContext, mut conn: PooledConnection, reusable: bool, request_id: &str) {
        let pool = &self.inner.pool;
        if reusable {
            let reset = ctx.run(Some(self.inner.transport.timeout), conn.session().reset()).await;
            if matches!(reset, Ok(Ok(()))) {
                pool.release(conn, request_id).await;
                return;
            }
            tracing::debug!(request_id, "RSET failed; discarding connection");
        }
        pool.discard(conn, request_id).await;
    }

    /// Sends `messages` concurrently, at most `concurrency` at a time (zero
    /// means [`DEFAULT_BULK_CONCURRENCY`]).
    ///
    /// Every message is attempted. Returns [`BulkSendError::Partial`] naming
    /// how many failed, or [`BulkSendError::Cancelled`] as soon as `ctx` is
    /// cancelled.
    pub async fn send_bulk_messages(
        &self,
        ctx: &SendContext,
        messages: Vec<Message>,
        concurrency: usize,
    ) -> Result<(), BulkSendError> {
        let total = messages.len();
        if total == 0 {
            return Ok(());
        }
        let concurrency = if concurrency == 0 { DEFAULT_BULK_CONCURRENCY } else { concurrency };
        tracing::info!(total, concurrency, "Starting bulk send");

        let gate = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::channel::<(usize, MailResult<()>)>(total);

        for (index, message) in messages.into_iter().enumerate() {
            let client = self.clone();
            let ctx = ctx.clone();
            let gate = gate.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let outcome = match ctx.run(None, gate.acquire_owned()).await {
                    Ok(Ok(_permit)) => client.send_message(&ctx, &message).await,
                    Ok(Err(_)) => Err(MailError::new(
                        crate::errors::ErrorKind::Unknown,
                        codes::INTERNAL,
                        "bulk send gate closed",
                    )),
                    Err(interrupted) => Err(MailError::from(interrupted)),
                };
                let _ = tx.send((index, outcome)).await;
            });
        }
        drop(tx);

        let mut failures = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    tracing::warn!(total, "Bulk send cancelled");
                    return Err(BulkSendError::Cancelled);
                }
                outcome = rx.recv() => match outcome {
                    Some((index, Err(e))) => failures.push((index, e)),
                    Some((_, Ok(()))) => {}
                    None => break,
                },
            }
        }

        if failures.is_empty() {
            tracing::info!(total, "Bulk send completed");
            return Ok(());
        }
        failures.sort_by_key(|(index, _)| *index);
        tracing::warn!(total, failed = failures.len(), "Bulk send completed with failures");
        Err(BulkSendError::Partial {
            failed: failures.len(),
            total,
            failures,
        })
    }

    /// Checks the pool (acquire, NOOP, release) and, with OAuth2, that a
    /// token can be obtained.
    pub async fn health_check(&self, ctx: &SendContext) -> MailResult<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.inner.pool.health_check(ctx, &request_id).await?;

        if let Some(manager) = self.inner.auth.token_manager() {
            manager.get_token(ctx, &request_id).await.map_err(|e| {
                MailError::authentication(codes::TOKEN_RETRIEVAL_FAILED, "failed to obtain OAuth2 token")
                    .with_request_id(&request_id)
                    .with_cause(e)
            })?;
        }
        tracing::debug!(request_id = %request_id, "Health check passed");
        Ok(())
    }

    /// Closes the pool. Later sends fail with `POOL_CLOSED`.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }

    /// Current configuration and pool usage.
    pub fn stats(&self) -> ClientStats {
        let inner = &self.inner;
        let (requests_per_minute, burst) = inner.rate_limiter.limits();
        ClientStats {
            host: inner.transport.host.clone(),
            port: inner.transport.port,
            provider: inner.transport.provider,
            auth: inner.auth.name(),
            pool: inner.pool.status(),
            rate_limit: RateLimitStats {
                enabled: inner.rate_limiter.is_enabled(),
                requests_per_minute,
                burst,
            },
            retry: *inner.retry.policy(),
        }
    }

    /// Replaces the rate limit; applies to later sends.
    pub fn update_rate_limits(&self, requests_per_minute: u32, burst: u32) {
        self.inner.rate_limiter.update_limits(requests_per_minute, burst);
        tracing::info!(requests_per_minute, burst, "Rate limits updated");
    }

    /// Turns rate limiting on or off.
    pub fn enable_rate_limit(&self, enabled: bool) {
        self.inner.rate_limiter.set_enabled(enabled);
        tracing::info!(enabled, "Rate limiting toggled");
    }

    /// Metrics snapshot, when the built-in collector is in use.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.collector.as_ref().map(|c| c.snapshot())
    }

    /// Pool usage.
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }
}

/// Bare mailbox for the SMTP envelope.
fn envelope_address(address: &str) -> String {
    Address::parse(address)
        .map(|a| a.email)
        .unwrap_or_else(|_| address.trim().to_string())
}

/// Builder for [`SmtpClient`].
#[derive(Debug, Default)]
pub struct SmtpClientBuilder {
    transport: Option<TransportConfig>,
    pool: PoolConfig,
    retry: RetryPolicy,
    rate_limit: RateLimitPolicy,
    token_manager: Option<Arc<dyn TokenManager>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    connector: Option<Arc<dyn Connector>>,
}

impl SmtpClientBuilder {
    /// Takes every section from loaded configuration.
    pub fn config(mut self, config: MailerConfig) -> Self {
        self.transport = Some(config.transport);
        self.pool = config.pool;
        self.retry = config.retry;
        self.rate_limit = config.rate_limiting;
        self
    }

    /// Sets the server settings.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the pool settings.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the rate limit.
    pub fn rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Authenticates with XOAUTH2 using tokens from `manager`.
    pub fn token_manager(mut self, manager: Arc<dyn TokenManager>) -> Self {
        self.token_manager = Some(manager);
        self
    }

    /// Sends metrics to `sink` instead of the built-in collector.
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Opens sessions through `connector` instead of the network.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validates the settings and builds the client.
    pub fn build(self) -> MailResult<SmtpClient> {
        let transport = self
            .transport
            .ok_or_else(|| MailError::configuration("transport configuration is required"))?;
        transport.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;

        let (metrics, collector) = match self.metrics {
            Some(sink) => (sink, None),
            None => {
                let collector = Arc::new(MailMetrics::new());
                let sink: Arc<dyn MetricsSink> = collector.clone();
                (sink, Some(collector))
            }
        };
        let connector = self.connector.unwrap_or_else(|| Arc::new(SmtpConnector::new()));
        let auth = AuthStrategy::from_config(&transport, self.token_manager);

        tracing::debug!(
            host = %transport.host,
            port = transport.port,
            provider = %transport.provider,
            auth = auth.name(),
            "SMTP client created"
        );

        Ok(SmtpClient {
            inner: Arc::new(ClientInner {
                pool: ConnectionPool::new(self.pool, transport.clone(), connector),
                auth,
                validator: MessageValidator::new(),
                builder: MessageBuilder::new(),
                retry: RetryManager::new(self.retry),
                rate_limiter: RateLimiter::new(self.rate_limit),
                metrics,
                collector,
                transport,
            }),
        })
    }
}
