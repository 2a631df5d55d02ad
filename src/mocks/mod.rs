//! Mock implementations for testing.
//!
//! [`MockConnector`] hands out [`MockSession`]s that share one recorder, so
//! a test can script failures per protocol step and inspect every delivered
//! message afterwards.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::{HttpRequest, HttpResponse, HttpTransport, OAuth2Token, SaslMechanism, TokenManager};
use crate::config::TransportConfig;
use crate::context::SendContext;
use crate::errors::{codes, MailError, MailResult};
use crate::protocol::Reply;
use crate::transport::{Connector, MailSession, TransportError};
use crate::types::{Attachment, Message};

/// Protocol step a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    /// Dialing.
    Connect,
    /// AUTH exchange (replies 535).
    Auth,
    /// MAIL FROM (replies 451).
    Mail,
    /// DATA (connection drops).
    Data,
    /// RSET (replies 421).
    Reset,
    /// NOOP (connection drops).
    Noop,
}

/// A message accepted by a mock session.
#[derive(Debug, Clone)]
pub struct SentMail {
    /// Connection that carried it.
    pub connection: usize,
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients in RCPT order.
    pub recipients: Vec<String>,
    /// Message text as passed to DATA.
    pub data: String,
}

#[derive(Debug, Default)]
struct Recorder {
    connects: AtomicUsize,
    quits: AtomicUsize,
    resets: AtomicUsize,
    auths: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failures: Mutex<HashMap<MockStep, usize>>,
    rejected: Mutex<HashSet<String>>,
    mechanisms: Mutex<Vec<String>>,
    identities: Mutex<Vec<String>>,
    sent: Mutex<Vec<SentMail>>,
    latency: Mutex<Duration>,
    connect_latency: Mutex<Duration>,
}

impl Recorder {
    fn take_failure(&self, step: MockStep) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&step) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Connector producing [`MockSession`]s. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    recorder: Arc<Recorder>,
}

impl MockConnector {
    /// Creates a connector whose sessions accept everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` occurrences of `step` fail.
    pub fn fail_next(&self, step: MockStep, times: usize) -> &Self {
        *self.recorder.failures.lock().unwrap().entry(step).or_insert(0) += times;
        self
    }

    /// Makes the next `times` dials fail.
    pub fn fail_connects(&self, times: usize) -> &Self {
        self.fail_next(MockStep::Connect, times)
    }

    /// Rejects `RCPT TO` for `address` with 550.
    pub fn reject_recipient(&self, address: &str) -> &Self {
        self.recorder.rejected.lock().unwrap().insert(address.to_string());
        self
    }

    /// Delays every DATA by `latency`.
    pub fn set_latency(&self, latency: Duration) -> &Self {
        *self.recorder.latency.lock().unwrap() = latency;
        self
    }

    /// Delays every dial by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) -> &Self {
        *self.recorder.connect_latency.lock().unwrap() = latency;
        self
    }

    /// Successful dials.
    pub fn connect_count(&self) -> usize {
        self.recorder.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed with QUIT.
    pub fn quit_count(&self) -> usize {
        self.recorder.quits.load(Ordering::SeqCst)
    }

    /// RSET commands received.
    pub fn reset_count(&self) -> usize {
        self.recorder.resets.load(Ordering::SeqCst)
    }

    /// Successful AUTH exchanges.
    pub fn auth_count(&self) -> usize {
        self.recorder.auths.load(Ordering::SeqCst)
    }

    /// Mechanism names used for AUTH, in order.
    pub fn mechanisms(&self) -> Vec<String> {
        self.recorder.mechanisms.lock().unwrap().clone()
    }

    /// Identities that authenticated, in order.
    pub fn identities(&self) -> Vec<String> {
        self.recorder.identities.lock().unwrap().clone()
    }

    /// Highest number of transactions that were open at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.recorder.max_in_flight.load(Ordering::SeqCst)
    }

    /// Delivered messages.
    pub fn sent(&self) -> Vec<SentMail> {
        self.recorder.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &TransportConfig) -> Result<Box<dyn MailSession>, TransportError> {
        let latency = *self.recorder.connect_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.recorder.take_failure(MockStep::Connect) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )));
        }
        let id = self.recorder.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockSession::new(id, self.recorder.clone())))
    }
}

/// Scripted in-memory session.
#[derive(Debug)]
pub struct MockSession {
    id: usize,
    recorder: Arc<Recorder>,
    authenticated_as: Option<String>,
    envelope: Option<(String, Vec<String>)>,
    closed: bool,
}

impl MockSession {
    fn new(id: usize, recorder: Arc<Recorder>) -> Self {
        Self {
            id,
            recorder,
            authenticated_as: None,
            envelope: None,
            closed: false,
        }
    }

    fn rejected(command: &str, code: u16, text: &str) -> TransportError {
        TransportError::Rejected {
            command: command.to_string(),
            reply: Reply::new(code, text),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn finish_transaction(&mut self) {
        if self.envelope.take().is_some() {
            self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl MailSession for MockSession {
    async fn authenticate(&mut self, mechanism: &SaslMechanism) -> Result<(), TransportError> {
        self.check_open()?;
        let Some((name, _)) = mechanism.start_auth() else {
            return Ok(());
        };
        if self.authenticated_as.is_some() {
            return Err(Self::rejected("AUTH", 503, "5.5.1 already authenticated"));
        }
        if self.recorder.take_failure(MockStep::Auth) {
            return Err(Self::rejected("AUTH", 535, "5.7.8 authentication failed"));
        }
        self.recorder.auths.fetch_add(1, Ordering::SeqCst);
        self.recorder.mechanisms.lock().unwrap().push(name.to_string());
        let identity = mechanism.identity().unwrap_or_default().to_string();
        self.recorder.identities.lock().unwrap().push(identity.clone());
        self.authenticated_as = Some(identity);
        Ok(())
    }

    fn authenticated_as(&self) -> Option<&str> {
        self.authenticated_as.as_deref()
    }

    async fn mail(&mut self, from: &str) -> Result<(), TransportError> {
        self.check_open()?;
        if self.recorder.take_failure(MockStep::Mail) {
            return Err(Self::rejected("MAIL FROM", 451, "4.3.0 try again later"));
        }
        self.finish_transaction();
        self.envelope = Some((from.to_string(), Vec::new()));

        let now = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> Result<(), TransportError> {
        self.check_open()?;
        if self.recorder.rejected.lock().unwrap().contains(to) {
            return Err(Self::rejected("RCPT TO", 550, "5.1.1 no such user"));
        }
        match self.envelope.as_mut() {
            Some((_, recipients)) => {
                recipients.push(to.to_string());
                Ok(())
            }
            None => Err(Self::rejected("RCPT TO", 503, "5.5.1 need MAIL first")),
        }
    }

    async fn data(&mut self, message: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let latency = *self.recorder.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.recorder.take_failure(MockStep::Data) {
            self.finish_transaction();
            self.closed = true;
            return Err(TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "mock connection lost")));
        }

        let Some((from, recipients)) = self.envelope.clone() else {
            return Err(Self::rejected("DATA", 503, "5.5.1 no valid recipients"));
        };
        self.finish_transaction();
        self.recorder.sent.lock().unwrap().push(SentMail {
            connection: self.id,
            from,
            recipients,
            data: message.to_string(),
        });
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        self.finish_transaction();
        if self.recorder.take_failure(MockStep::Reset) {
            return Err(Self::rejected("RSET", 421, "4.4.2 closing connection"));
        }
        self.recorder.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        if self.recorder.take_failure(MockStep::Noop) {
            self.closed = true;
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), TransportError> {
        self.finish_transaction();
        if !self.closed {
            self.closed = true;
            self.recorder.quits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Token manager returning a fixed token, optionally failing.
#[derive(Debug, Default)]
pub struct MockTokenManager {
    token: String,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl MockTokenManager {
    /// Returns `token` on every call.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Makes the next `times` calls fail.
    pub fn fail_next(&self, times: usize) {
        self.failures.fetch_add(times, Ordering::SeqCst);
    }

    /// Number of `get_token` calls.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenManager for MockTokenManager {
    async fn get_token(&self, _ctx: &SendContext, request_id: &str) -> MailResult<OAuth2Token> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MailError::connection(codes::INTERNAL, "mock token endpoint unavailable")
                .with_request_id(request_id));
        }
        Ok(OAuth2Token::new(self.token.clone()).expires_in(Duration::from_secs(3600)))
    }
}

/// Token endpoint answering with queued responses in order.
#[derive(Debug, Default)]
pub struct MockHttpTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpTransport {
    /// Creates a transport with no responses queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn respond(&self, status: u16, body: &str) -> &Self {
        self.responses.lock().unwrap().push_back(HttpResponse {
            status,
            body: body.to_string(),
        });
        self
    }

    /// Requests received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> MailResult<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses.lock().unwrap().pop_front().ok_or_else(|| {
            MailError::connection(codes::HTTP_REQUEST_FAILED, "no mock response queued")
        })
    }
}

/// Plaintext transport settings for tests.
pub fn test_transport_config() -> TransportConfig {
    TransportConfig {
        host: "smtp.mock.test".to_string(),
        use_tls: false,
        ..Default::default()
    }
}

/// A valid plain-text message.
pub fn test_message() -> Message {
    Message::new("sender@example.com")
        .to("recipient@example.com")
        .subject("Test Subject")
        .body("Test body")
}

/// A valid message with an HTML body and one attachment.
pub fn test_message_with_attachment() -> Message {
    test_message()
        .html("<html><body><h1>HTML version</h1></body></html>")
        .attach(Attachment::new("test.txt", "text/plain", b"Hello, World!".to_vec()))
}

/// `count` valid messages to distinct recipients.
pub fn test_messages(count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| {
            Message::new("sender@example.com")
                .to(format!("recipient{}@example.com", i))
                .subject(format!("Message {}", i))
                .body("Test body")
        })
        .collect()
}
