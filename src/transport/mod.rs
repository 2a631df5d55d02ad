//! Transport layer for SMTP sessions.
//!
//! The client talks to servers only through [`Connector`] and
//! [`MailSession`]. [`SmtpConnector`] is the network implementation; tests
//! substitute the mocks from [`crate::mocks`].

pub mod smtp;

pub use smtp::{SmtpConnector, SmtpSession};

use std::fmt;
use std::io;
use async_trait::async_trait;
use thiserror::Error;

use crate::auth::SaslMechanism;
use crate::config::TransportConfig;
use crate::protocol::{Reply, ReplyError};

/// Failure of a transport primitive.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A single read, write, or handshake exceeded the transport timeout.
    #[error("timed out during {0}")]
    Timeout(&'static str),
    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),
    /// The server replied with an unexpected code.
    #[error("{command} rejected: {reply}")]
    Rejected {
        /// Command, with secrets elided.
        command: String,
        /// Server reply.
        reply: Reply,
    },
    /// Unparseable reply.
    #[error(transparent)]
    Protocol(#[from] ReplyError),
    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,
    /// The SASL exchange was cancelled by the client.
    #[error("authentication aborted: {0}")]
    AuthAborted(String),
    /// The server lacks a required extension.
    #[error("server does not support {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Reply code of a rejection.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            TransportError::Rejected { reply, .. } => Some(reply.code),
            _ => None,
        }
    }

    /// Returns true if the session cannot be used any further.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. } | TransportError::AuthAborted(_))
    }
}

/// An open, greeted SMTP session.
#[async_trait]
pub trait MailSession: Send + fmt::Debug {
    /// Runs the SASL exchange for `mechanism`. Anonymous is a no-op.
    async fn authenticate(&mut self, mechanism: &SaslMechanism) -> Result<(), TransportError>;

    /// Identity this session authenticated as, once `authenticate`
    /// succeeded. SMTP allows one AUTH per session, so it never changes.
    fn authenticated_as(&self) -> Option<&str>;

    /// Returns true once `authenticate` succeeded on this session.
    fn is_authenticated(&self) -> bool {
        self.authenticated_as().is_some()
    }

    /// `MAIL FROM` with a bare address.
    async fn mail(&mut self, from: &str) -> Result<(), TransportError>;

    /// `RCPT TO` with a bare address.
    async fn rcpt(&mut self, to: &str) -> Result<(), TransportError>;

    /// `DATA` followed by the dot-stuffed message and terminator.
    async fn data(&mut self, message: &str) -> Result<(), TransportError>;

    /// `RSET`.
    async fn reset(&mut self) -> Result<(), TransportError>;

    /// `NOOP`.
    async fn noop(&mut self) -> Result<(), TransportError>;

    /// `QUIT` and close the socket.
    async fn quit(&mut self) -> Result<(), TransportError>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Dials, secures, and greets a server.
    async fn connect(&self, config: &TransportConfig) -> Result<Box<dyn MailSession>, TransportError>;
}
