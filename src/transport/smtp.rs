//! SMTP session over TCP with optional TLS.

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{Connector, MailSession, TransportError};
use crate::auth::{SaslMechanism, SaslStep};
use crate::config::{TlsMode, TransportConfig};
use crate::protocol::{encode_data, reply_codes, Capabilities, Command, Reply};

/// SASL round-trips allowed before giving up on a chatty server.
const MAX_AUTH_STEPS: usize = 4;

/// Reply lines longer than this are treated as protocol errors.
const MAX_LINE_LEN: usize = 4096;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type Stream = BufReader<Box<dyn Io>>;

/// Dials real servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpConnector;

impl SmtpConnector {
    /// Creates a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    async fn connect(&self, config: &TransportConfig) -> Result<Box<dyn MailSession>, TransportError> {
        Ok(Box::new(SmtpSession::connect(config).await?))
    }
}

/// Session with a single server.
pub struct SmtpSession {
    stream: Option<Stream>,
    host: String,
    client_id: String,
    timeout: Duration,
    capabilities: Capabilities,
    tls: bool,
    authenticated_as: Option<String>,
}

impl fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSession")
            .field("host", &self.host)
            .field("tls", &self.tls)
            .field("authenticated_as", &self.authenticated_as)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SmtpSession {
    /// Dials `host:port`, secures the session per [`TransportConfig::tls_mode`],
    /// and completes the EHLO exchange.
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let address = (config.host.as_str(), config.port);
        let tcp = timeout(config.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;
        tcp.set_nodelay(true).ok();

        let mut session = Self {
            stream: Some(BufReader::new(Box::new(tcp) as Box<dyn Io>)),
            host: config.host.clone(),
            client_id: config.client_id().to_string(),
            timeout: config.timeout,
            capabilities: Capabilities::default(),
            tls: false,
            authenticated_as: None,
        };

        let mode = config.tls_mode();
        if mode == TlsMode::Implicit {
            session.upgrade_tls(config).await?;
        }

        let greeting = session.read_reply().await?;
        if greeting.code != reply_codes::SERVICE_READY {
            return Err(TransportError::Rejected {
                command: "greeting".to_string(),
                reply: greeting,
            });
        }

        session.hello().await?;

        if mode == TlsMode::StartTls {
            if !session.capabilities.starttls {
                return Err(TransportError::Unsupported("STARTTLS".to_string()));
            }
            session.expect(&Command::StartTls, &[reply_codes::SERVICE_READY]).await?;
            session.upgrade_tls(config).await?;
            session.hello().await?;
        }

        tracing::debug!(host = %session.host, tls = session.tls, "SMTP session established");
        Ok(session)
    }

    /// Capabilities from the latest EHLO.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns true if the session is encrypted.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    async fn hello(&mut self) -> Result<(), TransportError> {
        let ehlo = Command::Ehlo(self.client_id.clone());
        let reply = self.command(&ehlo).await?;
        if reply.is_success() {
            self.capabilities = Capabilities::from_ehlo(&reply);
            return Ok(());
        }
        let helo = Command::Helo(self.client_id.clone());
        self.expect(&helo, &[reply_codes::OK]).await?;
        self.capabilities = Capabilities::default();
        Ok(())
    }

    #[cfg(feature = "rustls-tls")]
    async fn upgrade_tls(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        use rustls::pki_types::ServerName;
        use std::sync::Arc;

        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_client_config(config)?));
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name: {}", config.host)))?;

        let plain = self.stream.take().ok_or(TransportError::Closed)?.into_inner();
        let tls = timeout(self.timeout, connector.connect(server_name, plain))
            .await
            .map_err(|_| TransportError::Timeout("TLS handshake"))?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        self.stream = Some(BufReader::new(Box::new(tls) as Box<dyn Io>));
        self.tls = true;
        Ok(())
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn upgrade_tls(&mut self, _config: &TransportConfig) -> Result<(), TransportError> {
        Err(TransportError::Tls("built without TLS support".to_string()))
    }

    fn stream(&mut self) -> Result<&mut Stream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let limit = self.timeout;
        let stream = self.stream()?.get_mut();
        timeout(limit, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout("write"))??;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let limit = self.timeout;
        let stream = self.stream()?;
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let mut bounded = (&mut *stream).take(MAX_LINE_LEN as u64 + 1);
            let n = timeout(limit, bounded.read_line(&mut line))
                .await
                .map_err(|_| TransportError::Timeout("read"))??;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            if line.len() > MAX_LINE_LEN {
                return Err(crate::protocol::ReplyError::Malformed("reply line too long".to_string()).into());
            }

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let more = Reply::is_continuation(&line);
            lines.push(line);
            if !more {
                break;
            }
        }

        let reply = Reply::parse(&lines)?;
        tracing::trace!(code = reply.code, text = reply.text(), "SMTP reply");
        Ok(reply)
    }

    async fn command(&mut self, command: &Command) -> Result<Reply, TransportError> {
        tracing::trace!(command = %command, "SMTP command");
        let line = format!("{}\r\n", command.to_line());
        self.write(line.as_bytes()).await?;
        self.read_reply().await
    }

    async fn expect(&mut self, command: &Command, accepted: &[u16]) -> Result<Reply, TransportError> {
        let reply = self.command(command).await?;
        if accepted.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(TransportError::Rejected {
                command: command.redacted(),
                reply,
            })
        }
    }
}

#[async_trait]
impl MailSession for SmtpSession {
    async fn authenticate(&mut self, mechanism: &SaslMechanism) -> Result<(), TransportError> {
        let Some((name, initial)) = mechanism.start_auth() else {
            return Ok(());
        };
        if !self.capabilities.auth.is_empty() && !self.capabilities.supports_auth(name) {
            return Err(TransportError::Unsupported(format!("AUTH {}", name)));
        }

        let mut command = Command::Auth {
            mechanism: name.to_string(),
            initial_response: Some(initial),
        };
        for _ in 0..MAX_AUTH_STEPS {
            let reply = self.command(&command).await?;
            match reply.code {
                reply_codes::AUTH_SUCCESS => {
                    self.authenticated_as = Some(mechanism.identity().unwrap_or_default().to_string());
                    return Ok(());
                }
                reply_codes::AUTH_CONTINUE => match mechanism.continue_auth(reply.text()) {
                    SaslStep::Respond(line) => command = Command::AuthResponse(line),
                    SaslStep::Abort(reason) => {
                        // Server answers the cancel with 501; the reason is what matters.
                        self.command(&Command::AuthCancel).await?;
                        return Err(TransportError::AuthAborted(reason));
                    }
                },
                _ => {
                    return Err(TransportError::Rejected {
                        command: command.redacted(),
                        reply,
                    })
                }
            }
        }
        Err(TransportError::AuthAborted(format!("{} exchange did not complete", name)))
    }

    fn authenticated_as(&self) -> Option<&str> {
        self.authenticated_as.as_deref()
    }

    async fn mail(&mut self, from: &str) -> Result<(), TransportError> {
        self.expect(&Command::MailFrom(from.to_string()), &[reply_codes::OK]).await?;
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> Result<(), TransportError> {
        self.expect(&Command::RcptTo(to.to_string()), &[reply_codes::OK, 251]).await?;
        Ok(())
    }

    async fn data(&mut self, message: &str) -> Result<(), TransportError> {
        self.expect(&Command::Data, &[reply_codes::START_MAIL_INPUT]).await?;
        self.write(&encode_data(message)).await?;

        let reply = self.read_reply().await?;
        if reply.code != reply_codes::OK {
            return Err(TransportError::Rejected {
                command: "message data".to_string(),
                reply,
            });
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.expect(&Command::Rset, &[reply_codes::OK]).await?;
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), TransportError> {
        self.expect(&Command::Noop, &[reply_codes::OK]).await?;
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = self.expect(&Command::Quit, &[reply_codes::SERVICE_CLOSING]).await;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        result.map(|_| ())
    }
}

#[cfg(feature = "rustls-tls")]
fn tls_client_config(config: &TransportConfig) -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_cert_path {
        let pem = std::fs::read(path)
            .map_err(|e| TransportError::Tls(format!("cannot read {}: {}", path.display(), e)))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| TransportError::Tls(format!("bad PEM in {}: {}", path.display(), e)))?;
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("rejected CA certificate: {}", e)))?;
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
