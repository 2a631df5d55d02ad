//! SMTP command and reply codec (RFC 5321).
//!
//! Formatting of client commands, parsing of (multi-line) server replies and
//! EHLO capabilities, and DATA dot-stuffing. No I/O happens here.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Reply codes the session relies on.
pub mod reply_codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Requested action completed.
    pub const OK: u16 = 250;
    /// Server challenge during AUTH.
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

/// Malformed server reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// No lines were read.
    #[error("empty reply")]
    Empty,
    /// Line does not start with a three-digit code.
    #[error("malformed reply line: {0}")]
    Malformed(String),
    /// Lines of one reply carry different codes.
    #[error("inconsistent codes in multi-line reply")]
    InconsistentCodes,
}

/// Client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Extended hello.
    Ehlo(String),
    /// Basic hello, for servers that reject EHLO.
    Helo(String),
    /// Upgrade to TLS.
    StartTls,
    /// Start a SASL exchange.
    Auth {
        /// Mechanism name.
        mechanism: String,
        /// Base64 initial response.
        initial_response: Option<String>,
    },
    /// Bare base64 line answering a 334 challenge.
    AuthResponse(String),
    /// Cancel a SASL exchange.
    AuthCancel,
    /// Open a transaction for the bare envelope sender.
    MailFrom(String),
    /// Add a bare envelope recipient.
    RcptTo(String),
    /// Start message content.
    Data,
    /// Reset the transaction.
    Rset,
    /// Keepalive.
    Noop,
    /// End the session.
    Quit,
}

impl Command {
    /// Wire form without the trailing CRLF.
    pub fn to_line(&self) -> String {
        match self {
            Command::Ehlo(id) => format!("EHLO {}", id),
            Command::Helo(id) => format!("HELO {}", id),
            Command::StartTls => "STARTTLS".to_string(),
            Command::Auth { mechanism, initial_response: Some(initial) } => {
                format!("AUTH {} {}", mechanism, initial)
            }
            Command::Auth { mechanism, initial_response: None } => format!("AUTH {}", mechanism),
            Command::AuthResponse(line) => line.clone(),
            Command::AuthCancel => "*".to_string(),
            Command::MailFrom(address) => format!("MAIL FROM:<{}>", address),
            Command::RcptTo(address) => format!("RCPT TO:<{}>", address),
            Command::Data => "DATA".to_string(),
            Command::Rset => "RSET".to_string(),
            Command::Noop => "NOOP".to_string(),
            Command::Quit => "QUIT".to_string(),
        }
    }

    /// Form safe for logs; SASL payloads are elided.
    pub fn redacted(&self) -> String {
        match self {
            Command::Auth { mechanism, .. } => format!("AUTH {} ***", mechanism),
            Command::AuthResponse(_) => "***".to_string(),
            other => other.to_line(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Enhanced status code (RFC 3463), e.g. `5.1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode {
    /// Class (2, 4 or 5).
    pub class: u8,
    /// Subject.
    pub subject: u16,
    /// Detail.
    pub detail: u16,
}

impl EnhancedCode {
    fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class: u8 = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some(Self { class, subject, detail })
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit code.
    pub code: u16,
    /// Enhanced status code from the first line, if any.
    pub enhanced: Option<EnhancedCode>,
    /// Text of each line.
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: None,
            lines: vec![text.into()],
        }
    }

    /// Returns true if a reply line continues (`250-...`).
    pub fn is_continuation(line: &str) -> bool {
        line.as_bytes().get(3) == Some(&b'-')
    }

    /// Parses the raw lines of one reply (CRLF already stripped).
    pub fn parse(raw: &[String]) -> Result<Self, ReplyError> {
        if raw.is_empty() {
            return Err(ReplyError::Empty);
        }

        let mut code = 0;
        let mut enhanced = None;
        let mut lines = Vec::with_capacity(raw.len());

        for (i, line) in raw.iter().enumerate() {
            let parsed: u16 = line
                .get(..3)
                .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| ReplyError::Malformed(line.clone()))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(ReplyError::InconsistentCodes);
            }

            let mut text = line.get(4..).unwrap_or("");
            if i == 0 {
                let (first, rest) = text.split_once(' ').unwrap_or((text, ""));
                if let Some(esc) = EnhancedCode::parse(first) {
                    enhanced = Some(esc);
                    text = rest;
                }
            }
            lines.push(text.trim().to_string());
        }

        Ok(Self { code, enhanced, lines })
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx.
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// First line of text.
    pub fn text(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.enhanced {
            Some(esc) => write!(f, "{} {} {}", self.code, esc, self.text()),
            None => write!(f, "{} {}", self.code, self.text()),
        }
    }
}

/// Extensions advertised in an EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// SASL mechanisms, upper-cased.
    pub auth: BTreeSet<String>,
    /// STARTTLS offered.
    pub starttls: bool,
    /// SIZE limit, if advertised.
    pub size: Option<usize>,
    /// 8BITMIME offered.
    pub eight_bit_mime: bool,
    /// SMTPUTF8 offered.
    pub smtputf8: bool,
}

impl Capabilities {
    /// Reads capabilities from the EHLO reply; the first line is the greeting.
    pub fn from_ehlo(reply: &Reply) -> Self {
        let mut caps = Self::default();
        for line in reply.lines.iter().skip(1) {
            let upper = line.to_ascii_uppercase();
            let mut words = upper.split_whitespace();
            match words.next() {
                Some("AUTH") => caps.auth.extend(words.map(str::to_string)),
                Some("STARTTLS") => caps.starttls = true,
                Some("SIZE") => caps.size = words.next().and_then(|s| s.parse().ok()),
                Some("8BITMIME") => caps.eight_bit_mime = true,
                Some("SMTPUTF8") => caps.smtputf8 = true,
                _ => {}
            }
        }
        caps
    }

    /// Returns true if `mechanism` was advertised.
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth.contains(&mechanism.to_ascii_uppercase())
    }
}

/// Prepares message text for DATA: CRLF line endings, a leading `.` doubled
/// on every line, terminated by `CRLF.CRLF`.
pub fn encode_data(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let body = message.strip_suffix("\r\n").or_else(|| message.strip_suffix('\n')).unwrap_or(message);

    if !body.is_empty() {
        for line in body.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with('.') {
                out.push(b'.');
            }
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(Command::Ehlo("localhost".into()).to_line(), "EHLO localhost");
        assert_eq!(Command::MailFrom("a@b.com".into()).to_line(), "MAIL FROM:<a@b.com>");
        assert_eq!(Command::RcptTo("c@d.com".into()).to_line(), "RCPT TO:<c@d.com>");
        assert_eq!(
            Command::Auth { mechanism: "PLAIN".into(), initial_response: Some("AGEAYg==".into()) }.to_line(),
            "AUTH PLAIN AGEAYg=="
        );
        assert_eq!(Command::AuthCancel.to_line(), "*");
    }

    #[test]
    fn test_auth_is_redacted() {
        let cmd = Command::Auth { mechanism: "XOAUTH2".into(), initial_response: Some("c2VjcmV0".into()) };
        assert!(!cmd.to_string().contains("c2VjcmV0"));
        assert!(!Command::AuthResponse("c2VjcmV0".into()).to_string().contains("c2VjcmV0"));
    }

    #[test]
    fn test_reply_parse() {
        let reply = Reply::parse(&lines(&["250 OK"])).unwrap();
        assert_eq!(reply.code, 250);
        assert!(reply.is_success());
        assert_eq!(reply.text(), "OK");

        let reply = Reply::parse(&lines(&["550 5.1.1 User unknown"])).unwrap();
        assert_eq!(reply.enhanced, Some(EnhancedCode { class: 5, subject: 1, detail: 1 }));
        assert_eq!(reply.text(), "User unknown");
        assert_eq!(reply.to_string(), "550 5.1.1 User unknown");

        let reply = Reply::parse(&lines(&["334 "])).unwrap();
        assert!(reply.is_intermediate());
        assert_eq!(reply.text(), "");
    }

    #[test]
    fn test_reply_parse_errors() {
        assert_eq!(Reply::parse(&[]), Err(ReplyError::Empty));
        assert!(matches!(Reply::parse(&lines(&["OK"])), Err(ReplyError::Malformed(_))));
        assert_eq!(
            Reply::parse(&lines(&["250-a", "251 b"])),
            Err(ReplyError::InconsistentCodes)
        );
    }

    #[test]
    fn test_capabilities() {
        let reply = Reply::parse(&lines(&[
            "250-smtp.example.com at your service",
            "250-SIZE 35882577",
            "250-8BITMIME",
            "250-STARTTLS",
            "250-AUTH LOGIN PLAIN XOAUTH2",
            "250 SMTPUTF8",
        ]))
        .unwrap();
        assert!(Reply::is_continuation("250-SIZE 1"));

        let caps = Capabilities::from_ehlo(&reply);
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert!(caps.smtputf8);
        assert_eq!(caps.size, Some(35882577));
        assert!(caps.supports_auth("xoauth2"));
        assert!(caps.supports_auth("PLAIN"));
        assert!(!caps.supports_auth("CRAM-MD5"));
    }

    #[test]
    fn test_encode_data_dot_stuffing() {
        let out = encode_data("Subject: x\r\n\r\n.hidden\r\nok\r\n..two");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Subject: x\r\n\r\n..hidden\r\nok\r\n...two\r\n.\r\n"
        );
    }

    #[test]
    fn test_encode_data_bare_lf() {
        let out = encode_data("a\nb\n");
        assert_eq!(out, b"a\r\nb\r\n.\r\n");
    }
}
