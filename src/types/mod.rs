//! Core types for the mail client.
//!
//! This module provides:
//! - The outbound [`Message`] and its [`Attachment`]s
//! - [`Address`] parsing with syntax checks
//! - Provider identity and pool status reporting

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an address string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Nothing but whitespace.
    #[error("address is empty")]
    Empty,
    /// Longer than 254 characters.
    #[error("address too long (max 254 characters)")]
    TooLong,
    /// Zero or several `@`.
    #[error("address must contain exactly one @")]
    AtSign,
    /// Local part empty or longer than 64 characters.
    #[error("local part must be 1-64 characters")]
    LocalPart,
    /// Domain empty, unqualified, or with empty labels.
    #[error("invalid domain")]
    Domain,
    /// Control characters or whitespace inside the address.
    #[error("address contains forbidden characters")]
    Forbidden,
    /// `<` without a matching `>`, or trailing text after `>`.
    #[error("unbalanced angle brackets")]
    Brackets,
}

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Parses `local@domain` or `Display Name <local@domain>`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(start) = s.find('<') {
            let end = s.rfind('>').ok_or(AddressError::Brackets)?;
            if end < start || !s[end + 1..].trim().is_empty() {
                return Err(AddressError::Brackets);
            }
            let name = s[..start].trim().trim_matches('"').trim();
            let email = s[start + 1..end].trim();
            Self::validate_email(email)?;
            return Ok(Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            });
        }

        Self::validate_email(s)?;
        Ok(Self {
            name: None,
            email: s.to_string(),
        })
    }

    fn validate_email(email: &str) -> Result<(), AddressError> {
        if email.is_empty() {
            return Err(AddressError::Empty);
        }
        if email.len() > 254 {
            return Err(AddressError::TooLong);
        }
        if email.chars().any(|c| c.is_control() || c.is_whitespace() || c == '<' || c == '>') {
            return Err(AddressError::Forbidden);
        }

        let (local, domain) = email.split_once('@').ok_or(AddressError::AtSign)?;
        if domain.contains('@') {
            return Err(AddressError::AtSign);
        }
        if local.is_empty() || local.len() > 64 {
            return Err(AddressError::LocalPart);
        }
        if domain.is_empty() || domain.split('.').any(str::is_empty) {
            return Err(AddressError::Domain);
        }
        Ok(())
    }

    /// Formats the address for email headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') => {
                format!("\"{}\" <{}>", name, self.email)
            }
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

/// File attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename shown to the recipient.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Creates an attachment with the content type guessed from the filename.
    pub fn from_file(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        Self::new(filename, content_type, data)
    }
}

/// Outbound message as supplied by calling code.
///
/// Addresses are kept as strings; [`crate::validation::MessageValidator`]
/// checks them before anything touches the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Sender, `addr` or `Name <addr>`.
    pub from: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients. Never written to headers.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// HTML body. Takes precedence over the plain body when non-empty.
    pub html_body: Option<String>,
    /// File attachments.
    pub attachments: Vec<Attachment>,
    /// Additional headers, emitted in name order.
    pub headers: BTreeMap<String, String>,
}

impl Message {
    /// Starts a message from the given sender.
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            ..Self::default()
        }
    }

    /// Adds a primary recipient.
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the HTML body.
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    /// Adds an attachment.
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// All envelope recipients in To, Cc, Bcc order.
    pub fn all_recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    /// Count of envelope recipients.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Non-empty HTML body, if any.
    pub fn html_content(&self) -> Option<&str> {
        self.html_body.as_deref().filter(|h| !h.is_empty())
    }
}

/// Mail provider the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Google Workspace / Gmail (`smtp.gmail.com`).
    Gmail,
    /// Microsoft 365 (`smtp.office365.com`).
    Office365,
    /// Any other server.
    #[default]
    Generic,
}

impl ProviderType {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::Gmail => "gmail",
            ProviderType::Office365 => "office365",
            ProviderType::Generic => "generic",
        }
    }

    /// Well-known submission host and port for hosted providers.
    pub fn default_endpoint(self) -> Option<(&'static str, u16)> {
        match self {
            ProviderType::Gmail => Some(("smtp.gmail.com", 587)),
            ProviderType::Office365 => Some(("smtp.office365.com", 587)),
            ProviderType::Generic => None,
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(ProviderType::Gmail),
            "office365" => Ok(ProviderType::Office365),
            "generic" => Ok(ProviderType::Generic),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Connection pool status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Live connections (idle + in use).
    pub total: usize,
    /// Idle connections.
    pub idle: usize,
    /// Connections lent to sends.
    pub in_use: usize,
    /// Callers waiting for a slot.
    pub pending: usize,
    /// Maximum pool size.
    pub max_size: usize,
    /// Whether the pool has been closed.
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("test@example.com").unwrap();
        assert_eq!(addr.email, "test@example.com");
        assert!(addr.name.is_none());

        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name.as_deref(), Some("John Doe"));

        let addr = Address::parse("\"Doe, John\" <john@example.com>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Doe, John"));
        assert_eq!(addr.to_header(), "\"Doe, John\" <john@example.com>");

        let addr = Address::parse("<bare@example.com>").unwrap();
        assert!(addr.name.is_none());
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::parse("test.name@sub.example.com").is_ok());

        assert_eq!(Address::parse("   "), Err(AddressError::Empty));
        assert_eq!(Address::parse("no-at-sign"), Err(AddressError::AtSign));
        assert_eq!(Address::parse("two@@signs.com"), Err(AddressError::AtSign));
        assert_eq!(Address::parse("@no-local.com"), Err(AddressError::LocalPart));
        assert_eq!(Address::parse("no-domain@"), Err(AddressError::Domain));
        assert_eq!(Address::parse("dots@example..com"), Err(AddressError::Domain));
        assert_eq!(Address::parse("sp ace@example.com"), Err(AddressError::Forbidden));
        assert_eq!(Address::parse("Name <open@example.com"), Err(AddressError::Brackets));
    }

    #[test]
    fn test_message_builder_methods() {
        let msg = Message::new("sender@example.com")
            .to("a@example.com")
            .cc("b@example.com")
            .bcc("c@example.com")
            .subject("Hi")
            .body("Hello")
            .header("X-Trace", "1");

        assert_eq!(msg.recipient_count(), 3);
        assert_eq!(
            msg.all_recipients().collect::<Vec<_>>(),
            vec!["a@example.com", "b@example.com", "c@example.com"]
        );
        assert_eq!(msg.headers.get("X-Trace").map(String::as_str), Some("1"));
        assert!(msg.html_content().is_none());
    }

    #[test]
    fn test_empty_html_is_ignored() {
        let msg = Message::new("a@example.com").html("");
        assert!(msg.html_content().is_none());
    }

    #[test]
    fn test_attachment_from_file() {
        let attachment = Attachment::from_file("report.pdf", vec![1, 2, 3]);
        assert_eq!(attachment.content_type, "application/pdf");

        let unknown = Attachment::from_file("blob.zzz-unknown", vec![1]);
        assert_eq!(unknown.content_type, "application/octet-stream");
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("Gmail".parse::<ProviderType>(), Ok(ProviderType::Gmail));
        assert_eq!("office365".parse::<ProviderType>(), Ok(ProviderType::Office365));
        assert!("yahoo".parse::<ProviderType>().is_err());
        assert_eq!(ProviderType::Gmail.default_endpoint(), Some(("smtp.gmail.com", 587)));
    }
}
