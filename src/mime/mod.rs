//! RFC 822 / MIME message construction.
//!
//! [`MessageBuilder`] turns a validated [`Message`] into the text handed to
//! `DATA`:
//! - Subject and display names encoded per RFC 2047 (Q encoding, UTF-8)
//! - Single-part `text/plain` or `text/html`, or `multipart/mixed` when
//!   attachments are present
//! - Base64 attachment bodies wrapped at 76 columns
//! - CRLF line endings throughout

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::MailResult;
use crate::types::{Address, Attachment, Message};
use crate::validation::MessageValidator;

/// Maximum length of a base64 body line.
pub const BASE64_LINE_LEN: usize = 76;

/// Maximum length of one RFC 2047 encoded word.
const MAX_ENCODED_WORD_LEN: usize = 75;
const ENCODED_WORD_PREFIX: &str = "=?utf-8?q?";
const ENCODED_WORD_SUFFIX: &str = "?=";

/// Builds RFC 822 documents from [`Message`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageBuilder {
    validator: MessageValidator,
}

impl MessageBuilder {
    /// Creates a builder.
    pub fn new() -> Self {
        Self {
            validator: MessageValidator::new(),
        }
    }

    /// Validates and renders the message, stamped with the current time.
    pub fn build(&self, message: &Message, request_id: &str) -> MailResult<String> {
        self.build_at(message, request_id, Utc::now())
    }

    /// Validates and renders the message with an explicit `Date`.
    pub fn build_at(&self, message: &Message, request_id: &str, now: DateTime<Utc>) -> MailResult<String> {
        self.validator.validate(message, request_id)?;

        let mut out = String::with_capacity(estimate_size(message));

        write_header(&mut out, "From", &format_address_list(std::iter::once(message.from.as_str())));
        write_header(&mut out, "To", &format_address_list(message.to.iter().map(String::as_str)));
        if !message.cc.is_empty() {
            write_header(&mut out, "Cc", &format_address_list(message.cc.iter().map(String::as_str)));
        }
        write_header(&mut out, "Subject", &encode_header(&message.subject));
        write_header(&mut out, "Date", &format_date(now));
        write_header(&mut out, "MIME-Version", "1.0");

        for (name, value) in &message.headers {
            write_header(&mut out, name, &sanitize_header_value(value));
        }

        if message.attachments.is_empty() {
            write_text_part(&mut out, message);
        } else {
            let boundary = generate_boundary(now);
            write_header(
                &mut out,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{}\"", boundary),
            );
            out.push_str("\r\n");

            out.push_str(&format!("--{}\r\n", boundary));
            write_text_part(&mut out, message);
            out.push_str("\r\n");

            for attachment in &message.attachments {
                out.push_str(&format!("--{}\r\n", boundary));
                write_attachment(&mut out, attachment);
            }

            out.push_str(&format!("--{}--\r\n", boundary));
        }

        Ok(out)
    }
}

fn estimate_size(message: &Message) -> usize {
    let attachments: usize = message
        .attachments
        .iter()
        .map(|a| a.data.len() * 4 / 3 + a.data.len() / 57 * 2 + 256)
        .sum();
    1024 + message.body.len() + message.html_body.as_ref().map_or(0, String::len) + attachments
}

/// Writes the content headers, blank line, and body of the text part.
fn write_text_part(out: &mut String, message: &Message) {
    let (content_type, body) = match message.html_content() {
        Some(html) => ("text/html; charset=utf-8", html),
        None => ("text/plain; charset=utf-8", message.body.as_str()),
    };
    write_header(out, "Content-Type", content_type);
    out.push_str("\r\n");
    out.push_str(&normalize_line_endings(body));
}

fn write_attachment(out: &mut String, attachment: &Attachment) {
    write_header(out, "Content-Type", &sanitize_header_value(&attachment.content_type));
    write_header(
        out,
        "Content-Disposition",
        &format!("attachment; filename=\"{}\"", quote_param(&attachment.filename)),
    );
    write_header(out, "Content-Transfer-Encoding", "base64");
    out.push_str("\r\n");

    let encoded = BASE64.encode(&attachment.data);
    for line in encoded.as_bytes().chunks(BASE64_LINE_LEN) {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push_str("\r\n");
    }
}

fn write_header(out: &mut String, name: &str, value: &str) {
    out.push_str(&fold_header(&format!("{}: {}", name, value)));
    out.push_str("\r\n");
}

/// Folds a header line at whitespace so lines stay within 78 characters
/// where possible.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::with_capacity(header.len() + 16);
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line.push_str(word);
        } else if current_line.len() + 1 + word.len() <= 76 {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

/// Strips CR and LF so a value cannot start a new header.
fn sanitize_header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

fn quote_param(value: &str) -> String {
    let clean = sanitize_header_value(value);
    if needs_encoding(&clean) {
        return encode_header(&clean);
    }
    clean.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Re-renders addresses so display names are safely encoded.
fn format_address_list<'a>(addresses: impl Iterator<Item = &'a str>) -> String {
    addresses
        .map(|raw| match Address::parse(raw) {
            Ok(Address { name: Some(name), email }) if needs_encoding(&name) => {
                format!("{} <{}>", encode_header(&name), email)
            }
            Ok(address) => address.to_header(),
            Err(_) => sanitize_header_value(raw.trim()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// RFC 1123 date with numeric zone.
pub fn format_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

/// Multipart boundary: wall clock in nanoseconds plus a random suffix.
pub fn generate_boundary(now: DateTime<Utc>) -> String {
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("boundary_{}_{}", nanos, &suffix[..16])
}

fn needs_encoding(value: &str) -> bool {
    value.bytes().any(|b| (b < b' ' || b > b'~') && b != b'\t')
}

/// RFC 2047 Q encoding. Printable ASCII passes through unchanged; anything
/// else becomes one or more `=?utf-8?q?...?=` words of at most 75 characters,
/// split on character boundaries.
pub fn encode_header(value: &str) -> String {
    if !needs_encoding(value) {
        return value.to_string();
    }

    let max_payload = MAX_ENCODED_WORD_LEN - ENCODED_WORD_PREFIX.len() - ENCODED_WORD_SUFFIX.len();
    let mut words = Vec::new();
    let mut current = String::new();
    let mut buf = [0u8; 4];

    for c in value.chars() {
        let mut piece = String::new();
        for &b in c.encode_utf8(&mut buf).as_bytes() {
            match b {
                b' ' => piece.push('_'),
                b'!'..=b'~' if b != b'=' && b != b'?' && b != b'_' => piece.push(b as char),
                _ => piece.push_str(&format!("={:02X}", b)),
            }
        }
        if !current.is_empty() && current.len() + piece.len() > max_payload {
            words.push(std::mem::take(&mut current));
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|w| format!("{}{}{}", ENCODED_WORD_PREFIX, w, ENCODED_WORD_SUFFIX))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Converts bare LF and bare CR to CRLF.
fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    fn sample() -> Message {
        Message::new("sender@test.com")
            .to("r@test.com")
            .subject("Test Subject")
            .body("Test Body")
    }

    #[test]
    fn test_simple_message_layout() {
        let out = MessageBuilder::new()
            .build_at(&sample(), "req", fixed_time())
            .unwrap();

        assert_eq!(
            out,
            "From: sender@test.com\r\n\
             To: r@test.com\r\n\
             Subject: Test Subject\r\n\
             Date: Tue, 05 Mar 2024 14:07:09 +0000\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             Test Body"
        );
    }

    #[test]
    fn test_html_takes_precedence() {
        let msg = sample().html("<b>hi</b>");
        let out = MessageBuilder::new().build(&msg, "req").unwrap();
        assert!(out.contains("Content-Type: text/html; charset=utf-8\r\n\r\n<b>hi</b>"));
        assert!(!out.contains("Test Body"));
    }

    #[test]
    fn test_cc_written_bcc_hidden() {
        let msg = sample().cc("c1@test.com").cc("c2@test.com").bcc("hidden@test.com");
        let out = MessageBuilder::new().build(&msg, "req").unwrap();
        assert!(out.contains("Cc: c1@test.com, c2@test.com\r\n"));
        assert!(!out.contains("hidden@test.com"));
    }

    #[test]
    fn test_custom_headers_sanitized() {
        let msg = sample().header("X-Campaign", "spring\r\nBcc: evil@test.com");
        let out = MessageBuilder::new().build(&msg, "req").unwrap();
        assert!(out.contains("X-Campaign: springBcc: evil@test.com\r\n"));
        assert!(!out.contains("\r\nBcc:"));
    }

    #[test]
    fn test_validation_runs_first() {
        let err = MessageBuilder::new()
            .build(&Message::default(), "req-9")
            .unwrap_err();
        assert_eq!(err.code(), crate::errors::codes::MISSING_SENDER);
    }

    #[test]
    fn test_encode_header_ascii_passthrough() {
        assert_eq!(encode_header("Hello World"), "Hello World");
    }

    #[test]
    fn test_encode_header_q_encoding() {
        assert_eq!(encode_header("Héllo"), "=?utf-8?q?H=C3=A9llo?=");
        assert_eq!(encode_header("a b_c?é"), "=?utf-8?q?a_b=5Fc=3F=C3=A9?=");
    }

    #[test]
    fn test_encode_header_splits_long_values() {
        let subject = "é".repeat(40);
        let encoded = encode_header(&subject);
        let words: Vec<&str> = encoded.split(' ').collect();
        assert!(words.len() > 1);
        for word in words {
            assert!(word.len() <= MAX_ENCODED_WORD_LEN, "{}", word);
            assert!(word.starts_with(ENCODED_WORD_PREFIX));
        }
    }

    #[test]
    fn test_display_name_encoded() {
        let msg = Message::new("José <jose@test.com>")
            .to("r@test.com")
            .subject("s")
            .body("b");
        let out = MessageBuilder::new().build(&msg, "req").unwrap();
        assert!(out.contains("From: =?utf-8?q?Jos=C3=A9?= <jose@test.com>\r\n"));
    }

    #[test]
    fn test_multipart_structure() {
        let msg = sample()
            .attach(Attachment::new("a.bin", "application/octet-stream", vec![7u8; 200]))
            .attach(Attachment::new("b.txt", "text/plain", b"hello".to_vec()));
        let out = MessageBuilder::new().build(&msg, "req").unwrap();

        let boundary = out
            .split("boundary=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap()
            .to_string();
        assert!(boundary.starts_with("boundary_"));

        let delimiter = format!("--{}\r\n", boundary);
        assert_eq!(out.matches(&delimiter).count(), 3);
        assert!(out.ends_with(&format!("--{}--\r\n", boundary)));
        assert!(out.contains("Content-Disposition: attachment; filename=\"b.txt\"\r\n"));
        assert!(out.contains("Content-Transfer-Encoding: base64\r\n\r\naGVsbG8=\r\n"));
    }

    #[test]
    fn test_base64_lines_wrapped() {
        let msg = sample().attach(Attachment::new("big.bin", "application/octet-stream", vec![0xAB; 1000]));
        let out = MessageBuilder::new().build(&msg, "req").unwrap();

        let body = out.split("Content-Transfer-Encoding: base64\r\n\r\n").nth(1).unwrap();
        let lines: Vec<&str> = body.split("\r\n").take_while(|l| !l.starts_with("--")).collect();
        let (last, full) = lines.split_last().unwrap();
        assert!(full.iter().all(|l| l.len() == BASE64_LINE_LEN));
        assert!(last.len() <= BASE64_LINE_LEN);
    }

    #[test]
    fn test_boundaries_differ() {
        let now = fixed_time();
        assert_ne!(generate_boundary(now), generate_boundary(now));
    }

    #[test]
    fn test_filename_quoting() {
        assert_eq!(quote_param("we\"ird.txt"), "we\\\"ird.txt");
        assert_eq!(quote_param("a\r\nb.txt"), "ab.txt");
    }

    #[test]
    fn test_line_endings_normalized() {
        assert_eq!(normalize_line_endings("a\nb\r\nc\rd"), "a\r\nb\r\nc\r\nd");
    }

    #[test]
    fn test_fold_long_header() {
        let value = vec!["recipient@example.com"; 8].join(", ");
        let folded = fold_header(&format!("To: {}", value));
        assert!(folded.contains("\r\n "));
        assert!(folded.split("\r\n").all(|l| l.len() <= 78));
    }
}
