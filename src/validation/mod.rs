//! Pre-flight message checks.
//!
//! Validation runs before any network I/O. Failures are
//! [`ErrorKind::Validation`](crate::errors::ErrorKind::Validation) errors and
//! therefore never retried.

use crate::errors::{codes, MailError, MailResult};
use crate::types::{Address, Attachment, Message};

/// Checks that a [`Message`] can be built and delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageValidator;

impl MessageValidator {
    /// Creates a validator.
    pub fn new() -> Self {
        Self
    }

    /// Validates the message, returning the first problem found.
    ///
    /// Checks run in a fixed order: sender, To, Cc, Bcc, subject, content,
    /// custom headers, attachments.
    pub fn validate(&self, message: &Message, request_id: &str) -> MailResult<()> {
        self.validate_sender(&message.from, request_id)?;

        if message.to.is_empty() {
            return Err(invalid(
                codes::MISSING_RECIPIENTS,
                "at least one To recipient is required",
                request_id,
            ));
        }
        self.validate_address_list(&message.to, "To", request_id)?;
        self.validate_address_list(&message.cc, "Cc", request_id)?;
        self.validate_address_list(&message.bcc, "Bcc", request_id)?;

        self.validate_subject(&message.subject, request_id)?;

        let html_blank = message
            .html_body
            .as_deref()
            .map_or(true, |h| h.trim().is_empty());
        if message.body.trim().is_empty() && html_blank {
            return Err(invalid(
                codes::MISSING_CONTENT,
                "message needs a body or an HTML body",
                request_id,
            ));
        }

        for name in message.headers.keys() {
            if !is_header_name(name) {
                return Err(invalid(
                    codes::INVALID_HEADER_NAME,
                    format!("invalid header name '{}'", name.escape_debug()),
                    request_id,
                ));
            }
        }

        for (index, attachment) in message.attachments.iter().enumerate() {
            self.validate_attachment(attachment, index, request_id)?;
        }

        Ok(())
    }

    fn validate_sender(&self, from: &str, request_id: &str) -> MailResult<()> {
        if from.trim().is_empty() {
            return Err(invalid(codes::MISSING_SENDER, "From is required", request_id));
        }
        Address::parse(from).map_err(|e| {
            invalid(codes::INVALID_SENDER_FORMAT, "invalid From address", request_id).with_cause(e)
        })?;
        Ok(())
    }

    fn validate_address_list(&self, list: &[String], field: &str, request_id: &str) -> MailResult<()> {
        for (position, address) in list.iter().enumerate() {
            if address.trim().is_empty() {
                return Err(invalid(
                    codes::EMPTY_EMAIL,
                    format!("empty address at position {} of {}", position, field),
                    request_id,
                ));
            }
            Address::parse(address).map_err(|e| {
                invalid(
                    codes::INVALID_EMAIL_FORMAT,
                    format!("invalid address '{}' in {}", address, field),
                    request_id,
                )
                .with_cause(e)
            })?;
        }
        Ok(())
    }

    fn validate_subject(&self, subject: &str, request_id: &str) -> MailResult<()> {
        if subject.trim().is_empty() {
            return Err(invalid(codes::MISSING_SUBJECT, "Subject is required", request_id));
        }
        if subject.contains(['\r', '\n']) {
            return Err(invalid(
                codes::INVALID_SUBJECT_CHARS,
                "Subject must not contain CR or LF",
                request_id,
            ));
        }
        Ok(())
    }

    fn validate_attachment(&self, attachment: &Attachment, index: usize, request_id: &str) -> MailResult<()> {
        if attachment.filename.trim().is_empty() {
            return Err(invalid(
                codes::INVALID_ATTACHMENT_FILENAME,
                format!("attachment {} has no filename", index),
                request_id,
            ));
        }
        if attachment.content_type.trim().is_empty() {
            return Err(invalid(
                codes::INVALID_ATTACHMENT_CONTENT_TYPE,
                format!("attachment {} has no content type", index),
                request_id,
            ));
        }
        if attachment.data.is_empty() {
            return Err(invalid(
                codes::INVALID_ATTACHMENT_DATA,
                format!("attachment {} is empty", index),
                request_id,
            ));
        }
        Ok(())
    }
}

/// RFC 5322 field name: printable ASCII except colon.
fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

fn invalid(code: &'static str, message: impl Into<String>, request_id: &str) -> MailError {
    MailError::validation(code, message).with_request_id(request_id)
}
