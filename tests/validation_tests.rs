use rstest::rstest;

use integrations_mailer::errors::codes;
use integrations_mailer::{Attachment, Message, MessageValidator};

fn valid() -> Message {
    Message::new("sender@example.com")
        .to("recipient@example.com")
        .subject("Subject")
        .body("Body")
}

#[rstest]
#[case::missing_sender(Message { from: String::new(), ..valid() }, codes::MISSING_SENDER)]
#[case::bad_sender(Message { from: "sender.example.com".into(), ..valid() }, codes::INVALID_SENDER_FORMAT)]
#[case::no_recipients(Message { to: vec![], ..valid() }, codes::MISSING_RECIPIENTS)]
#[case::blank_to(valid().to("   "), codes::EMPTY_EMAIL)]
#[case::bad_cc(valid().cc("nobody"), codes::INVALID_EMAIL_FORMAT)]
#[case::bad_bcc(valid().bcc("@example.com"), codes::INVALID_EMAIL_FORMAT)]
#[case::blank_subject(valid().subject("  "), codes::MISSING_SUBJECT)]
#[case::injected_subject(valid().subject("Hi\r\nBcc: x@example.com"), codes::INVALID_SUBJECT_CHARS)]
#[case::no_content(valid().body(""), codes::MISSING_CONTENT)]
#[case::bad_header(valid().header("X Bad", "v"), codes::INVALID_HEADER_NAME)]
#[case::unnamed_attachment(valid().attach(Attachment::new("", "text/plain", b"x".to_vec())), codes::INVALID_ATTACHMENT_FILENAME)]
#[case::untyped_attachment(valid().attach(Attachment::new("a.txt", "", b"x".to_vec())), codes::INVALID_ATTACHMENT_CONTENT_TYPE)]
#[case::empty_attachment(valid().attach(Attachment::new("a.txt", "text/plain", vec![])), codes::INVALID_ATTACHMENT_DATA)]
fn test_rejected(#[case] message: Message, #[case] code: &str) {
    let err = MessageValidator::new().validate(&message, "req").unwrap_err();
    assert_eq!(err.code(), code);
    assert!(!err.is_retryable());
}

#[rstest]
#[case::plain(valid())]
#[case::display_names(valid().to("Someone <someone@example.com>").cc("\"Doe, Jane\" <jane@example.com>"))]
#[case::html_only(valid().body("").html("<p>hi</p>"))]
#[case::with_attachment(valid().attach(Attachment::new("a.bin", "application/octet-stream", vec![0u8; 16])))]
#[case::custom_header(valid().header("X-Campaign-Id", "spring"))]
fn test_accepted(#[case] message: Message) {
    assert!(MessageValidator::new().validate(&message, "req").is_ok());
}

#[test]
fn test_first_failure_wins() {
    let message = Message::new("").subject("");
    let err = MessageValidator::new().validate(&message, "req").unwrap_err();
    assert_eq!(err.code(), codes::MISSING_SENDER);
}
