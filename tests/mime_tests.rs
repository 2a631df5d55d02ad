//! Built documents parsed back with an independent MIME parser.

use chrono::TimeZone;
use mail_parser::{MessageParser, MimeHeaders};

use integrations_mailer::{Attachment, Message, MessageBuilder};

fn parse(raw: &str) -> mail_parser::Message<'_> {
    MessageParser::default().parse(raw.as_bytes()).unwrap()
}

#[test]
fn test_attachments_parse_back() {
    let message = Message::new("Sender Name <sender@example.com>")
        .to("a@example.com")
        .to("B <b@example.com>")
        .cc("c@example.com")
        .bcc("hidden@example.com")
        .subject("Quarterly report")
        .body("See attached.")
        .attach(Attachment::new("report.pdf", "application/pdf", vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff]))
        .attach(Attachment::new("notes.txt", "text/plain", b"line one\nline two".to_vec()));

    let raw = MessageBuilder::new().build(&message, "req-1").unwrap();
    let parsed = parse(&raw);

    assert_eq!(parsed.subject(), Some("Quarterly report"));
    assert_eq!(parsed.body_text(0).as_deref().map(str::trim), Some("See attached."));

    let attachments: Vec<_> = parsed.attachments().collect();
    assert_eq!(attachments.len(), 2);
    assert_eq!(attachments[0].attachment_name(), Some("report.pdf"));
    assert_eq!(attachments[0].contents(), &[0x25, 0x50, 0x44, 0x46, 0x00, 0xff]);
    assert_eq!(attachments[1].attachment_name(), Some("notes.txt"));
    assert_eq!(attachments[1].contents(), b"line one\nline two");

    // body part plus one part per attachment, under the multipart root
    assert_eq!(parsed.parts.len(), 1 + 1 + 2);

    let to: Vec<_> = parsed
        .to()
        .unwrap()
        .iter()
        .filter_map(|a| a.address())
        .collect();
    assert_eq!(to, vec!["a@example.com", "b@example.com"]);
    assert!(!raw.contains("hidden@example.com"));
}

#[test]
fn test_non_ascii_subject_round_trips() {
    let message = Message::new("Jürgen Müller <j@example.com>")
        .to("r@example.com")
        .subject("Grüße aus München, schöne Woche!")
        .body("Hallo");

    let raw = MessageBuilder::new().build(&message, "req-2").unwrap();
    assert!(raw.is_ascii());

    let parsed = parse(&raw);
    assert_eq!(parsed.subject(), Some("Grüße aus München, schöne Woche!"));
    let from = parsed.from().and_then(|f| f.first()).unwrap();
    assert_eq!(from.name(), Some("Jürgen Müller"));
    assert_eq!(from.address(), Some("j@example.com"));
}

#[test]
fn test_html_preferred_over_plain_body() {
    let message = Message::new("s@example.com")
        .to("r@example.com")
        .subject("Newsletter")
        .body("plain fallback")
        .html("<h1>Hello</h1>");

    let raw = MessageBuilder::new().build(&message, "req-3").unwrap();
    let parsed = parse(&raw);
    assert_eq!(parsed.body_html(0).as_deref(), Some("<h1>Hello</h1>"));
    assert!(!raw.contains("plain fallback"));
}

#[test]
fn test_date_header_is_stamped() {
    let now = chrono::Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap();
    let message = Message::new("s@example.com")
        .to("r@example.com")
        .subject("Dated")
        .body("x");

    let raw = MessageBuilder::new().build_at(&message, "req-4", now).unwrap();
    let parsed = parse(&raw);
    let date = parsed.date().unwrap();
    assert_eq!((date.year, date.month, date.day), (2024, 3, 5));
    assert_eq!((date.hour, date.minute), (14, 30));
}
