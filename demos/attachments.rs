//! Attachments Example
//!
//! This example demonstrates how to:
//! - Attach files read from disk, guessing their content type
//! - Attach in-memory data with an explicit content type
//! - Send an HTML message with attachments as `multipart/mixed`
//!
//! Usage: `cargo run --example attachments -- report.pdf logo.png`

use integrations_mailer::{
    init_logging, Attachment, LoggingConfig, MailError, MailerConfig, Message, SendContext, SmtpClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // mailer.yaml plus SMTP_CLIENT_* overrides
    let config = MailerConfig::from_file("mailer.yaml")?;
    init_logging(&config.logging)?;

    println!("Creating SMTP client...");
    let client = SmtpClient::from_config(config)?;

    let text_body = r#"
Monthly Report

Please find attached the monthly report.

The report includes:
- Sales summary
- Performance metrics
- Regional breakdowns

Best regards,
Analytics Team
"#
    .trim();

    let html_body = r#"<!DOCTYPE html>
<html>
<body>
    <h1>Monthly Report</h1>
    <p>Please find attached the monthly report.</p>
    <ul>
        <li>Sales summary</li>
        <li>Performance metrics</li>
        <li>Regional breakdowns</li>
    </ul>
    <p>Best regards,<br>Analytics Team</p>
</body>
</html>"#;

    let mut message = Message::new("Analytics Team <analytics@example.com>")
        .to("Manager <manager@example.com>")
        .cc("team@example.com")
        .subject("Monthly Report")
        .body(text_body)
        .html(html_body)
        .header("X-Report-Type", "monthly");

    for path in std::env::args().skip(1) {
        let data = std::fs::read(&path)?;
        let filename = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let attachment = Attachment::from_file(filename, data);
        println!("  Attaching {} ({}, {} bytes)", attachment.filename, attachment.content_type, attachment.data.len());
        message = message.attach(attachment);
    }

    let summary = "region,sales\nnorth,1200\nsouth,950\n";
    message = message.attach(Attachment::new("summary.csv", "text/csv", summary.as_bytes().to_vec()));

    println!("Sending message with {} attachment(s)...", message.attachments.len());
    let result: Result<(), MailError> = client.send_message(&SendContext::background(), &message).await;
    client.close().await;

    match result {
        Ok(()) => println!("Message sent successfully!"),
        Err(e) => {
            eprintln!("Failed to send message: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}
