//! Basic Send Example
//!
//! This example demonstrates how to:
//! - Configure the transport with the builder pattern
//! - Send a plain text message
//! - Inspect client stats and metrics afterwards
//!
//! Server settings come from `SMTP_CLIENT_HOST`, `SMTP_CLIENT_USERNAME` and
//! `SMTP_CLIENT_PASSWORD`.

use integrations_mailer::{init_logging, LoggingConfig, MailError, Message, SendContext, SmtpClient, TransportConfig};

#[tokio::main]
async fn main() -> Result<(), MailError> {
    init_logging(&LoggingConfig::default())?;

    let host = std::env::var("SMTP_CLIENT_HOST").unwrap_or_else(|_| "smtp.example.com".to_string());
    let mut transport = TransportConfig::builder().host(host).port(587);
    if let (Ok(user), Ok(pass)) = (std::env::var("SMTP_CLIENT_USERNAME"), std::env::var("SMTP_CLIENT_PASSWORD")) {
        transport = transport.credentials(user, pass);
    }

    println!("Creating SMTP client...");
    let client = SmtpClient::builder().transport(transport.build()?).build()?;

    let message = Message::new("Sender Name <sender@example.com>")
        .to("Recipient Name <recipient@example.com>")
        .subject("Hello from Rust!")
        .body("This is a plain text message.\n\nBest regards,\nThe Mail Bot");

    println!("Sending message...");
    println!("  From: {}", message.from);
    println!("  To: {}", message.to.join(", "));
    println!("  Subject: {}", message.subject);

    let ctx = SendContext::background();
    match client.send_message(&ctx, &message).await {
        Ok(()) => println!("Message sent successfully!"),
        Err(e) => {
            eprintln!("Failed to send message: {}", e);
            client.close().await;
            return Err(e);
        }
    }

    let stats = client.stats();
    println!("Pool: {} total, {} idle", stats.pool.total, stats.pool.idle);
    if let Some(metrics) = client.metrics() {
        println!("Average send time: {:.1} ms", metrics.average_send_ms);
    }

    client.close().await;
    Ok(())
}
