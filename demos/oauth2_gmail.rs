//! Gmail OAuth2 Example
//!
//! This example demonstrates how to:
//! - Register an OAuth2 client for Gmail
//! - Renew access tokens with a stored refresh token
//! - Connect to Gmail's submission endpoint
//!
//! Reads `GMAIL_CLIENT_ID`, `GMAIL_CLIENT_SECRET` and `GMAIL_REFRESH_TOKEN`.
//! Without a refresh token it prints the consent URL; pass the returned
//! code in `GMAIL_AUTH_CODE` to complete the authorization.

use std::sync::Arc;
use std::time::Duration;

use integrations_mailer::auth::ReqwestHttpTransport;
use integrations_mailer::{
    init_logging, InMemoryTokenStore, LoggingConfig, MailError, Message, OAuth2Config, OAuth2Provider,
    ProviderType, RefreshTokenSource, SendContext, SmtpClient, StoredToken, TokenStore, TransportConfig,
};

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> Result<(), MailError> {
    init_logging(&LoggingConfig::default())?;

    let user_email = env("GMAIL_USER").unwrap_or_else(|| "your-email@gmail.com".to_string());
    let (host, port) = ProviderType::Gmail.default_endpoint().unwrap_or(("smtp.gmail.com", 587));

    let transport = TransportConfig::builder()
        .host(host)
        .port(port)
        .provider(ProviderType::Gmail)
        .timeout(Duration::from_secs(30))
        .build()?;

    let config = OAuth2Config::new(
        ProviderType::Gmail,
        env("GMAIL_CLIENT_ID").unwrap_or_default(),
        env("GMAIL_CLIENT_SECRET").unwrap_or_default(),
        "http://localhost:8080/callback",
    );
    let provider = Arc::new(OAuth2Provider::new(config, Arc::new(ReqwestHttpTransport::new()?))?);
    let store = Arc::new(InMemoryTokenStore::new());
    let source = RefreshTokenSource::new(provider.clone(), store.clone(), user_email.clone());

    let ctx = SendContext::background().with_timeout(Duration::from_secs(60));
    match (env("GMAIL_REFRESH_TOKEN"), env("GMAIL_AUTH_CODE")) {
        (Some(refresh_token), _) => {
            store.store(&user_email, StoredToken::refreshable(refresh_token)).await?;
        }
        (None, Some(code)) => {
            source.complete_authorization(&ctx, &code, "authorize").await?;
        }
        (None, None) => {
            println!("Authorize this application, then rerun with GMAIL_AUTH_CODE set:");
            println!("{}", provider.authorization_url("demo"));
            return Ok(());
        }
    }
    let tokens = source.into_manager();

    println!("Creating Gmail client with OAuth2...");
    let client = SmtpClient::builder()
        .transport(transport)
        .token_manager(Arc::new(tokens))
        .build()?;

    client.health_check(&ctx).await?;

    let message = Message::new(format!("Your Name <{}>", user_email))
        .to("recipient@example.com")
        .subject("Test message via Gmail OAuth2")
        .body("This message was sent through Gmail with XOAUTH2.")
        .html(
            r#"<!DOCTYPE html>
<html>
<body>
    <h2>OAuth2 Authentication Success!</h2>
    <p>This message was sent through Gmail with XOAUTH2.</p>
</body>
</html>"#,
        );

    println!("Sending message via Gmail...");
    let result = client.send_message(&ctx, &message).await;
    client.close().await;

    match result {
        Ok(()) => {
            println!("Message sent successfully via Gmail!");
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to send message: {}", e);
            Err(e)
        }
    }
}
