//! Authentication for SMTP sessions.
//!
//! Supports:
//! - XOAUTH2 with bearer tokens from a [`TokenManager`] (Gmail, Office 365)
//! - PLAIN (RFC 4616) with configured credentials
//! - Anonymous sessions (no AUTH exchange)
//!
//! [`AuthStrategy`] is chosen once from configuration; per send it yields a
//! [`SaslMechanism`] that the transport drives through `start_auth` /
//! `continue_auth`.
//!
//! Access tokens come from any [`TokenManager`]. [`OAuth2Provider`] with a
//! [`RefreshTokenSource`] covers the Google and Azure AD grants, keeping
//! tokens in a [`TokenStore`].

mod http;
mod oauth2;
mod store;

pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestHttpTransport};
pub use oauth2::{
    default_scopes, OAuth2Config, OAuth2Provider, ProviderEndpoints, RefreshTokenSource, TokenGrant,
    DEFAULT_TOKEN_TIMEOUT,
};
pub use store::{spawn_cleanup, InMemoryTokenStore, StoredToken, TokenStore, DEFAULT_MAX_AGE};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::config::TransportConfig;
use crate::context::SendContext;
use crate::errors::{codes, MailError, MailResult};
use crate::types::{Address, ProviderType};

/// Tokens expiring within this window are treated as expired.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// OAuth2 access token with optional expiry.
#[derive(Debug, Clone)]
pub struct OAuth2Token {
    /// Access token (protected).
    pub access_token: SecretString,
    /// Expiry instant, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuth2Token {
    /// Creates a token without expiry.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            expires_at: None,
        }
    }

    /// Sets the expiry instant.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the expiry relative to now.
    pub fn expires_in(self, lifetime: Duration) -> Self {
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::days(365));
        self.with_expires_at(Utc::now() + lifetime)
    }

    /// Returns true if the token is expired or expires within five minutes.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                expires_at <= Utc::now() + chrono::Duration::seconds(EXPIRY_BUFFER.as_secs() as i64)
            }
            None => false,
        }
    }
}

/// Supplies OAuth2 access tokens for XOAUTH2.
#[async_trait]
pub trait TokenManager: Send + Sync + fmt::Debug {
    /// Returns a token valid for at least the next few minutes.
    async fn get_token(&self, ctx: &SendContext, request_id: &str) -> MailResult<OAuth2Token>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenManager {
    token: OAuth2Token,
}

impl StaticTokenManager {
    /// Wraps a fixed access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            token: OAuth2Token::new(access_token),
        }
    }
}

#[async_trait]
impl TokenManager for StaticTokenManager {
    async fn get_token(&self, _ctx: &SendContext, _request_id: &str) -> MailResult<OAuth2Token> {
        Ok(self.token.clone())
    }
}

/// Fetches fresh tokens from an authorization server or token store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtains a new access token.
    async fn fetch_token(&self) -> MailResult<OAuth2Token>;
}

/// Caches the token from a [`TokenSource`] until it nears expiry.
pub struct CachingTokenManager<S> {
    source: S,
    provider: ProviderType,
    cached: Mutex<Option<OAuth2Token>>,
}

impl<S: TokenSource> CachingTokenManager<S> {
    /// Creates a manager for `provider` backed by `source`.
    pub fn new(provider: ProviderType, source: S) -> Self {
        Self {
            source,
            provider,
            cached: Mutex::new(None),
        }
    }

    /// Drops the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

impl<S> fmt::Debug for CachingTokenManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingTokenManager")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: TokenSource> TokenManager for CachingTokenManager<S> {
    async fn get_token(&self, ctx: &SendContext, request_id: &str) -> MailResult<OAuth2Token> {
        let fetch = async {
            let mut cached = self.cached.lock().await;
            if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
                return Ok(token.clone());
            }

            tracing::debug!(request_id, provider = %self.provider, "Refreshing OAuth2 token");
            let token = self.source.fetch_token().await?;
            *cached = Some(token.clone());
            Ok(token)
        };

        ctx.run(None, fetch)
            .await
            .map_err(|interrupted| MailError::from(interrupted).with_request_id(request_id))?
    }
}

/// One step of a SASL exchange after the server sent a 334 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send this base64 line.
    Respond(String),
    /// Cancel the exchange (`*`) for the given reason.
    Abort(String),
}

/// Mechanism used for one session's AUTH exchange.
#[derive(Debug, Clone)]
pub enum SaslMechanism {
    /// XOAUTH2 with a bearer token.
    OAuth2 {
        /// Mailbox the token was issued for.
        user: String,
        /// Access token (protected).
        token: SecretString,
    },
    /// PLAIN with username and password.
    Plain {
        /// Username.
        username: String,
        /// Password (protected).
        password: SecretString,
    },
    /// No authentication.
    Anonymous,
}

impl SaslMechanism {
    /// SMTP AUTH mechanism name; `None` when no exchange takes place.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            SaslMechanism::OAuth2 { .. } => Some("XOAUTH2"),
            SaslMechanism::Plain { .. } => Some("PLAIN"),
            SaslMechanism::Anonymous => None,
        }
    }

    /// Identity being authenticated.
    pub fn identity(&self) -> Option<&str> {
        match self {
            SaslMechanism::OAuth2 { user, .. } => Some(user),
            SaslMechanism::Plain { username, .. } => Some(username),
            SaslMechanism::Anonymous => None,
        }
    }

    /// Mechanism name and base64 initial response for `AUTH`, or `None` to
    /// skip authentication.
    pub fn start_auth(&self) -> Option<(&'static str, String)> {
        let name = self.name()?;
        Some((name, self.initial_response()))
    }

    /// Answers a 334 challenge (base64 text after the code).
    ///
    /// An empty challenge asks for the initial response again. XOAUTH2
    /// servers put a base64 JSON error in a non-empty challenge; the
    /// exchange is then aborted with that error as the reason.
    pub fn continue_auth(&self, challenge: &str) -> SaslStep {
        let challenge = challenge.trim();
        match self {
            SaslMechanism::Anonymous => SaslStep::Abort("no authentication configured".to_string()),
            _ if challenge.is_empty() => SaslStep::Respond(self.initial_response()),
            SaslMechanism::OAuth2 { .. } => {
                let detail = BASE64
                    .decode(challenge)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .unwrap_or_else(|| challenge.to_string());
                SaslStep::Abort(format!("XOAUTH2 rejected: {}", detail))
            }
            SaslMechanism::Plain { .. } => {
                SaslStep::Abort("unexpected PLAIN challenge".to_string())
            }
        }
    }

    fn initial_response(&self) -> String {
        match self {
            SaslMechanism::OAuth2 { user, token } => BASE64.encode(format!(
                "user={}\x01auth=Bearer {}\x01\x01",
                user,
                token.expose_secret()
            )),
            SaslMechanism::Plain { username, password } => {
                BASE64.encode(format!("\0{}\0{}", username, password.expose_secret()))
            }
            SaslMechanism::Anonymous => String::new(),
        }
    }
}

/// How a client authenticates, chosen from configuration.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// XOAUTH2 with tokens from the manager.
    OAuth2(Arc<dyn TokenManager>),
    /// PLAIN with fixed credentials.
    Plain {
        /// Username.
        username: String,
        /// Password (protected).
        password: SecretString,
    },
    /// No authentication.
    Anonymous,
}

impl AuthStrategy {
    /// A token manager wins over credentials; neither means anonymous.
    pub fn from_config(transport: &TransportConfig, token_manager: Option<Arc<dyn TokenManager>>) -> Self {
        if let Some(manager) = token_manager {
            return AuthStrategy::OAuth2(manager);
        }
        match (&transport.username, &transport.password) {
            (Some(username), Some(password)) => AuthStrategy::Plain {
                username: username.clone(),
                password: password.clone(),
            },
            _ => AuthStrategy::Anonymous,
        }
    }

    /// Short name for logs and stats.
    pub fn name(&self) -> &'static str {
        match self {
            AuthStrategy::OAuth2(_) => "oauth2",
            AuthStrategy::Plain { .. } => "plain",
            AuthStrategy::Anonymous => "anonymous",
        }
    }

    /// Error code reported when the handshake fails.
    pub fn failure_code(&self) -> &'static str {
        match self {
            AuthStrategy::OAuth2(_) => codes::OAUTH2_AUTH_FAILED,
            _ => codes::BASIC_AUTH_FAILED,
        }
    }

    /// Token manager, when OAuth2 is configured.
    pub fn token_manager(&self) -> Option<&Arc<dyn TokenManager>> {
        match self {
            AuthStrategy::OAuth2(manager) => Some(manager),
            _ => None,
        }
    }

    /// Identity a session must be authenticated as to carry mail from
    /// `from`: the bare sender for OAuth2, the username for PLAIN, nothing
    /// when anonymous.
    pub fn identity_for(&self, from: &str) -> Option<String> {
        match self {
            AuthStrategy::OAuth2(_) => Some(bare_address(from)),
            AuthStrategy::Plain { username, .. } => Some(username.clone()),
            AuthStrategy::Anonymous => None,
        }
    }

    /// Resolves the mechanism for a send from `from`, fetching a token when
    /// OAuth2 is configured.
    ///
    /// Token failures are `authentication` errors with code
    /// `TOKEN_RETRIEVAL_FAILED`.
    pub async fn mechanism(&self, ctx: &SendContext, from: &str, request_id: &str) -> MailResult<SaslMechanism> {
        match self {
            AuthStrategy::OAuth2(manager) => {
                let token = manager.get_token(ctx, request_id).await.map_err(|e| {
                    MailError::authentication(codes::TOKEN_RETRIEVAL_FAILED, "failed to obtain OAuth2 token")
                        .with_request_id(request_id)
                        .with_cause(e)
                })?;
                Ok(SaslMechanism::OAuth2 {
                    user: bare_address(from),
                    token: token.access_token,
                })
            }
            AuthStrategy::Plain { username, password } => Ok(SaslMechanism::Plain {
                username: username.clone(),
                password: password.clone(),
            }),
            AuthStrategy::Anonymous => Ok(SaslMechanism::Anonymous),
        }
    }
}

fn bare_address(from: &str) -> String {
    Address::parse(from)
        .map(|a| a.email)
        .unwrap_or_else(|_| from.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn decode(s: &str) -> String {
        String::from_utf8(BASE64.decode(s).unwrap()).unwrap()
    }

    #[test]
    fn test_xoauth2_initial_response() {
        let mech = SaslMechanism::OAuth2 {
            user: "user@example.com".into(),
            token: SecretString::new("test_token".into()),
        };
        let (name, response) = mech.start_auth().unwrap();
        assert_eq!(name, "XOAUTH2");
        assert_eq!(decode(&response), "user=user@example.com\x01auth=Bearer test_token\x01\x01");
    }

    #[test]
    fn test_plain_initial_response() {
        let mech = SaslMechanism::Plain {
            username: "user".into(),
            password: SecretString::new("password".into()),
        };
        let (name, response) = mech.start_auth().unwrap();
        assert_eq!(name, "PLAIN");
        assert_eq!(BASE64.decode(response).unwrap(), b"\0user\0password");
    }

    #[test]
    fn test_anonymous_skips() {
        assert!(SaslMechanism::Anonymous.start_auth().is_none());
        assert!(matches!(SaslMechanism::Anonymous.continue_auth(""), SaslStep::Abort(_)));
    }

    #[test]
    fn test_xoauth2_error_challenge_aborts() {
        let mech = SaslMechanism::OAuth2 {
            user: "u@example.com".into(),
            token: SecretString::new("t".into()),
        };
        let challenge = BASE64.encode(r#"{"status":"401"}"#);
        match mech.continue_auth(&challenge) {
            SaslStep::Abort(reason) => assert!(reason.contains("401")),
            other => panic!("unexpected step: {:?}", other),
        }
        assert!(matches!(mech.continue_auth(""), SaslStep::Respond(_)));
    }

    #[test]
    fn test_mechanism_debug_redacts_secret() {
        let mech = SaslMechanism::Plain {
            username: "user".into(),
            password: SecretString::new("secret_password".into()),
        };
        assert!(!format!("{:?}", mech).contains("secret_password"));
    }

    #[test]
    fn test_token_expiry() {
        assert!(OAuth2Token::new("t").with_expires_at(Utc::now()).is_expired());
        assert!(OAuth2Token::new("t").expires_in(Duration::from_secs(60)).is_expired());
        assert!(!OAuth2Token::new("t").expires_in(Duration::from_secs(3600)).is_expired());
        assert!(!OAuth2Token::new("t").is_expired());
    }

    #[test]
    fn test_strategy_selection() {
        let anonymous = TransportConfig::builder().host("h").build().unwrap();
        assert_eq!(AuthStrategy::from_config(&anonymous, None).name(), "anonymous");

        let plain = TransportConfig::builder().host("h").credentials("u", "p").build().unwrap();
        assert_eq!(AuthStrategy::from_config(&plain, None).name(), "plain");

        let manager: Arc<dyn TokenManager> = Arc::new(StaticTokenManager::new("tok"));
        let strategy = AuthStrategy::from_config(&plain, Some(manager));
        assert_eq!(strategy.name(), "oauth2");
        assert_eq!(strategy.failure_code(), codes::OAUTH2_AUTH_FAILED);
    }

    #[tokio::test]
    async fn test_oauth2_mechanism_uses_bare_sender() {
        let strategy = AuthStrategy::OAuth2(Arc::new(StaticTokenManager::new("tok")));
        let mech = strategy
            .mechanism(&SendContext::background(), "Sender <s@example.com>", "req")
            .await
            .unwrap();
        assert_eq!(mech.identity(), Some("s@example.com"));
    }

    #[test]
    fn test_identity_follows_strategy() {
        let oauth = AuthStrategy::OAuth2(Arc::new(StaticTokenManager::new("tok")));
        assert_eq!(oauth.identity_for("Alice <alice@a.com>").as_deref(), Some("alice@a.com"));

        let plain = AuthStrategy::Plain {
            username: "relay".into(),
            password: SecretString::new("pw".into()),
        };
        assert_eq!(plain.identity_for("alice@a.com").as_deref(), Some("relay"));
        assert_eq!(AuthStrategy::Anonymous.identity_for("alice@a.com"), None);
    }

    #[tokio::test]
    async fn test_caching_manager_fetches_once() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch_token()
            .times(1)
            .returning(|| Ok(OAuth2Token::new("fresh").expires_in(Duration::from_secs(3600))));

        let manager = CachingTokenManager::new(ProviderType::Gmail, source);
        let ctx = SendContext::background();
        for _ in 0..3 {
            let token = manager.get_token(&ctx, "req").await.unwrap();
            assert_eq!(token.access_token.expose_secret(), "fresh");
        }
    }

    #[tokio::test]
    async fn test_caching_manager_refreshes_expired() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch_token()
            .times(2)
            .returning(|| Ok(OAuth2Token::new("short").expires_in(Duration::from_secs(10))));

        let manager = CachingTokenManager::new(ProviderType::Office365, source);
        let ctx = SendContext::background();
        manager.get_token(&ctx, "req").await.unwrap();
        manager.get_token(&ctx, "req").await.unwrap();
    }

    #[tokio::test]
    async fn test_token_failure_maps_to_authentication() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch_token()
            .returning(|| Err(MailError::connection(codes::DIAL_FAILED, "idp down")));

        let strategy = AuthStrategy::OAuth2(Arc::new(CachingTokenManager::new(ProviderType::Gmail, source)));
        let err = strategy
            .mechanism(&SendContext::background(), "s@example.com", "req-7")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.code(), codes::TOKEN_RETRIEVAL_FAILED);
        assert_eq!(err.request_id(), Some("req-7"));
    }
}
