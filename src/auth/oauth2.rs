//! OAuth2 authorization code and refresh token grants for Gmail and
//! Office 365.
//!
//! [`OAuth2Config`] is validated once when an [`OAuth2Provider`] is built.
//! The provider builds consent URLs, exchanges authorization codes, and
//! refreshes access tokens. [`RefreshTokenSource`] keeps the result in a
//! [`TokenStore`] and plugs into [`CachingTokenManager`].

use serde::Deserialize;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use url::Url;

use super::http::{HttpRequest, HttpTransport};
use super::store::{StoredToken, TokenStore};
use super::{CachingTokenManager, OAuth2Token, TokenSource};
use crate::context::SendContext;
use crate::errors::{codes, MailError, MailResult};
use crate::types::ProviderType;

/// Default timeout for token endpoint calls.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const AZURE_AD_BASE: &str = "https://login.microsoftonline.com";

/// Authorization and token endpoints of an identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// Where users grant consent.
    pub authorization_url: String,
    /// Where codes and refresh tokens are exchanged.
    pub token_url: String,
}

impl ProviderEndpoints {
    /// Google endpoints.
    pub fn google() -> Self {
        Self {
            authorization_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }

    /// Azure AD v2 endpoints for `tenant_id`.
    pub fn azure_ad(tenant_id: &str) -> Self {
        let tenant = tenant_id.trim();
        Self {
            authorization_url: format!("{}/{}/oauth2/v2.0/authorize", AZURE_AD_BASE, tenant),
            token_url: format!("{}/{}/oauth2/v2.0/token", AZURE_AD_BASE, tenant),
        }
    }
}

/// Scopes needed to send mail over SMTP.
pub fn default_scopes(provider: ProviderType) -> Vec<String> {
    match provider {
        ProviderType::Gmail => vec!["https://mail.google.com/".to_string()],
        ProviderType::Office365 => vec![
            "https://outlook.office.com/SMTP.Send".to_string(),
            "offline_access".to_string(),
        ],
        ProviderType::Generic => Vec::new(),
    }
}

/// OAuth2 client registration.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    /// Identity provider.
    pub provider: ProviderType,
    /// Client id.
    pub client_id: String,
    /// Client secret (protected).
    pub client_secret: SecretString,
    /// Redirect URL registered for the client.
    pub redirect_url: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Azure AD tenant; required for Office 365.
    pub tenant_id: Option<String>,
    /// Endpoint override; required for generic providers.
    pub endpoints: Option<ProviderEndpoints>,
    /// Timeout for each token endpoint call.
    pub timeout: Duration,
}

impl OAuth2Config {
    /// Creates a registration with the provider's SMTP scopes.
    pub fn new(
        provider: ProviderType,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into()),
            redirect_url: redirect_url.into(),
            scopes: default_scopes(provider),
            tenant_id: None,
            endpoints: None,
            timeout: DEFAULT_TOKEN_TIMEOUT,
        }
    }

    /// Replaces the scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the Azure AD tenant.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Overrides the endpoints.
    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Sets the token endpoint timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks credentials, redirect URL, scopes, and provider requirements.
    /// The first problem found is returned as a validation error.
    pub fn validate(&self, request_id: &str) -> MailResult<()> {
        let invalid = |code, message: &str| Err(MailError::validation(code, message).with_request_id(request_id));

        if self.client_id.trim().is_empty() {
            return invalid(codes::MISSING_CLIENT_ID, "client id is required");
        }
        if self.client_secret.expose_secret().trim().is_empty() {
            return invalid(codes::MISSING_CLIENT_SECRET, "client secret is required");
        }
        if self.redirect_url.trim().is_empty() {
            return invalid(codes::MISSING_REDIRECT_URL, "redirect URL is required");
        }
        if Url::parse(self.redirect_url.trim()).is_err() {
            return invalid(codes::INVALID_REDIRECT_URL, "redirect URL is not a valid absolute URL");
        }
        if self.scopes.is_empty() {
            return invalid(codes::MISSING_SCOPES, "at least one scope is required");
        }
        if self.scopes.iter().any(|s| s.trim().is_empty()) {
            return invalid(codes::INVALID_SCOPE, "scopes must not be blank");
        }
        if self.provider == ProviderType::Office365
            && self.tenant_id.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return invalid(codes::MISSING_TENANT_ID, "tenant id is required for Office 365");
        }
        self.resolve_endpoints(request_id).map(|_| ())
    }

    /// Endpoint override, else the provider's well-known endpoints.
    pub fn resolve_endpoints(&self, request_id: &str) -> MailResult<ProviderEndpoints> {
        if let Some(endpoints) = &self.endpoints {
            return Ok(endpoints.clone());
        }
        match self.provider {
            ProviderType::Gmail => Ok(ProviderEndpoints::google()),
            ProviderType::Office365 => Ok(ProviderEndpoints::azure_ad(self.tenant_id.as_deref().unwrap_or_default())),
            ProviderType::Generic => Err(MailError::validation(
                codes::UNSUPPORTED_PROVIDER,
                "generic providers need explicit OAuth2 endpoints",
            )
            .with_request_id(request_id)),
        }
    }
}

/// Tokens returned by a grant.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// New access token.
    pub token: OAuth2Token,
    /// Refresh token, when the provider issued or rotated one.
    pub refresh_token: Option<SecretString>,
    /// Granted scopes, space separated.
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Talks to one provider's OAuth2 endpoints.
pub struct OAuth2Provider {
    config: OAuth2Config,
    authorization_url: Url,
    token_url: String,
    http: Arc<dyn HttpTransport>,
}

impl fmt::Debug for OAuth2Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Provider")
            .field("provider", &self.config.provider)
            .field("client_id", &self.config.client_id)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl OAuth2Provider {
    /// Validates `config` and resolves its endpoints.
    pub fn new(config: OAuth2Config, http: Arc<dyn HttpTransport>) -> MailResult<Self> {
        config.validate("init")?;
        let endpoints = config.resolve_endpoints("init")?;
        let authorization_url = Url::parse(&endpoints.authorization_url).map_err(|e| {
            MailError::configuration(format!("invalid authorization endpoint: {}", endpoints.authorization_url))
                .with_cause(e)
        })?;
        Url::parse(&endpoints.token_url).map_err(|e| {
            MailError::configuration(format!("invalid token endpoint: {}", endpoints.token_url)).with_cause(e)
        })?;

        Ok(Self {
            config,
            authorization_url,
            token_url: endpoints.token_url,
            http,
        })
    }

    /// The validated registration.
    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    /// Consent URL requesting offline access, so the code exchange also
    /// yields a refresh token.
    pub fn authorization_url(&self, state: &str) -> String {
        let mut url = self.authorization_url.clone();
        url.query_pairs_mut()
            .append_pair("access_type", "offline")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(&self, ctx: &SendContext, code: &str, request_id: &str) -> MailResult<TokenGrant> {
        tracing::info!(request_id, provider = %self.config.provider, "Exchanging authorization code");
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_url.as_str()),
        ];
        self.request_token(ctx, &form, codes::CODE_EXCHANGE_FAILED, request_id).await
    }

    /// Obtains a new access token with the refresh token grant.
    pub async fn refresh(
        &self,
        ctx: &SendContext,
        refresh_token: &SecretString,
        request_id: &str,
    ) -> MailResult<TokenGrant> {
        tracing::info!(request_id, provider = %self.config.provider, "Refreshing OAuth2 access token");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret().as_str()),
        ];
        self.request_token(ctx, &form, codes::TOKEN_REFRESH_FAILED, request_id).await
    }

    async fn request_token(
        &self,
        ctx: &SendContext,
        form: &[(&str, &str)],
        failure_code: &'static str,
        request_id: &str,
    ) -> MailResult<TokenGrant> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter().copied())
            .append_pair("client_id", &self.config.client_id)
            .append_pair("client_secret", self.config.client_secret.expose_secret())
            .finish();
        let request = HttpRequest {
            url: self.token_url.clone(),
            headers: Vec::new(),
            body,
            timeout: self.config.timeout,
        };

        let response = ctx
            .run(Some(self.config.timeout), self.http.send(request))
            .await
            .map_err(|interrupted| MailError::from(interrupted).with_request_id(request_id))?
            .map_err(|e| {
                MailError::authentication(failure_code, "token endpoint request failed")
                    .with_request_id(request_id)
                    .with_cause(e)
            })?;

        if !response.is_success() {
            let detail = serde_json::from_str::<TokenErrorResponse>(&response.body)
                .map(|e| match e.error_description {
                    Some(description) => format!("{}: {}", e.error, description),
                    None => e.error,
                })
                .unwrap_or_else(|_| "no error detail".to_string());
            tracing::warn!(request_id, status = response.status, detail = %detail, "Token endpoint refused grant");
            return Err(MailError::authentication(
                failure_code,
                format!("token endpoint returned {} ({})", response.status, detail),
            )
            .with_request_id(request_id));
        }

        let parsed: TokenResponse = serde_json::from_str(&response.body).map_err(|e| {
            MailError::authentication(failure_code, "malformed token endpoint response")
                .with_request_id(request_id)
                .with_cause(e)
        })?;
        if parsed.access_token.trim().is_empty() {
            return Err(MailError::authentication(failure_code, "token endpoint returned an empty access token")
                .with_request_id(request_id));
        }

        let mut token = OAuth2Token::new(parsed.access_token);
        if let Some(seconds) = parsed.expires_in {
            token = token.expires_in(Duration::from_secs(seconds));
        }
        Ok(TokenGrant {
            token,
            refresh_token: parsed.refresh_token.map(SecretString::new),
            scope: parsed.scope,
        })
    }
}

/// [`TokenSource`] that serves a mailbox's stored access token and renews
/// it with the stored refresh token.
pub struct RefreshTokenSource {
    provider: Arc<OAuth2Provider>,
    store: Arc<dyn TokenStore>,
    mailbox: String,
}

impl RefreshTokenSource {
    /// Tokens for `mailbox` are read from and written to `store`.
    pub fn new(provider: Arc<OAuth2Provider>, store: Arc<dyn TokenStore>, mailbox: impl Into<String>) -> Self {
        Self {
            provider,
            store,
            mailbox: mailbox.into(),
        }
    }

    /// Exchanges `code` and stores the resulting tokens for the mailbox.
    pub async fn complete_authorization(&self, ctx: &SendContext, code: &str, request_id: &str) -> MailResult<()> {
        let grant = self.provider.exchange_code(ctx, code, request_id).await?;
        self.store
            .store(&self.mailbox, StoredToken::issued(grant.token, grant.refresh_token))
            .await
    }

    /// Wraps the source in a caching [`TokenManager`](super::TokenManager).
    pub fn into_manager(self) -> CachingTokenManager<Self> {
        let provider = self.provider.config().provider;
        CachingTokenManager::new(provider, self)
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    async fn fetch_token(&self) -> MailResult<OAuth2Token> {
        let entry = self.store.get(&self.mailbox).await?;
        if let Some(token) = entry.as_ref().and_then(StoredToken::usable_access) {
            return Ok(token.clone());
        }

        let refresh_token = entry.and_then(|e| e.refresh_token).ok_or_else(|| {
            MailError::authentication(
                codes::TOKEN_NOT_FOUND,
                format!("no refresh token stored for {}", self.mailbox),
            )
        })?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let grant = self
            .provider
            .refresh(&SendContext::background(), &refresh_token, &request_id)
            .await?;
        let refresh_token = grant.refresh_token.or(Some(refresh_token));
        self.store
            .store(&self.mailbox, StoredToken::issued(grant.token.clone(), refresh_token))
            .await?;
        Ok(grant.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::mocks::MockHttpTransport;

    fn gmail() -> OAuth2Config {
        OAuth2Config::new(ProviderType::Gmail, "client", "secret", "http://localhost:8080/callback")
    }

    fn form(body: &str) -> Vec<(String, String)> {
        url::form_urlencoded::parse(body.as_bytes()).into_owned().collect()
    }

    #[test]
    fn test_office365_endpoints_use_tenant() {
        let config = OAuth2Config::new(ProviderType::Office365, "c", "s", "https://app.example.com/cb")
            .with_tenant_id("contoso");
        let endpoints = config.resolve_endpoints("req").unwrap();
        assert_eq!(
            endpoints.token_url,
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        assert!(config.scopes.contains(&"offline_access".to_string()));
    }

    #[test]
    fn test_authorization_url_requests_offline_access() {
        let provider = OAuth2Provider::new(gmail(), Arc::new(MockHttpTransport::new())).unwrap();
        let url = Url::parse(&provider.authorization_url("xyz")).unwrap();
        let params: Vec<_> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert!(params.contains(&("access_type".into(), "offline".into())));
        assert!(params.contains(&("state".into(), "xyz".into())));
        assert!(params.contains(&("scope".into(), "https://mail.google.com/".into())));
        assert!(params.contains(&("redirect_uri".into(), "http://localhost:8080/callback".into())));
    }

    #[tokio::test]
    async fn test_exchange_code_posts_form() {
        let http = Arc::new(MockHttpTransport::new());
        http.respond(200, r#"{"access_token":"at","expires_in":3600,"refresh_token":"rt","token_type":"Bearer"}"#);
        let provider = OAuth2Provider::new(gmail(), http.clone()).unwrap();

        let grant = provider
            .exchange_code(&SendContext::background(), "auth-code", "req")
            .await
            .unwrap();
        assert_eq!(grant.token.access_token.expose_secret(), "at");
        assert!(!grant.token.is_expired());
        assert_eq!(grant.refresh_token.unwrap().expose_secret(), "rt");

        let requests = http.requests();
        assert_eq!(requests[0].url, GOOGLE_TOKEN_URL);
        let body = form(&requests[0].body);
        assert!(body.contains(&("grant_type".into(), "authorization_code".into())));
        assert!(body.contains(&("code".into(), "auth-code".into())));
        assert!(body.contains(&("client_secret".into(), "secret".into())));
    }

    #[tokio::test]
    async fn test_refresh_error_is_authentication() {
        let http = Arc::new(MockHttpTransport::new());
        http.respond(400, r#"{"error":"invalid_grant","error_description":"Token has been revoked"}"#);
        let provider = OAuth2Provider::new(gmail(), http).unwrap();

        let err = provider
            .refresh(&SendContext::background(), &SecretString::new("rt".into()), "req-3")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.code(), codes::TOKEN_REFRESH_FAILED);
        assert!(err.message().contains("invalid_grant"));
        assert_eq!(err.request_id(), Some("req-3"));
    }

    #[tokio::test]
    async fn test_generic_provider_needs_endpoints() {
        let config = OAuth2Config::new(ProviderType::Generic, "c", "s", "https://app.example.com/cb")
            .with_scopes(["mail.send"]);
        let err = OAuth2Provider::new(config.clone(), Arc::new(MockHttpTransport::new())).unwrap_err();
        assert_eq!(err.code(), codes::UNSUPPORTED_PROVIDER);

        let config = config.with_endpoints(ProviderEndpoints {
            authorization_url: "https://idp.example.com/authorize".into(),
            token_url: "https://idp.example.com/token".into(),
        });
        assert!(OAuth2Provider::new(config, Arc::new(MockHttpTransport::new())).is_ok());
    }
}
