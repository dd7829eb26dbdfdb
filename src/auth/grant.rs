// Token endpoint client
// Issues password and refresh_token grants and classifies the responses

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;

use super::types::{redacted, ClientIdentity, Credentials, GrantResponse};
use crate::error::GrantError;

/// Path of the token endpoint below the API base URL
pub const TOKEN_PATH: &str = "/auth/oauth2/v1/token";

/// Scope requested when the credentials carry none
pub const DEFAULT_SCOPE: &str = "trapi";

/// The authorization server, as consumed by the token manager
pub trait AuthEndpoint {
    /// Exchange user credentials for a token pair
    fn password_grant(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<GrantResponse, GrantError>> + Send;

    /// Exchange a refresh token for a new token pair, authenticating as `identity`
    fn refresh_grant(
        &self,
        refresh_token: &str,
        identity: &ClientIdentity,
    ) -> impl Future<Output = Result<GrantResponse, GrantError>> + Send;
}

/// Token endpoint reached over HTTPS
pub struct HttpAuthEndpoint {
    /// HTTP client with a bounded request timeout
    client: Client,

    /// Full token endpoint URL
    token_url: String,

    /// Value of the `takeExclusiveSignOnControl` form field
    exclusive_sign_on: bool,
}

impl HttpAuthEndpoint {
    pub fn new(base_url: &str, timeout_secs: u64, exclusive_sign_on: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token_url: token_url(base_url),
            exclusive_sign_on,
        })
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn post_grant(
        &self,
        form: &[(&str, &str)],
        client_id: &str,
        client_secret: &str,
    ) -> Result<GrantResponse, GrantError> {
        let grant_type = form
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| *v)
            .unwrap_or("unknown");

        tracing::debug!(
            url = %self.token_url,
            grant_type = grant_type,
            client_id = %client_id.chars().take(8).collect::<String>(),
            "Sending token request"
        );

        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .basic_auth(client_id, Some(client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| network_error(&e))?;

        if !status.is_success() {
            tracing::debug!(
                status = status.as_u16(),
                grant_type = grant_type,
                "Token request rejected"
            );
            return Err(classify_failure(status, body));
        }

        let grant = parse_grant(&body)?;
        tracing::debug!(
            grant_type = grant_type,
            access_token = %redacted(&grant.access_token),
            expires_in = grant.expires_in,
            "Token request succeeded"
        );
        Ok(grant)
    }
}

impl AuthEndpoint for HttpAuthEndpoint {
    async fn password_grant(&self, credentials: &Credentials) -> Result<GrantResponse, GrantError> {
        let scope = credentials.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        let exclusive = if self.exclusive_sign_on { "true" } else { "false" };

        let form = [
            ("grant_type", "password"),
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("scope", scope),
            ("takeExclusiveSignOnControl", exclusive),
        ];

        self.post_grant(
            &form,
            &credentials.client_id,
            credentials.client_secret.as_deref().unwrap_or_default(),
        )
        .await
    }

    async fn refresh_grant(
        &self,
        refresh_token: &str,
        identity: &ClientIdentity,
    ) -> Result<GrantResponse, GrantError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        self.post_grant(&form, &identity.client_id, &identity.client_secret)
            .await
    }
}

/// Token endpoint URL for an API base URL
pub fn token_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH)
}

/// Map a non-success response onto a grant error
///
/// Only HTTP 400 mentioning `invalid_grant` counts as an invalid grant.
pub fn classify_failure(status: StatusCode, body: String) -> GrantError {
    let status = status.as_u16();
    if status == 400 && body.contains("invalid_grant") {
        GrantError::InvalidGrant { status, body }
    } else {
        GrantError::Rejected { status, body }
    }
}

/// Parse a success body into a complete grant
pub fn parse_grant(body: &str) -> Result<GrantResponse, GrantError> {
    let grant: GrantResponse =
        serde_json::from_str(body).map_err(|e| GrantError::Decode(e.to_string()))?;

    if grant.access_token.is_empty() {
        return Err(GrantError::Decode(
            "response does not contain access_token".to_string(),
        ));
    }
    if grant.refresh_token.is_empty() {
        return Err(GrantError::Decode(
            "response does not contain refresh_token".to_string(),
        ));
    }

    Ok(grant)
}

/// Categorize a transport failure for diagnosis
fn network_error(e: &reqwest::Error) -> GrantError {
    let error_kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    };

    tracing::warn!(
        error_kind = error_kind,
        error = %e,
        "Token request failed"
    );

    GrantError::Network(format!("{} (kind: {})", e, error_kind))
}
