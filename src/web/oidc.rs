//! Outbound calls to a CA's OpenID Connect provider.
//!
//! Each method is exactly one HTTP request. Nothing here retries: a failed
//! call is reported to the browser and the user starts the step again.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::registry::OidcSettings;

/// Longest provider error body kept for logs and error pages.
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),
    #[error("identity provider {endpoint} endpoint returned {status}: {body}")]
    Rejected {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("invalid response from identity provider {endpoint} endpoint: {source}")]
    InvalidResponse {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid identity provider endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl OidcError {
    /// True for errors a fresh attempt may not run into.
    pub fn is_transient(&self) -> bool {
        match self {
            OidcError::Unavailable(_) => true,
            OidcError::Rejected { status, .. } => status.is_server_error(),
            OidcError::InvalidResponse { .. } | OidcError::InvalidEndpoint(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

/// Result of RFC 7662 token introspection.
#[derive(Debug)]
pub struct Introspection {
    pub active: bool,
    pub subject: Option<String>,
    pub claims: Map<String, Value>,
}

impl From<Map<String, Value>> for Introspection {
    fn from(claims: Map<String, Value>) -> Self {
        Self {
            active: claims
                .get("active")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            subject: claims
                .get("sub")
                .and_then(Value::as_str)
                .filter(|sub| !sub.is_empty())
                .map(str::to_string),
            claims,
        }
    }
}

#[derive(Deserialize)]
struct Discovery {
    authorization_endpoint: String,
}

async fn check(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, OidcError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    tracing::warn!(endpoint, %status, %body, "Identity provider rejected the request");
    Err(OidcError::Rejected {
        endpoint,
        status,
        body,
    })
}

async fn json<T: for<'de> Deserialize<'de>>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T, OidcError> {
    check(endpoint, response)
        .await?
        .json()
        .await
        .map_err(|source| OidcError::InvalidResponse { endpoint, source })
}

#[derive(Clone)]
pub struct OidcClient {
    http: reqwest::Client,
}

impl OidcClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::ClientBuilder::new().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// The endpoint browsers are sent to; discovered from the issuer when
    /// it isn't configured.
    pub async fn authorization_endpoint(&self, settings: &OidcSettings) -> Result<String, OidcError> {
        if let Some(endpoint) = &settings.endpoints.authorization {
            return Ok(endpoint.clone());
        }
        let url = format!(
            "{}/.well-known/openid-configuration",
            settings.endpoints.issuer.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(OidcError::Unavailable)?;
        let discovery: Discovery = json("discovery", response).await?;
        Ok(discovery.authorization_endpoint)
    }

    /// Trade an authorization code for tokens, as the login client.
    pub async fn exchange_code(
        &self,
        settings: &OidcSettings,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OidcError> {
        let response = self
            .http
            .post(&settings.endpoints.token)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", settings.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(OidcError::Unavailable)?;
        json("token", response).await
    }

    /// Ask the provider whether `token` is active, as the introspection client.
    pub async fn introspect(
        &self,
        settings: &OidcSettings,
        token: &str,
    ) -> Result<Introspection, OidcError> {
        let response = self
            .http
            .post(&settings.endpoints.introspection)
            .basic_auth(
                &settings.introspection_client_id,
                Some(&settings.introspection_client_secret),
            )
            .form(&[("token", token)])
            .send()
            .await
            .map_err(OidcError::Unavailable)?;
        let claims: Map<String, Value> = json("introspection", response).await?;
        Ok(claims.into())
    }

    pub async fn userinfo(
        &self,
        settings: &OidcSettings,
        token: &str,
    ) -> Result<Map<String, Value>, OidcError> {
        let response = self
            .http
            .get(&settings.endpoints.userinfo)
            .bearer_auth(token)
            .send()
            .await
            .map_err(OidcError::Unavailable)?;
        json("userinfo", response).await
    }
}
