//! The browser side of the rendezvous: send the user to the identity provider
//! and take the callback that proves who they are.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;

use super::{
    error::AppError,
    oidc::{OidcClient, OidcError},
    state::AppState,
};
use crate::{
    identity::Identity,
    registry::OidcSettings,
    rendezvous::{code_prefix, Phase, RendezvousError, SessionInfo},
};

fn require_pending(session: &SessionInfo) -> Result<(), AppError> {
    match session.phase {
        Phase::Pending => Ok(()),
        Phase::Authenticated | Phase::Consumed => {
            Err(RendezvousError::AlreadyAuthenticated.into())
        }
        Phase::Expired => Err(RendezvousError::Expired.into()),
    }
}

/// Introspect `token` and build the identity it stands for, asking the
/// userinfo endpoint when introspection does not name the subject.
pub(super) async fn resolve_identity(
    client: &OidcClient,
    settings: &OidcSettings,
    token: &str,
) -> Result<Identity, AppError> {
    let introspection = client.introspect(settings, token).await?;
    if !introspection.active {
        return Err(AppError::TokenInactive);
    }
    let mut claims = introspection.claims;
    if introspection.subject.is_none() && !settings.endpoints.userinfo.is_empty() {
        claims.extend(client.userinfo(settings, token).await?);
    }
    Identity::from_claims(claims).ok_or(AppError::NoPrincipal)
}

async fn authorization_url(state: &AppState, code: &str) -> Result<String, AppError> {
    let session = state.store.lookup(code)?;
    require_pending(&session)?;
    let entry = state.registry.lookup(&session.ca)?;
    let settings = entry
        .oidc()
        .ok_or_else(|| AppError::SignerOnly(entry.name().to_string()))?;
    let endpoint = state.oidc.authorization_endpoint(settings).await?;
    let url = reqwest::Url::parse_with_params(
        &endpoint,
        &[
            ("response_type", "code"),
            ("client_id", settings.client_id.as_str()),
            ("redirect_uri", state.config.callback_uri.as_str()),
            ("scope", "openid"),
            ("state", code),
        ],
    )
    .map_err(|_| OidcError::InvalidEndpoint(endpoint.clone()))?;
    Ok(url.into())
}

/// `GET /{code}`: the verification link printed in the SSH session.
pub(super) async fn verification(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match authorization_url(&state, &code).await {
        Ok(url) => {
            tracing::debug!(code = code_prefix(&code), "Redirecting to identity provider");
            Redirect::to(&url).into_response()
        }
        Err(error) => state.error_page(&error),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn complete_login(state: &AppState, params: CallbackParams) -> Result<Identity, AppError> {
    let rendezvous = params
        .state
        .ok_or_else(|| AppError::BadRequest("missing state parameter".to_string()))?;
    let session = state.store.lookup(&rendezvous)?;
    require_pending(&session)?;
    if let Some(error) = params.error {
        return Err(AppError::Denied(params.error_description.unwrap_or(error)));
    }
    let auth_code = params
        .code
        .ok_or_else(|| AppError::BadRequest("missing code parameter".to_string()))?;

    let entry = state.registry.lookup(&session.ca)?;
    let settings = entry
        .oidc()
        .ok_or_else(|| AppError::SignerOnly(entry.name().to_string()))?;
    let token = state
        .oidc
        .exchange_code(settings, &auth_code, &state.config.callback_uri)
        .await?;
    let identity = resolve_identity(&state.oidc, settings, &token.access_token).await?;
    state.store.authenticate(&rendezvous, identity.clone())?;
    Ok(identity)
}

/// `GET /callback`: the provider's redirect after the user logged in.
pub(super) async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match complete_login(&state, params).await {
        Ok(identity) => state.page(
            StatusCode::OK,
            "Login complete",
            &format!(
                "You are logged in as {}. Return to your terminal to receive your certificate.",
                identity.principal()
            ),
        ),
        Err(error) => state.error_page(&error),
    }
}
