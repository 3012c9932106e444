//! `POST /sign`: certificates for callers that already hold an access token.

use std::sync::Arc;

use axum::{body::Bytes, extract::State};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::Deserialize;

use super::{error::AppError, login::resolve_identity, state::AppState};
use crate::issuer::parse_public_key;

#[derive(Deserialize)]
pub(super) struct SignKeyRequest {
    #[serde(rename = "PublicKey")]
    public_key: String,
    /// One-time token; may be sent as a bearer token instead.
    #[serde(rename = "OTT", default)]
    ott: Option<String>,
    #[serde(rename = "CA", default)]
    ca: Option<String>,
}

/// Clients post JSON without a content type, so the body is parsed by hand.
pub(super) async fn sign_key(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Bytes,
) -> Result<String, AppError> {
    let payload: SignKeyRequest = serde_json::from_slice(&body)
        .map_err(|error| AppError::BadRequest(format!("invalid request body: {error}")))?;
    let token = payload
        .ott
        .or_else(|| bearer.map(|TypedHeader(Authorization(bearer))| bearer.token().to_string()))
        .ok_or_else(|| AppError::BadRequest("missing OTT".to_string()))?;
    let ca = payload
        .ca
        .or_else(|| state.config.default_ca.clone())
        .ok_or_else(|| AppError::BadRequest("no CA requested and no default_ca".to_string()))?;
    let public_key = parse_public_key(&payload.public_key)?;

    let entry = state.registry.lookup(&ca)?;
    let settings = entry
        .oidc()
        .ok_or_else(|| AppError::SignerOnly(entry.name().to_string()))?;
    let identity = resolve_identity(&state.oidc, settings, &token).await?;
    let certificate = state
        .issuer
        .issue(&entry, &identity, &public_key, None)
        .await?;
    let certificate = certificate
        .to_openssh()
        .map_err(|error| AppError::Issue(crate::ssh_ca::SignError::from(error).into()))?;
    Ok(certificate + "\n")
}
