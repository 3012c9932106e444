use std::{sync::Arc, time::Duration};

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

use super::{
    error::{render_page, AppError},
    oidc::OidcClient,
};
use crate::{config::Config, issuer::Issuer, registry::CaRegistry, rendezvous::RendezvousStore};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AppState {
    pub(super) config: Arc<Config>,
    pub(super) registry: Arc<CaRegistry>,
    pub(super) store: RendezvousStore,
    pub(super) issuer: Arc<Issuer>,
    pub(super) oidc: OidcClient,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<CaRegistry>,
        store: RendezvousStore,
        issuer: Arc<Issuer>,
    ) -> Result<Arc<Self>, reqwest::Error> {
        let oidc = OidcClient::new(PROVIDER_TIMEOUT)?;
        Ok(Arc::new(Self {
            config,
            registry,
            store,
            issuer,
            oidc,
        }))
    }

    pub(super) fn page(&self, status: StatusCode, title: &str, message: &str) -> Response {
        let body = render_page(&self.config.login_page_template, title, message);
        (status, Html(body)).into_response()
    }

    pub(super) fn error_page(&self, error: &AppError) -> Response {
        if error.status().is_server_error() || matches!(error, AppError::Provider(_)) {
            tracing::warn!(%error, "Browser login failed");
        } else {
            tracing::info!(%error, "Browser login rejected");
        }
        self.page(error.status(), error.title(), &error.message())
    }
}
