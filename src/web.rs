//! HTTP front-end: verification links, the OIDC callback and token-based signing.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub(crate) mod error;
pub mod oidc;
pub(crate) mod login;
pub(crate) mod sign_key;
pub mod state;

pub use state::AppState;

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/callback", axum::routing::get(login::callback))
        .route("/sign", axum::routing::post(sign_key::sign_key))
        .route("/:code", axum::routing::get(login::verification))
        .with_state(state)
}

/// Serve until `halt` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    halt: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(address = ?listener.local_addr().ok(), "Web front-end listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { halt.cancelled().await })
        .await
}
