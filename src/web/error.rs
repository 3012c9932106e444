use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::oidc::OidcError;
use crate::{issuer::IssueError, registry::UnknownCa, rendezvous::RendezvousError};

/// Everything that can go wrong while serving a browser or token request.
///
/// Whatever the variant, no rendezvous entry is authenticated when one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub(crate) enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error(transparent)]
    UnknownCa(#[from] UnknownCa),
    #[error("CA '{0}' does not support OpenID Connect login")]
    SignerOnly(String),
    #[error("the identity provider refused the login: {0}")]
    Denied(String),
    #[error(transparent)]
    Provider(#[from] OidcError),
    #[error("the access token is not active")]
    TokenInactive,
    #[error("the identity provider did not name a user")]
    NoPrincipal,
    #[error(transparent)]
    Issue(#[from] IssueError),
}

impl AppError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::SignerOnly(_) => StatusCode::BAD_REQUEST,
            AppError::Rendezvous(RendezvousError::NotFound) | AppError::UnknownCa(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::Rendezvous(RendezvousError::Expired) => StatusCode::GONE,
            AppError::Rendezvous(_) => StatusCode::CONFLICT,
            AppError::Denied(_) | AppError::TokenInactive | AppError::NoPrincipal => {
                StatusCode::FORBIDDEN
            }
            AppError::Provider(error) if error.is_transient() => StatusCode::BAD_GATEWAY,
            AppError::Provider(OidcError::Rejected { .. }) => StatusCode::FORBIDDEN,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Issue(IssueError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Issue(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Heading for the browser error page.
    pub(crate) fn title(&self) -> &'static str {
        match self {
            AppError::Rendezvous(RendezvousError::NotFound) => "Unknown login link",
            AppError::Rendezvous(RendezvousError::Expired) => "Login link expired",
            AppError::Rendezvous(_) => "Login already completed",
            AppError::Provider(error) if error.is_transient() => "Identity provider unavailable",
            AppError::Denied(_) | AppError::TokenInactive | AppError::NoPrincipal => {
                "Login denied"
            }
            _ => "Login failed",
        }
    }

    /// Message for the browser error page.
    pub(crate) fn message(&self) -> String {
        match self {
            AppError::Rendezvous(RendezvousError::NotFound | RendezvousError::Expired) => {
                "Run the ssh command again to get a new link.".to_string()
            }
            AppError::Rendezvous(_) => {
                "This login was already used. Return to your terminal.".to_string()
            }
            AppError::Provider(error) if error.is_transient() => {
                "The identity provider could not be reached. Reload the link to try again."
                    .to_string()
            }
            AppError::Provider(_) => {
                "The identity provider did not accept this login. Run the ssh command again to start over."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::info!(error = %self, "Request rejected");
        }
        (self.status(), self.to_string()).into_response()
    }
}

/// Fill the page template, escaping the substituted text.
pub(crate) fn render_page(template: &str, title: &str, message: &str) -> String {
    template
        .replace("{title}", &escape_html(title))
        .replace("{message}", &escape_html(message))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
