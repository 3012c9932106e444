//! Turns a validated identity into a signed, short-lived user certificate.

use ssh_key::{Algorithm, Certificate, PublicKey};
use std::time::Duration;
use thiserror::Error;

use crate::{
    certificate_settings::Profiles,
    identity::Identity,
    registry::CaEntry,
    ssh_ca::{CertificateOptions, SignError},
};

/// Upper bound on the validity of any certificate this service issues.
pub const MAX_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("malformed public key: {0}")]
    MalformedKey(#[source] ssh_key::Error),
    #[error("unsupported public key algorithm {0}")]
    UnsupportedKey(Algorithm),
    #[error("signing failed: {0}")]
    Signing(#[from] SignError),
}

/// Parse an OpenSSH-formatted public key as sent by a client.
pub fn parse_public_key(openssh: &str) -> Result<PublicKey, IssueError> {
    let public_key = PublicKey::from_openssh(openssh.trim()).map_err(IssueError::MalformedKey)?;
    if public_key.algorithm() == Algorithm::Dsa {
        return Err(IssueError::UnsupportedKey(Algorithm::Dsa));
    }
    Ok(public_key)
}

pub struct Issuer {
    profiles: Profiles,
}

impl Issuer {
    pub fn new(profiles: Profiles) -> Self {
        Self { profiles }
    }

    /// Sign `public_key` for `identity` with the CA of `entry`.
    ///
    /// The validity comes from `validity` when given, else from the profile
    /// matching the identity, and is always capped at
    /// [`MAX_CERTIFICATE_VALIDITY`]. Failures are not retried.
    pub async fn issue(
        &self,
        entry: &CaEntry,
        identity: &Identity,
        public_key: &PublicKey,
        validity: Option<Duration>,
    ) -> Result<Certificate, IssueError> {
        if public_key.algorithm() == Algorithm::Dsa {
            return Err(IssueError::UnsupportedKey(Algorithm::Dsa));
        }
        if identity.principal().is_empty() {
            return Err(SignError::NoPrincipals.into());
        }
        let settings = self.profiles.lookup(identity);
        let requested = validity.unwrap_or(Duration::from_secs(settings.validity));
        if requested > MAX_CERTIFICATE_VALIDITY {
            tracing::warn!(
                ca = %entry.name(),
                requested = requested.as_secs(),
                "Requested certificate validity exceeds the maximum; capping it"
            );
        }
        let validity = requested.min(MAX_CERTIFICATE_VALIDITY);

        let mut options = CertificateOptions::new_user(public_key.clone());
        options.add_principal(identity.principal());
        options.set_key_id(format!("{}:{}", entry.name(), identity.principal()));
        options.set_validity(validity.as_secs());
        settings.apply(&mut options);

        let certificate = entry.signer().sign(&options).await.inspect_err(|error| {
            tracing::error!(ca = %entry.name(), principal = identity.principal(), %error, "Signing failed");
        })?;
        tracing::info!(
            ca = %entry.name(),
            principal = identity.principal(),
            serial = certificate.serial(),
            valid_before = certificate.valid_before(),
            "Issued certificate"
        );
        Ok(certificate)
    }
}
