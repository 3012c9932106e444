//! The certificate authorities this service signs for.
//!
//! Built once at startup from the `[authorities]` configuration and never
//! changed afterwards, so lookups need no synchronization.

use serde::{Deserialize, Serialize};
use ssh_key::PublicKey;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use thiserror::Error;

use crate::ssh_ca::{file, KeyError, KeyProvider, Signer};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum SignerConfig {
    File(file::Config),
}

/// OpenID Connect endpoints of the provider behind a CA.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct OidcEndpoints {
    /// Discovered from the issuer when left out.
    pub authorization: Option<String>,
    pub token: String,
    pub introspection: String,
    pub userinfo: String,
    pub device_authorization: Option<String>,
    pub issuer: String,
}

impl OidcEndpoints {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthorityConfig {
    /// Human readable name, shown on the login pages.
    pub name: Option<String>,
    pub signer: Option<SignerConfig>,
    /// If set, the loaded signing key must match this OpenSSH public key.
    pub public_key: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub introspection_client_id: String,
    #[serde(default)]
    pub introspection_client_secret: String,
    pub oidc: Option<OidcEndpoints>,
}

/// Settings for a CA whose users log in through an OpenID Connect provider.
#[derive(Clone, Debug)]
pub struct OidcSettings {
    pub client_id: String,
    pub introspection_client_id: String,
    pub introspection_client_secret: String,
    pub endpoints: OidcEndpoints,
}

/// How a CA learns who it is signing for.
#[derive(Clone, Debug)]
pub enum Tenant {
    /// Identity comes from a browser login against the provider.
    Oidc(OidcSettings),
    /// Identity is supplied by a trusted caller; no login flow.
    SignerOnly,
}

pub struct CaEntry {
    name: Arc<str>,
    display_name: String,
    signer: Signer,
    tenant: Tenant,
}

impl CaEntry {
    pub fn new(name: impl Into<Arc<str>>, signer: Signer, tenant: Tenant) -> Self {
        let name = name.into();
        Self {
            display_name: name.to_string(),
            name,
            signer,
            tenant,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn public_key(&self) -> &PublicKey {
        self.signer.public_key()
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn oidc(&self) -> Option<&OidcSettings> {
        match &self.tenant {
            Tenant::Oidc(settings) => Some(settings),
            Tenant::SignerOnly => None,
        }
    }
}

impl std::fmt::Debug for CaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaEntry")
            .field("name", &self.name)
            .field("public_key", &self.public_key().to_openssh().ok())
            .field("oidc", &self.oidc().is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("unknown CA '{0}'")]
pub struct UnknownCa(pub String);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("CA '{ca}' has an invalid public_key: {source}")]
    InvalidPublicKey {
        ca: String,
        #[source]
        source: ssh_key::Error,
    },
    #[error("the signing key of CA '{0}' does not match its configured public_key")]
    KeyMismatch(String),
    #[error("CA '{ca}' is missing the OIDC {field} setting")]
    IncompleteOidc { ca: String, field: &'static str },
}

fn oidc_tenant(ca: &str, config: &AuthorityConfig) -> Result<Tenant, RegistryError> {
    let endpoints = match &config.oidc {
        Some(endpoints) if !endpoints.is_empty() => endpoints.clone(),
        _ => return Ok(Tenant::SignerOnly),
    };
    let required = [
        ("client_id", config.client_id.as_str()),
        ("introspection_client_id", config.introspection_client_id.as_str()),
        ("token", endpoints.token.as_str()),
        ("introspection", endpoints.introspection.as_str()),
        ("issuer", endpoints.issuer.as_str()),
    ];
    if let Some(&(field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
        return Err(RegistryError::IncompleteOidc {
            ca: ca.to_string(),
            field,
        });
    }
    Ok(Tenant::Oidc(OidcSettings {
        client_id: config.client_id.clone(),
        introspection_client_id: config.introspection_client_id.clone(),
        introspection_client_secret: config.introspection_client_secret.clone(),
        endpoints,
    }))
}

#[derive(Debug, Default)]
pub struct CaRegistry {
    entries: HashMap<Arc<str>, Arc<CaEntry>>,
}

impl CaRegistry {
    pub fn load(
        authorities: &BTreeMap<String, AuthorityConfig>,
        keys: &dyn KeyProvider,
    ) -> Result<Self, RegistryError> {
        let mut entries = HashMap::new();
        for (ca, config) in authorities {
            let tenant = oidc_tenant(ca, config)?;
            let signer = Signer::new(keys.load(ca)?);
            if let Some(expected) = &config.public_key {
                let expected = PublicKey::from_openssh(expected).map_err(|source| {
                    RegistryError::InvalidPublicKey {
                        ca: ca.clone(),
                        source,
                    }
                })?;
                if expected.key_data() != signer.public_key().key_data() {
                    return Err(RegistryError::KeyMismatch(ca.clone()));
                }
            }
            let mut entry = CaEntry::new(ca.as_str(), signer, tenant);
            if let Some(display_name) = &config.name {
                entry.display_name = display_name.clone();
            }
            tracing::info!(
                %ca,
                oidc = entry.oidc().is_some(),
                fingerprint = %entry.public_key().fingerprint(Default::default()),
                "Loaded certificate authority"
            );
            entries.insert(entry.name.clone(), Arc::new(entry));
        }
        Ok(Self { entries })
    }

    /// Register an entry built in-process; replaces any entry of the same name.
    pub fn with_entry(mut self, entry: CaEntry) -> Self {
        self.entries.insert(entry.name.clone(), Arc::new(entry));
        self
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CaEntry>, UnknownCa> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownCa(name.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<CaEntry>> {
        self.entries.values()
    }
}
