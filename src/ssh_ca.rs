//! The signing capability behind every certificate authority.
//!
//! Key material is obtained through a [`KeyProvider`], so the registry never
//! needs to know whether a key came from a file, an agent or memory.

use rand::{distributions::Standard, Rng};
use ssh_key::{certificate::CertType, Certificate, PrivateKey, PublicKey};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

pub mod file;

fn gen_nonce(len: usize) -> Vec<u8> {
    rand::thread_rng().sample_iter(Standard).take(len).collect()
}

/// Certificate options describe all the parameters that are needed to
/// generate a certificate.
pub struct CertificateOptions {
    public_key: PublicKey,
    cert_type: CertType,
    validity: Option<u64>,
    principals: Vec<Arc<str>>,
    key_id: Option<Arc<str>>,
    comment: Option<Arc<str>>,
    extensions: HashMap<Arc<str>, Arc<str>>,
    critical_options: HashMap<Arc<str>, Arc<str>>,
}

impl CertificateOptions {
    pub fn new_user(public_key: PublicKey) -> Self {
        Self {
            public_key,
            cert_type: CertType::User,
            principals: Vec::new(),
            validity: None,
            key_id: None,
            comment: None,
            extensions: HashMap::new(),
            critical_options: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn cert_type(&self) -> CertType {
        self.cert_type
    }

    pub fn add_principal<T: Into<Arc<str>>>(&mut self, principal: T) {
        self.principals.push(principal.into());
    }

    pub fn principals(&self) -> impl Iterator<Item = &str> {
        self.principals.iter().map(Arc::as_ref)
    }

    /// Validity in seconds, counted from the moment of signing.
    pub fn set_validity(&mut self, validity: u64) {
        self.validity = Some(validity);
    }

    pub fn validity(&self) -> Option<u64> {
        self.validity
    }

    pub fn set_key_id<T: Into<Arc<str>>>(&mut self, key_id: T) {
        self.key_id = Some(key_id.into());
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn set_comment<T: Into<Arc<str>>>(&mut self, comment: T) {
        self.comment = Some(comment.into());
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_extension<K: Into<Arc<str>>, V: Into<Arc<str>>>(&mut self, extension: K, value: V) {
        self.extensions.insert(extension.into(), value.into());
    }

    pub fn extensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extensions
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn set_critical_option<K: Into<Arc<str>>, V: Into<Arc<str>>>(
        &mut self,
        critical_option: K,
        value: V,
    ) {
        self.critical_options
            .insert(critical_option.into(), value.into());
    }

    pub fn critical_options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.critical_options
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
    }
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("certificate without principals")]
    NoPrincipals,
    #[error("No certificate validity known")]
    UnknownValidity,
    #[error("unable to generate certificate")]
    Certificate(#[from] ssh_key::Error),
    #[error("invalid timestamp")]
    SystemTime(#[from] std::time::SystemTimeError),
    #[error("tokio join error")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no signing key available for CA '{0}'")]
    Missing(String),
    #[error("unable to read signing key for CA '{ca}': {source}")]
    Read {
        ca: String,
        #[source]
        source: ssh_key::Error,
    },
}

/// Supplies the private key of a certificate authority.
///
/// Called once per CA while the registry is loaded; the returned key is kept
/// for the lifetime of the process.
pub trait KeyProvider {
    fn load(&self, ca: &str) -> Result<PrivateKey, KeyError>;
}

/// Keys handed over in-process, for embedding and for tests.
#[derive(Default)]
pub struct StaticKeyProvider {
    keys: HashMap<String, PrivateKey>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, ca: impl Into<String>, key: PrivateKey) -> Self {
        self.keys.insert(ca.into(), key);
        self
    }
}

impl KeyProvider for StaticKeyProvider {
    fn load(&self, ca: &str) -> Result<PrivateKey, KeyError> {
        self.keys
            .get(ca)
            .cloned()
            .ok_or_else(|| KeyError::Missing(ca.to_string()))
    }
}

/// Signs user certificates with a CA private key.
pub struct Signer {
    private_key: Arc<PrivateKey>,
    public_key: PublicKey,
}

impl Signer {
    pub fn new(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key().clone();
        Self {
            private_key: Arc::new(private_key),
            public_key,
        }
    }

    /// The CA public key that verifiers need to trust.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub async fn sign(&self, options: &CertificateOptions) -> Result<Certificate, SignError> {
        if options.principals().next().is_none() {
            return Err(SignError::NoPrincipals);
        }
        let valid_after = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs();
        let valid_before = valid_after + options.validity().ok_or(SignError::UnknownValidity)?;
        let mut cert_builder = ssh_key::certificate::Builder::new(
            gen_nonce(32),
            options.public_key().clone(),
            valid_after,
            valid_before,
        )?;
        cert_builder.cert_type(options.cert_type())?;
        for principal in options.principals() {
            cert_builder.valid_principal(principal)?;
        }
        if let Some(key_id) = options.key_id() {
            cert_builder.key_id(key_id)?;
        }
        if let Some(comment) = options.comment() {
            cert_builder.comment(comment)?;
        }
        for (name, data) in options.extensions() {
            cert_builder.extension(name, data)?;
        }
        for (name, data) in options.critical_options() {
            cert_builder.critical_option(name, data)?;
        }
        let private_key = self.private_key.clone();
        let certificate =
            tokio::task::spawn_blocking(move || cert_builder.sign(private_key.as_ref())).await??;
        Ok(certificate)
    }
}
