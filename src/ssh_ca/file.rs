use serde::{Deserialize, Serialize};
use ssh_key::PrivateKey;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use super::{KeyError, KeyProvider};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub private_key_file: PathBuf,
}

/// Reads CA private keys from unencrypted OpenSSH key files.
#[derive(Debug, Default)]
pub struct FileKeyProvider {
    files: HashMap<String, PathBuf>,
}

impl FileKeyProvider {
    /// Collect the key files of all `file` signers, resolving relative paths
    /// against `base_dir`.
    pub fn new<'a>(
        signers: impl IntoIterator<Item = (&'a str, &'a Config)>,
        base_dir: &Path,
    ) -> Self {
        let files = signers
            .into_iter()
            .map(|(ca, config)| (ca.to_string(), base_dir.join(&config.private_key_file)))
            .collect();
        Self { files }
    }
}

impl KeyProvider for FileKeyProvider {
    fn load(&self, ca: &str) -> Result<PrivateKey, KeyError> {
        let path = self
            .files
            .get(ca)
            .ok_or_else(|| KeyError::Missing(ca.to_string()))?;
        tracing::debug!(ca, path = %path.display(), "Reading CA private key");
        PrivateKey::read_openssh_file(path).map_err(|source| KeyError::Read {
            ca: ca.to_string(),
            source,
        })
    }
}
