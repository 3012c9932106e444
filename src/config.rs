use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    certificate_settings::Profiles,
    registry::{AuthorityConfig, SignerConfig},
    ssh_ca::file::FileKeyProvider,
};

const DEFAULT_LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body><h1>{title}</h1><p>{message}</p></body>
</html>
"#;

fn default_login_page_template() -> String {
    DEFAULT_LOGIN_PAGE.to_string()
}

fn default_sso_ttl() -> u64 {
    180
}

fn default_rendezvous_ttl() -> u64 {
    60
}

fn default_reap_interval() -> u64 {
    5
}

fn default_ssh_listen_on() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2221))
}

fn default_web_listen_on() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2280))
}

/// Service configuration. Loaded once at startup and shared read-only.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Link shown to SSH users; `{code}` is replaced with the rendezvous code.
    pub verification_uri_template: String,
    /// Page shown in the browser; `{title}` and `{message}` are replaced.
    #[serde(default = "default_login_page_template")]
    pub login_page_template: String,
    /// OIDC redirect URI; must route to this service's `/callback`.
    pub callback_uri: String,
    /// Seconds an authenticated login stays claimable.
    #[serde(default = "default_sso_ttl")]
    pub sso_ttl: u64,
    /// Seconds a user has to complete the browser login.
    #[serde(default = "default_rendezvous_ttl")]
    pub rendezvous_ttl: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,
    #[serde(default = "default_ssh_listen_on")]
    pub ssh_listen_on: SocketAddr,
    #[serde(default = "default_web_listen_on")]
    pub web_listen_on: SocketAddr,
    pub ssh_host_key_file: PathBuf,
    /// CA used by `POST /sign` when the request names none.
    pub default_ca: Option<String>,
    #[serde(default)]
    pub certificate: Profiles,
    #[serde(default)]
    pub authorities: BTreeMap<String, AuthorityConfig>,
}

impl Config {
    pub fn sso_ttl(&self) -> Duration {
        Duration::from_secs(self.sso_ttl)
    }

    pub fn rendezvous_ttl(&self) -> Duration {
        Duration::from_secs(self.rendezvous_ttl)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval.max(1))
    }

    pub fn verification_uri(&self, code: &str) -> String {
        self.verification_uri_template.replace("{code}", code)
    }

    /// Key provider for every CA configured with a `file` signer.
    pub fn key_provider(&self, base_dir: &Path) -> FileKeyProvider {
        FileKeyProvider::new(
            self.authorities
                .iter()
                .filter_map(|(ca, authority)| match &authority.signer {
                    Some(SignerConfig::File(file)) => Some((ca.as_str(), file)),
                    None => None,
                }),
            base_dir,
        )
    }

    /// Read the configuration file at `path`. Relative paths inside it are
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read from path {path:?}"))?;
        tracing::info!(path = %path.display(), "Read from configuration file");
        let mut config: Config = toml::from_str(&contents)
            .inspect_err(|error| {
                tracing::error!(path = %path.display(), %error, "Failed to parse configuration");
            })
            .context("configuration file is invalid")?;
        if let Some(base_dir) = path.parent() {
            config.ssh_host_key_file = base_dir.join(&config.ssh_host_key_file);
        }
        Ok(config)
    }
}
