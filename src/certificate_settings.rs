use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::identity::Identity;
use crate::ssh_ca::CertificateOptions;

fn default_validity() -> u64 {
    15 * 60
}

fn default_extensions() -> Option<BTreeMap<String, String>> {
    let extensions = [
        "permit-agent-forwarding",
        "permit-port-forwarding",
        "permit-pty",
        "permit-user-rc",
    ];
    Some(
        extensions
            .into_iter()
            .map(|name| (name.to_string(), String::new()))
            .collect(),
    )
}

/// The template every issued certificate is filled from.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CertificateSettings {
    /// Seconds; capped by the issuer.
    #[serde(default = "default_validity")]
    pub validity: u64,
    pub comment: Option<String>,
    pub critical_options: Option<BTreeMap<String, String>>,
    #[serde(default = "default_extensions")]
    pub extensions: Option<BTreeMap<String, String>>,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            validity: default_validity(),
            comment: None,
            critical_options: None,
            extensions: default_extensions(),
        }
    }
}

impl CertificateSettings {
    pub(crate) fn apply(&self, options: &mut CertificateOptions) {
        if let Some(comment) = &self.comment {
            options.set_comment(comment.as_str());
        }
        for (name, data) in self.critical_options.iter().flatten() {
            options.set_critical_option(name.as_str(), data.as_str());
        }
        for (name, data) in self.extensions.iter().flatten() {
            options.set_extension(name.as_str(), data.as_str());
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProfileSelector {
    pub claim: String,
    pub value: String,
    pub settings: CertificateSettings,
}

/// Certificate templates selected by identity claims, with a default.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Profiles {
    #[serde(default)]
    pub profiles: Vec<ProfileSelector>,
    #[serde(flatten)]
    pub default: CertificateSettings,
}

impl Profiles {
    /// The first profile whose claim matches, either as a string or as one
    /// element of a string array.
    pub fn lookup(&self, identity: &Identity) -> &CertificateSettings {
        let claims = identity.claims();
        for selector in &self.profiles {
            if let Some(value) = claims.get(&selector.claim) {
                if let Some(value) = value.as_str() {
                    if value == selector.value {
                        return &selector.settings;
                    }
                } else if let Some(values) = value.as_array() {
                    if values
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|v| v == selector.value)
                    {
                        return &selector.settings;
                    }
                }
            }
        }
        &self.default
    }
}
