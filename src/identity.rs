use serde_json::{Map, Value};

/// Claims consulted, in order, when picking the certificate principal.
const PRINCIPAL_CLAIMS: [&str; 3] = ["preferred_username", "username", "sub"];

/// A validated user: the principal a certificate is issued for and the claims
/// the identity provider vouched for.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    principal: String,
    claims: Map<String, Value>,
}

impl Identity {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            claims: Map::new(),
        }
    }

    pub fn with_claims(principal: impl Into<String>, claims: Map<String, Value>) -> Self {
        Self {
            principal: principal.into(),
            claims,
        }
    }

    /// Derive the principal from a claim set; `None` if no usable claim is present.
    pub fn from_claims(claims: Map<String, Value>) -> Option<Self> {
        let principal = PRINCIPAL_CLAIMS
            .iter()
            .filter_map(|claim| claims.get(*claim).and_then(Value::as_str))
            .find(|value| !value.is_empty())?
            .to_string();
        Some(Self { principal, claims })
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }
}
