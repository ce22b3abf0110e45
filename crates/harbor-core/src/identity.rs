//! Host identity.
//!
//! The host is addressed as `{short id}.{base domain}`, where the short id is a
//! prefix of the hash of the host's public key. Applications are then served
//! from `{app}.{host domain}`.

use serde::{Deserialize, Serialize};

use crate::ids::HostId;

/// Number of hex characters of the host id used as the domain label.
const SHORT_ID_LEN: usize = 6;

/// The host's identity and the DNS domain derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    id: HostId,
    domain: String,
}

impl HostIdentity {
    /// Derive the identity for a public key under the given base domain.
    #[must_use]
    pub fn derive(public_key: &[u8], base_domain: &str) -> Self {
        let id = HostId::from_public_key(public_key);
        let short_id = Self::short_id_of(&id);
        Self {
            id,
            domain: format!("{short_id}.{}", base_domain.trim_matches('.')),
        }
    }

    /// Build an identity from an already known id and domain.
    #[must_use]
    pub fn new(id: HostId, domain: impl Into<String>) -> Self {
        Self {
            id,
            domain: domain.into(),
        }
    }

    /// The full host id.
    #[must_use]
    pub const fn id(&self) -> &HostId {
        &self.id
    }

    /// The short id used as the host's domain label.
    #[must_use]
    pub fn short_id(&self) -> String {
        Self::short_id_of(&self.id)
    }

    /// The host's DNS domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The domain an application is served from.
    #[must_use]
    pub fn app_domain(&self, app: &str) -> String {
        format!("{app}.{}", self.domain)
    }

    fn short_id_of(id: &HostId) -> String {
        let mut hex = id.to_hex();
        hex.truncate(SHORT_ID_LEN);
        hex
    }
}
