//! Access tiers and the credential-to-tier resolution chain.

mod resolver;

pub use resolver::{
    CredentialIssuer, JwtCredentialIssuer, Resolution, TierResolver, TokenClaims, Verification,
};

use serde::{Deserialize, Serialize};

/// Access tier assigned to a connection at handshake time.
///
/// Tiers are static configuration: the set of tiers and their capability
/// sets never change at runtime, only the per-tier message budgets are
/// configurable (see `TierLimits`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Freewire,
    Wire,
    Extrawire,
    Admin,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Freewire => "freewire",
            Tier::Wire => "wire",
            Tier::Extrawire => "extrawire",
            Tier::Admin => "admin",
        }
    }

    pub fn from_name(name: &str) -> Option<Tier> {
        match name {
            "free" => Some(Tier::Free),
            "freewire" => Some(Tier::Freewire),
            "wire" => Some(Tier::Wire),
            "extrawire" => Some(Tier::Extrawire),
            "admin" => Some(Tier::Admin),
            _ => None,
        }
    }

    /// Fixed capability set for this tier. `Admin` holds every capability.
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Tier::Free | Tier::Freewire | Tier::Wire | Tier::Extrawire => {
                &[Capability::Connect, Capability::Subscribe, Capability::Publish]
            }
            Tier::Admin => &[
                Capability::Connect,
                Capability::Subscribe,
                Capability::Publish,
                Capability::Admin,
            ],
        }
    }

    pub fn has_capability(self, cap: Capability) -> bool {
        self == Tier::Admin || self.capabilities().contains(&cap)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Connect,
    Subscribe,
    Publish,
    Admin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trip() {
        for tier in [Tier::Free, Tier::Freewire, Tier::Wire, Tier::Extrawire, Tier::Admin] {
            assert_eq!(Tier::from_name(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::from_name("platinum"), None);
    }

    #[test]
    fn test_admin_has_every_capability() {
        assert!(Tier::Admin.has_capability(Capability::Admin));
        assert!(Tier::Admin.has_capability(Capability::Publish));
    }

    #[test]
    fn test_free_cannot_administer() {
        assert!(Tier::Free.has_capability(Capability::Connect));
        assert!(Tier::Free.has_capability(Capability::Subscribe));
        assert!(Tier::Free.has_capability(Capability::Publish));
        assert!(!Tier::Free.has_capability(Capability::Admin));
    }
}
