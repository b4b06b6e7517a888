use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::BrokerError;

use super::{Capability, Tier};

/// Longest credential the broker will even look at.
const MAX_CREDENTIAL_LEN: usize = 4096;

/// Outcome of resolving a credential: the tier, its capability set, and the
/// identity the credential vouches for (`None` for anonymous).
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub tier: Tier,
    pub capabilities: Vec<Capability>,
    pub identity: Option<String>,
}

impl Resolution {
    pub fn anonymous() -> Self {
        Self::for_tier(Tier::Free, None)
    }

    pub fn for_tier(tier: Tier, identity: Option<String>) -> Self {
        Self {
            tier,
            capabilities: tier.capabilities().to_vec(),
            identity,
        }
    }
}

/// Result of a Credential Issuer verification call.
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    pub tier: Option<Tier>,
    pub identity: Option<String>,
}

impl Verification {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            tier: None,
            identity: None,
        }
    }
}

/// External verification seam. Implementations must tolerate being
/// unreachable: an `Err` here is treated as a verification failure, never as
/// a reason to reject the connection (§ fail-open contract).
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Verification, BrokerError>;
}

/// Claims carried by admin and federation tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Tier claim on federation capability tokens
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TokenClaims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// JWT-backed issuer: administrative tokens are signed with the admin
/// secret, federation capability tokens with the federation secret.
pub struct JwtCredentialIssuer {
    admin_key: DecodingKey,
    federation_key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtCredentialIssuer {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::default();
        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            admin_key: DecodingKey::from_secret(config.admin_secret.as_bytes()),
            federation_key: config
                .federation_secret
                .as_ref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    fn decode_with(&self, key: &DecodingKey, token: &str) -> Option<TokenClaims> {
        decode::<TokenClaims>(token, key, &self.validation)
            .map(|data| data.claims)
            .ok()
    }
}

#[async_trait]
impl CredentialIssuer for JwtCredentialIssuer {
    async fn verify(&self, credential: &str) -> Result<Verification, BrokerError> {
        if let Some(claims) = self.decode_with(&self.admin_key, credential) {
            if claims.has_role("admin") {
                return Ok(Verification {
                    valid: true,
                    tier: Some(Tier::Admin),
                    identity: Some(claims.sub),
                });
            }
        }

        if let Some(ref key) = self.federation_key {
            if let Some(claims) = self.decode_with(key, credential) {
                let tier = claims.tier.as_deref().and_then(Tier::from_name);
                if let Some(tier) = tier {
                    return Ok(Verification {
                        valid: true,
                        tier: Some(tier),
                        identity: Some(claims.sub),
                    });
                }
            }
        }

        Ok(Verification::invalid())
    }
}

struct CachedResolution {
    resolution: Resolution,
    expires_at: Instant,
}

struct ApiKeyEntry {
    tier: Tier,
    identity: String,
}

/// Maps a credential to a tier, capability set, and identity.
///
/// Resolution order, first match wins: empty credential, administrative
/// token, API key, federation capability token. Any verification failure
/// that is not a structural error falls through to anonymous `free`: the
/// broker prefers admitting a connection at the lowest tier over rejecting
/// it. Only `CredentialMalformed` is a hard error, and only the handshake
/// path treats it as fatal.
pub struct TierResolver {
    issuer: Arc<dyn CredentialIssuer>,
    api_keys: HashMap<String, ApiKeyEntry>,
    cache: DashMap<u64, CachedResolution>,
    cache_ttl: Duration,
}

impl TierResolver {
    pub fn new(config: &AuthConfig, issuer: Arc<dyn CredentialIssuer>) -> Self {
        let api_keys = config
            .api_keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    ApiKeyEntry {
                        tier: k.tier,
                        identity: k.identity.clone(),
                    },
                )
            })
            .collect();

        Self {
            issuer,
            api_keys,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
        }
    }

    /// Resolve a credential into `(tier, capabilities, identity)`.
    pub async fn resolve(&self, credential: Option<&str>) -> Result<Resolution, BrokerError> {
        let credential = match credential.map(str::trim) {
            None | Some("") => return Ok(Resolution::anonymous()),
            Some(c) => c,
        };

        validate_structure(credential)?;

        let key = credential_hash(credential);
        if let Some(entry) = self.cache.get(&key) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.resolution.clone());
            }
            drop(entry);
            self.cache.remove(&key);
        }

        let resolution = self.resolve_uncached(credential).await;

        // Anonymous fallbacks are not cached: a transient issuer outage must
        // not pin a valid credential to `free` for the TTL.
        if resolution.identity.is_some() {
            self.cache.insert(
                key,
                CachedResolution {
                    resolution: resolution.clone(),
                    expires_at: Instant::now() + self.cache_ttl,
                },
            );
        }

        Ok(resolution)
    }

    async fn resolve_uncached(&self, credential: &str) -> Resolution {
        // One external verification call covers both the admin and the
        // federation steps; the priority order is preserved by checking the
        // admin tier before consulting the API-key table.
        let verified = match self.issuer.verify(credential).await {
            Ok(v) if v.valid => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Credential issuer unreachable, falling back");
                None
            }
        };

        if let Some(v) = &verified {
            if v.tier == Some(Tier::Admin) {
                return Resolution::for_tier(Tier::Admin, v.identity.clone());
            }
        }

        if let Some(entry) = self.api_keys.get(credential) {
            return Resolution::for_tier(entry.tier, Some(entry.identity.clone()));
        }

        if let Some(v) = verified {
            if let Some(tier) = v.tier {
                return Resolution::for_tier(tier, v.identity);
            }
        }

        Resolution::anonymous()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Structural validation only: a credential that fails here is malformed,
/// not merely unverifiable.
fn validate_structure(credential: &str) -> Result<(), BrokerError> {
    if credential.len() > MAX_CREDENTIAL_LEN {
        return Err(BrokerError::CredentialMalformed(format!(
            "credential exceeds {} bytes",
            MAX_CREDENTIAL_LEN
        )));
    }
    if credential
        .chars()
        .any(|c| c.is_control() || c.is_whitespace())
    {
        return Err(BrokerError::CredentialMalformed(
            "credential contains control or whitespace characters".to_string(),
        ));
    }
    Ok(())
}

fn credential_hash(credential: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    credential.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyConfig;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_auth_config() -> AuthConfig {
        AuthConfig {
            admin_secret: "admin-secret-for-testing".to_string(),
            federation_secret: Some("federation-secret-for-testing".to_string()),
            issuer: None,
            audience: None,
            api_keys: vec![ApiKeyConfig {
                key: "key-abcdef".to_string(),
                tier: Tier::Wire,
                identity: "svc-reporting".to_string(),
            }],
            cache_ttl_seconds: 60,
        }
    }

    fn make_token(secret: &str, roles: Vec<String>, tier: Option<&str>) -> String {
        let claims = TokenClaims {
            sub: "user-42".to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
            iat: chrono::Utc::now().timestamp(),
            roles,
            tier: tier.map(String::from),
            extra: Default::default(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn make_resolver(config: &AuthConfig) -> TierResolver {
        let issuer = Arc::new(JwtCredentialIssuer::new(config));
        TierResolver::new(config, issuer)
    }

    #[tokio::test]
    async fn test_empty_credential_is_anonymous_free() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        for cred in [None, Some(""), Some("   ")] {
            let resolution = resolver.resolve(cred).await.unwrap();
            assert_eq!(resolution.tier, Tier::Free);
            assert_eq!(resolution.identity, None);
        }
    }

    #[tokio::test]
    async fn test_admin_token_resolves_to_admin() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        let token = make_token(&config.admin_secret, vec!["admin".to_string()], None);
        let resolution = resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(resolution.tier, Tier::Admin);
        assert_eq!(resolution.identity.as_deref(), Some("user-42"));
        assert!(resolution.capabilities.contains(&Capability::Admin));
    }

    #[tokio::test]
    async fn test_api_key_tier_comes_from_metadata() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        let resolution = resolver.resolve(Some("key-abcdef")).await.unwrap();
        assert_eq!(resolution.tier, Tier::Wire);
        assert_eq!(resolution.identity.as_deref(), Some("svc-reporting"));
    }

    #[tokio::test]
    async fn test_federation_token_tier_from_claims() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        let token = make_token(
            config.federation_secret.as_deref().unwrap(),
            vec![],
            Some("extrawire"),
        );
        let resolution = resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(resolution.tier, Tier::Extrawire);
        assert_eq!(resolution.identity.as_deref(), Some("user-42"));
    }

    #[tokio::test]
    async fn test_unverifiable_credential_falls_open_to_free() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        // Well-formed but signed with an unknown secret.
        let token = make_token("not-a-known-secret", vec!["admin".to_string()], None);
        let resolution = resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(resolution.tier, Tier::Free);
        assert_eq!(resolution.identity, None);
    }

    #[tokio::test]
    async fn test_structurally_invalid_credential_is_malformed() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        let err = resolver.resolve(Some("bad\x00token")).await.unwrap_err();
        assert!(matches!(err, BrokerError::CredentialMalformed(_)));

        let oversized = "a".repeat(MAX_CREDENTIAL_LEN + 1);
        let err = resolver.resolve(Some(&oversized)).await.unwrap_err();
        assert!(matches!(err, BrokerError::CredentialMalformed(_)));
    }

    #[tokio::test]
    async fn test_verified_resolutions_are_cached() {
        let config = test_auth_config();
        let resolver = make_resolver(&config);

        resolver.resolve(Some("key-abcdef")).await.unwrap();
        assert_eq!(resolver.cache_len(), 1);

        // Anonymous fallbacks never enter the cache.
        resolver.resolve(Some("not-a-real-credential")).await.unwrap();
        assert_eq!(resolver.cache_len(), 1);
    }

    struct UnreachableIssuer;

    #[async_trait]
    impl CredentialIssuer for UnreachableIssuer {
        async fn verify(&self, _credential: &str) -> Result<Verification, BrokerError> {
            Err(BrokerError::BackendUnavailable("issuer down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_issuer_outage_degrades_to_anonymous() {
        let config = test_auth_config();
        let resolver = TierResolver::new(&config, Arc::new(UnreachableIssuer));

        let resolution = resolver.resolve(Some("sometoken")).await.unwrap();
        assert_eq!(resolution.tier, Tier::Free);
        assert_eq!(resolution.identity, None);
    }
}
