//! Credential verification: pre-shared keys, signed tokens, and discovery
//! key sets.
//!
//! Authentication is fail-closed and never faults the pipeline: every
//! verification path returns `Option<CallerContext>` and logs the refusal
//! reason at debug level. The pre-shared index is held behind an [`ArcSwap`]
//! so a configuration reload replaces the whole map atomically.

mod jwks;

pub use jwks::JwksCache;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{AuthConfig, AuthMode, JwtConfig, OidcConfig};

/// The resolved identity behind one call. Immutable for the call's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    /// Billing/audit subject.
    pub consumer_id: String,
    /// The credential that authenticated this call.
    pub credential_id: String,
    /// Roles used for policy selection.
    pub roles: Vec<String>,
    /// Optional per-caller rate override, requests per minute.
    pub rate_limit_per_minute: Option<u32>,
    /// Email claim, when the token carried one.
    pub email: Option<String>,
    /// Opaque metadata passed through to the audit trail.
    pub metadata: Option<String>,
}

/// One configured pre-shared credential.
///
/// `key` may be the raw secret or its SHA-256 hex; the authenticator indexes
/// both forms so either may appear in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Unique credential identifier.
    pub id: String,
    /// The opaque credential value (raw or SHA-256 hex).
    pub key: String,
    /// Display name for operators.
    #[serde(default)]
    pub name: Option<String>,
    /// Consumer this credential bills to.
    pub consumer_id: String,
    /// Roles granted to callers presenting this credential.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Optional per-caller rate override.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// Credentials past this instant are refused.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Disabled credentials are refused without expiry checks.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// SHA-256 hex digest of a credential string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

type CredentialIndex = HashMap<String, Arc<CredentialRecord>>;

/// Credential → caller-context resolution for all configured modes.
pub struct Authenticator {
    mode: AuthMode,
    index: ArcSwap<CredentialIndex>,
    jwt: Option<JwtConfig>,
    oidc: Option<OidcConfig>,
    jwks: JwksCache,
}

impl Authenticator {
    /// Build an authenticator from the `auth` configuration section.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            mode: config.mode,
            index: ArcSwap::new(Arc::new(build_index(&config.keys))),
            jwt: config.jwt.clone(),
            oidc: config.oidc.clone(),
            jwks: JwksCache::default(),
        }
    }

    /// Atomically replace the pre-shared credential index.
    pub fn reload(&self, keys: &[CredentialRecord]) {
        self.index.store(Arc::new(build_index(keys)));
        debug!(credential_count = keys.len(), "credential index reloaded");
    }

    /// Resolve a presented credential to a caller context.
    ///
    /// Returns `None` for every refusal: missing, unknown, disabled, or
    /// expired credentials; bad signatures; wrong issuer/audience; or a
    /// disallowed email domain. The refusal never surfaces as an error.
    pub async fn authenticate(&self, credential: Option<&str>) -> Option<CallerContext> {
        match self.mode {
            AuthMode::None => Some(CallerContext {
                consumer_id: "anonymous".to_string(),
                credential_id: "none".to_string(),
                roles: vec!["*".to_string()],
                rate_limit_per_minute: None,
                email: None,
                metadata: None,
            }),
            AuthMode::ApiKey => self.authenticate_api_key(credential?),
            AuthMode::Jwt => self.authenticate_jwt(credential?),
            AuthMode::Oidc => self.authenticate_oidc(credential?).await,
        }
    }

    /// Pre-shared lookup: the verbatim key first, then its SHA-256 hex.
    fn authenticate_api_key(&self, key: &str) -> Option<CallerContext> {
        let index = self.index.load();
        let record = index
            .get(key)
            .or_else(|| index.get(&sha256_hex(key)))
            .cloned()?;

        if !record.enabled {
            debug!(credential_id = %record.id, "credential disabled");
            return None;
        }
        if let Some(expires_at) = record.expires_at {
            if Utc::now() >= expires_at {
                debug!(credential_id = %record.id, %expires_at, "credential expired");
                return None;
            }
        }

        Some(CallerContext {
            consumer_id: record.consumer_id.clone(),
            credential_id: record.id.clone(),
            roles: record.roles.clone(),
            rate_limit_per_minute: record.rate_limit_per_minute,
            email: None,
            metadata: record.name.clone(),
        })
    }

    /// Verify a token against the preconfigured shared secret or public key.
    fn authenticate_jwt(&self, token: &str) -> Option<CallerContext> {
        let jwt = self.jwt.as_ref()?;

        let (decoding_key, algorithm) = if let Some(secret) = &jwt.secret {
            (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
        } else if let Some(pem) = &jwt.public_key_pem {
            match DecodingKey::from_rsa_pem(pem.as_bytes()) {
                Ok(key) => (key, Algorithm::RS256),
                Err(e) => {
                    warn!(error = %e, "configured public key is not valid PEM");
                    return None;
                }
            }
        } else {
            warn!("jwt mode configured without secret or public key");
            return None;
        };

        let validation = build_validation(algorithm, jwt.issuer.as_deref(), jwt.audience.as_deref());
        let claims = match decode::<Value>(token, &decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!(error = %e, "token verification failed");
                return None;
            }
        };

        self.context_from_claims(
            &claims,
            jwt.consumer_claim.as_deref(),
            jwt.roles_claim.as_deref(),
            &[],
        )
    }

    /// Verify a token against a key selected by `kid` from a discovery set.
    async fn authenticate_oidc(&self, token: &str) -> Option<CallerContext> {
        let oidc = self.oidc.as_ref()?;

        let header = match decode_header(token) {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "token header unreadable");
                return None;
            }
        };
        let kid = header.kid.or_else(|| {
            debug!("token carries no kid header");
            None
        })?;

        let url = oidc.jwks_url();
        let key_set = self.jwks.get(&url).await?;
        let jwk = key_set.find(&kid).or_else(|| {
            debug!(%kid, "no key in discovery set matches kid");
            None
        })?;
        let decoding_key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(e) => {
                warn!(%kid, error = %e, "discovery key is unusable");
                return None;
            }
        };
        let algorithm = jwk
            .common
            .key_algorithm
            .and_then(|a| a.to_string().parse::<Algorithm>().ok())
            .unwrap_or(Algorithm::RS256);

        let validation =
            build_validation(algorithm, oidc.issuer.as_deref(), oidc.audience.as_deref());
        let claims = match decode::<Value>(token, &decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!(error = %e, "discovery token verification failed");
                return None;
            }
        };

        self.context_from_claims(
            &claims,
            oidc.consumer_claim.as_deref(),
            oidc.roles_claim.as_deref(),
            &oidc.allowed_email_domains,
        )
    }

    /// Derive a caller context from verified claims.
    fn context_from_claims(
        &self,
        claims: &Value,
        consumer_claim: Option<&str>,
        roles_claim: Option<&str>,
        allowed_email_domains: &[String],
    ) -> Option<CallerContext> {
        let consumer_claim = consumer_claim.unwrap_or("sub");
        let consumer_id = claims.get(consumer_claim).and_then(Value::as_str)?;

        let roles_claim = roles_claim.unwrap_or("roles");
        let roles = match claims.get(roles_claim) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            Some(Value::String(role)) => vec![role.clone()],
            _ => Vec::new(),
        };

        let email = claims
            .get("email")
            .and_then(Value::as_str)
            .map(String::from);
        if !allowed_email_domains.is_empty() {
            let domain = email.as_deref().and_then(|e| e.rsplit_once('@')).map(|(_, d)| d);
            match domain {
                Some(d) if allowed_email_domains.iter().any(|allowed| allowed == d) => {}
                _ => {
                    debug!(?email, "email domain not permitted");
                    return None;
                }
            }
        }

        Some(CallerContext {
            consumer_id: consumer_id.to_string(),
            credential_id: "token".to_string(),
            roles,
            rate_limit_per_minute: None,
            email,
            metadata: None,
        })
    }
}

/// Index records by raw key and by SHA-256 hex so configurations may store
/// either form. Later duplicates overwrite earlier ones.
fn build_index(keys: &[CredentialRecord]) -> CredentialIndex {
    let mut index = CredentialIndex::with_capacity(keys.len() * 2);
    for record in keys {
        let record = Arc::new(record.clone());
        index.insert(record.key.clone(), Arc::clone(&record));
        index.insert(sha256_hex(&record.key), record);
    }
    index
}

fn build_validation(
    algorithm: Algorithm,
    issuer: Option<&str>,
    audience: Option<&str>,
) -> Validation {
    let mut validation = Validation::new(algorithm);
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }
    match audience {
        Some(audience) => validation.set_audience(&[audience]),
        // jsonwebtoken rejects tokens carrying `aud` unless an audience is
        // configured; without one we accept any.
        None => validation.validate_aud = false,
    }
    validation
}
