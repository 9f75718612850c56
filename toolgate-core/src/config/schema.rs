//! Configuration schema type definitions.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::auth::CredentialRecord;
use crate::policy::Policy;

/// Root configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Caller authentication.
    pub auth: Option<AuthConfig>,

    /// Managed backends.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Role-based policies.
    #[serde(default)]
    pub policies: Vec<Policy>,

    /// Audit log settings.
    pub audit: Option<AuditConfig>,

    /// Usage metering settings.
    #[serde(default)]
    pub metering: MeteringConfig,

    /// Rate limiting settings.
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: RateLimitConfig,

    /// Listen port for an HTTP front-end, when one is attached.
    #[serde(default)]
    pub port: Option<u16>,

    /// Listen host for an HTTP front-end, when one is attached.
    #[serde(default)]
    pub host: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

/// Credential verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Every caller is anonymous with the wildcard role.
    None,
    /// Pre-shared keys looked up verbatim or by SHA-256 hex.
    ApiKey,
    /// Signed tokens verified with a preconfigured secret or public key.
    Jwt,
    /// Signed tokens verified against a discovery key set selected by `kid`.
    Oidc,
}

/// The `auth` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Verification mode.
    pub mode: AuthMode,
    /// Pre-shared credentials (api_key mode).
    #[serde(default)]
    pub keys: Vec<CredentialRecord>,
    /// Token settings (jwt mode).
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    /// Discovery settings (oidc mode).
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

/// Signed-token verification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwtConfig {
    /// HS256 shared secret. Mutually exclusive with `public_key_pem`.
    #[serde(default)]
    pub secret: Option<String>,
    /// RS256 public key in PEM form.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    /// Required `iss` claim, when set.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Required `aud` claim, when set.
    #[serde(default)]
    pub audience: Option<String>,
    /// Claim naming the consumer. Defaults to `sub`.
    #[serde(default)]
    pub consumer_claim: Option<String>,
    /// Claim carrying roles (scalar or array). Defaults to `roles`.
    #[serde(default)]
    pub roles_claim: Option<String>,
}

/// Discovery-signed-token verification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OidcConfig {
    /// Issuer URL. Also derives the key-set URL when `jwks_url` is absent.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Explicit key-set URL.
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Required `aud` claim, when set.
    #[serde(default)]
    pub audience: Option<String>,
    /// Claim naming the consumer. Defaults to `sub`.
    #[serde(default)]
    pub consumer_claim: Option<String>,
    /// Claim carrying roles. Defaults to `roles`.
    #[serde(default)]
    pub roles_claim: Option<String>,
    /// Permitted email domains; empty means unrestricted.
    #[serde(default)]
    pub allowed_email_domains: Vec<String>,
}

impl OidcConfig {
    /// The key-set URL: explicit, or issuer plus the standard suffix.
    pub fn jwks_url(&self) -> String {
        if let Some(url) = &self.jwks_url {
            return url.clone();
        }
        let issuer = self.issuer.as_deref().unwrap_or_default();
        format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Servers
// ─────────────────────────────────────────────────────────────────────────────

/// One managed backend descriptor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique backend identifier.
    pub id: String,
    /// Display name for operators.
    #[serde(default)]
    pub name: Option<String>,
    /// Launch command.
    #[serde(default)]
    pub command: String,
    /// Launch arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlaid on the gateway's own environment at spawn.
    /// Values may hold secrets and are never exposed to callers.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Disabled backends refuse `start`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-call proxy deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Whether the supervisor should health-check this backend.
    #[serde(default)]
    pub health_check: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit / metering / rate limit
// ─────────────────────────────────────────────────────────────────────────────

/// The `audit` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Path to the embedded store. `:memory:` keeps the log in-process.
    pub path: PathBuf,
    /// Whether entries are hash-chained.
    #[serde(default = "default_true")]
    pub chain: bool,
    /// Optional fire-and-forget webhook for each entry.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// The `metering` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeteringConfig {
    /// Disabled metering accepts records as no-ops.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Background flush interval in seconds.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_flush_interval_secs() -> u64 {
    60
}

/// The `rate_limit` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Default per-key requests per minute.
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    /// Admission cap multiplier applied to the per-minute limit.
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            burst_multiplier: default_burst_multiplier(),
        }
    }
}

fn default_per_minute() -> u32 {
    60
}

fn default_burst_multiplier() -> f64 {
    2.0
}
