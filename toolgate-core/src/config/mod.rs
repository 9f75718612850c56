//! Gateway configuration: schema, loading, and validation.
//!
//! One YAML or JSON document configures the whole gateway. The loader
//! rejects structurally broken documents up front so the pipeline never
//! sees a half-formed configuration.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{load, parse};
pub use schema::{
    AuditConfig, AuthConfig, AuthMode, Config, JwtConfig, MeteringConfig, OidcConfig,
    RateLimitConfig, ServerConfig,
};
