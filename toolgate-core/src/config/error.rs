//! Configuration load and validation errors.

use std::path::PathBuf;

/// Errors raised while loading or validating a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document could not be read from disk.
    #[error("failed to read config {}: {reason}", path.display())]
    Io {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error text.
        reason: String,
    },

    /// The document is not valid YAML/JSON or does not match the schema.
    #[error("failed to parse config: {reason}")]
    Parse {
        /// Parser error text, including the offending path when available.
        reason: String,
    },

    /// The top-level `auth` section is absent.
    #[error("config is missing the auth section")]
    MissingAuth,

    /// The document declares no policies; the gateway would deny everything
    /// silently, which is always a configuration mistake.
    #[error("config declares no policies")]
    NoPolicies,

    /// The top-level `audit` section is absent.
    #[error("config is missing the audit section")]
    MissingAudit,

    /// Two servers share an id.
    #[error("duplicate server id: {id}")]
    DuplicateServerId {
        /// The repeated identifier.
        id: String,
    },

    /// Two policies share an id.
    #[error("duplicate policy id: {id}")]
    DuplicatePolicyId {
        /// The repeated identifier.
        id: String,
    },

    /// A server entry has an empty launch command.
    #[error("server {id} is missing a command")]
    MissingServerCommand {
        /// The server missing its command.
        id: String,
    },

    /// A pre-shared credential is missing a required field.
    #[error("credential at index {index} is missing {field}")]
    InvalidCredential {
        /// Position in the `auth.keys` list.
        index: usize,
        /// The empty field: `id`, `key`, or `consumer_id`.
        field: &'static str,
    },
}
