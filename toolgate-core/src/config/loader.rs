//! Document loading and structural validation.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use super::error::ConfigError;
use super::schema::{AuthMode, Config};

/// Load and validate a configuration document from disk.
///
/// The document may be YAML or JSON; JSON parses as a YAML subset.
///
/// # Errors
///
/// Returns [`ConfigError`] for unreadable files, parse failures, and every
/// structural rule [`parse`] enforces.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let config = parse(&text)?;
    info!(
        path = %path.display(),
        server_count = config.servers.len(),
        policy_count = config.policies.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Parse and validate a configuration document from text.
///
/// # Errors
///
/// Returns [`ConfigError`] when the document fails to parse, lacks the
/// `auth` or `audit` sections, declares no policies, repeats a server or
/// policy id, leaves a server without a command, or leaves a pre-shared
/// credential without `id`, `key`, or `consumer_id`.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let Some(auth) = &config.auth else {
        return Err(ConfigError::MissingAuth);
    };
    if config.audit.is_none() {
        return Err(ConfigError::MissingAudit);
    }
    if config.policies.is_empty() {
        return Err(ConfigError::NoPolicies);
    }

    let mut server_ids = HashSet::new();
    for server in &config.servers {
        if !server_ids.insert(server.id.as_str()) {
            return Err(ConfigError::DuplicateServerId {
                id: server.id.clone(),
            });
        }
        if server.command.is_empty() {
            return Err(ConfigError::MissingServerCommand {
                id: server.id.clone(),
            });
        }
    }

    let mut policy_ids = HashSet::new();
    for policy in &config.policies {
        if !policy_ids.insert(policy.id.as_str()) {
            return Err(ConfigError::DuplicatePolicyId {
                id: policy.id.clone(),
            });
        }
    }

    if auth.mode == AuthMode::ApiKey {
        for (index, key) in auth.keys.iter().enumerate() {
            let field = if key.id.is_empty() {
                Some("id")
            } else if key.key.is_empty() {
                Some("key")
            } else if key.consumer_id.is_empty() {
                Some("consumer_id")
            } else {
                None
            };
            if let Some(field) = field {
                return Err(ConfigError::InvalidCredential { index, field });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
auth:
  mode: none
policies:
  - id: allow-all
    name: allow everything
    roles: ["*"]
    rules:
      - action: allow
audit:
  path: ":memory:"
"#;

    #[test]
    fn test_parse_minimal_yaml() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.policies.len(), 1);
        assert!(config.servers.is_empty());
        assert!(config.audit.unwrap().chain);
        assert_eq!(config.rate_limit.per_minute, 60);
        assert!((config.rate_limit.burst_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_json_document() {
        let text = r#"{
            "auth": {"mode": "none"},
            "policies": [{"id": "p", "name": "p", "roles": ["*"], "rules": [{"action": "allow"}]}],
            "audit": {"path": ":memory:"}
        }"#;
        assert!(parse(text).is_ok());
    }

    #[test]
    fn test_missing_auth_rejected() {
        let text = r#"
policies:
  - id: p
    name: p
    roles: ["*"]
    rules: [{action: allow}]
audit:
  path: ":memory:"
"#;
        assert!(matches!(parse(text), Err(ConfigError::MissingAuth)));
    }

    #[test]
    fn test_missing_audit_rejected() {
        let text = r#"
auth: {mode: none}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
"#;
        assert!(matches!(parse(text), Err(ConfigError::MissingAudit)));
    }

    #[test]
    fn test_zero_policies_rejected() {
        let text = r#"
auth: {mode: none}
policies: []
audit: {path: ":memory:"}
"#;
        assert!(matches!(parse(text), Err(ConfigError::NoPolicies)));
    }

    #[test]
    fn test_duplicate_server_id_rejected() {
        let text = r#"
auth: {mode: none}
servers:
  - {id: fs, command: echo}
  - {id: fs, command: echo}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
audit: {path: ":memory:"}
"#;
        assert!(matches!(
            parse(text),
            Err(ConfigError::DuplicateServerId { id }) if id == "fs"
        ));
    }

    #[test]
    fn test_duplicate_policy_id_rejected() {
        let text = r#"
auth: {mode: none}
policies:
  - {id: p, name: a, roles: ["*"], rules: [{action: allow}]}
  - {id: p, name: b, roles: ["*"], rules: [{action: deny}]}
audit: {path: ":memory:"}
"#;
        assert!(matches!(
            parse(text),
            Err(ConfigError::DuplicatePolicyId { id }) if id == "p"
        ));
    }

    #[test]
    fn test_missing_server_command_rejected() {
        let text = r#"
auth: {mode: none}
servers:
  - {id: fs}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
audit: {path: ":memory:"}
"#;
        assert!(matches!(
            parse(text),
            Err(ConfigError::MissingServerCommand { id }) if id == "fs"
        ));
    }

    #[test]
    fn test_credential_missing_fields_rejected() {
        let text = r#"
auth:
  mode: api_key
  keys:
    - {id: k1, key: "", consumer_id: acme}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
audit: {path: ":memory:"}
"#;
        assert!(matches!(
            parse(text),
            Err(ConfigError::InvalidCredential { index: 0, field: "key" })
        ));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let text = r#"
auth: {mode: none}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
audit: {path: ":memory:"}
surprise: true
"#;
        assert!(matches!(parse(text), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_rate_limit_camel_case_alias() {
        let text = r#"
auth: {mode: none}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
audit: {path: ":memory:"}
rateLimit: {per_minute: 5, burst_multiplier: 3.0}
"#;
        let config = parse(text).unwrap();
        assert_eq!(config.rate_limit.per_minute, 5);
    }

    #[test]
    fn test_server_defaults() {
        let text = r#"
auth: {mode: none}
servers:
  - {id: fs, command: "npx", args: ["server-fs"]}
policies:
  - {id: p, name: p, roles: ["*"], rules: [{action: allow}]}
audit: {path: ":memory:"}
"#;
        let config = parse(text).unwrap();
        let server = &config.servers[0];
        assert!(server.enabled);
        assert_eq!(server.timeout_ms, 30_000);
        assert!(!server.health_check);
    }
}
