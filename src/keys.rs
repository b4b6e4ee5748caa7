//! Key construction for quota records.

use std::path::PathBuf;

use crate::error::ThrottlerError;

/// Prefix shared by every quota record key.
pub const KEY_PREFIX: &str = "throttle";

/// Default table name when none is configured.
pub const DEFAULT_TABLE: &str = "quota_throttle";

/// Hex rendering of an opaque entity identifier.
pub fn entity_hex(entity: &[u8]) -> String {
    entity.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Store key for one (rule, entity) pair.
///
/// The rule id is kept verbatim; the entity is hex encoded, so the last
/// separator always splits the two unambiguously.
pub fn record_key(rule_id: &str, entity: &[u8]) -> String {
    format!("{}:{}:{}", KEY_PREFIX, rule_id, entity_hex(entity))
}

/// Sanitize a rule id for use as a file name
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Location of the embedded store used when persistence is on and no URI is given.
pub fn default_store_path(rule_id: &str) -> PathBuf {
    std::env::temp_dir()
        .join("quota-throttler")
        .join(format!("{}.db", sanitize_key(rule_id)))
}

/// Table names are interpolated into SQL and must be plain identifiers.
pub fn validate_table_name(table: &str) -> Result<(), ThrottlerError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ThrottlerError::ValidationError(format!(
            "Table name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
            table
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_hex_encodes_entity() {
        assert_eq!(record_key("rid", b"pid"), "throttle:rid:706964");
    }

    #[test]
    fn test_record_key_handles_binary_entities() {
        assert_eq!(record_key("rid", &[0x00, 0xff, b':']), "throttle:rid:00ff3a");
    }

    #[test]
    fn test_rules_do_not_share_keys() {
        assert_ne!(record_key("rid", b"pid"), record_key("different_rule", b"pid"));
        assert_ne!(record_key("team.a", b"pid"), record_key("team_a", b"pid"));
        assert_ne!(record_key("team a", b"pid"), record_key("team_a", b"pid"));
        assert_eq!(record_key("team.a", b"pid"), "throttle:team.a:706964");
    }

    #[test]
    fn test_sanitize_key() {
        let key = "test@key#with$special%chars";
        let sanitized = sanitize_key(key);
        assert_eq!(sanitized, "test_key_with_special_chars");
    }

    #[test]
    fn test_default_store_path_uses_rule_id() {
        let path = default_store_path("my rule/../x");
        assert_eq!(path.file_name().unwrap(), "my_rule____x.db");
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("quota_throttle").is_ok());
        assert!(validate_table_name("_custom2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2fast").is_err());
        assert!(validate_table_name("t; drop table x").is_err());
    }
}
