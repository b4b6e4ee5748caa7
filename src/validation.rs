use crate::error::ThrottlerError;

/// Longest entity identifier accepted from the HTTP surface.
pub const MAX_ENTITY_BYTES: usize = 256;

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates an entity path segment and returns its identifier bytes.
    pub fn validate_entity(entity: &str) -> Result<Vec<u8>, ThrottlerError> {
        if entity.trim().is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Entity identifier cannot be empty".to_string(),
            ));
        }

        if entity.len() > MAX_ENTITY_BYTES {
            return Err(ThrottlerError::ValidationError(format!(
                "Entity identifier exceeds {} bytes",
                MAX_ENTITY_BYTES
            )));
        }

        if entity.chars().any(char::is_control) {
            return Err(ThrottlerError::ValidationError(
                "Entity identifier contains control characters".to_string(),
            ));
        }

        Ok(entity.as_bytes().to_vec())
    }
}
