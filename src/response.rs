use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub allowed: bool,
    pub rule_id: String,
    pub entity: String,
}

impl DecisionResponse {
    pub fn new(allowed: bool, rule_id: &str, entity: &str) -> Self {
        Self {
            allowed,
            rule_id: rule_id.to_string(),
            entity: entity.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub status: String,
    pub message: String,
    pub entity: String,
}

impl ClearResponse {
    pub fn cleared(entity: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: "Quota counters reset".to_string(),
            entity: entity.to_string(),
        }
    }
}
