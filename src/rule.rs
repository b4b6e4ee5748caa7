use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::keys::entity_hex;
use crate::policy::ThrottlePolicy;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_type: Option<String>,
    pub device_id: Vec<u8>,
    pub profile_id: Vec<u8>,
}

impl ApprovalRequest {
    pub fn for_profile(profile_id: impl Into<Vec<u8>>) -> Self {
        let profile_id = profile_id.into();
        Self {
            request_type: None,
            device_id: profile_id.clone(),
            profile_id,
        }
    }
}

/// One independent yes/no rule.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Never fails: any error is a denial.
    fn approve_request(&self, request: &ApprovalRequest) -> bool;

    /// Commit whatever `approve_request` reserved.
    fn use_quota(&self, _request: &ApprovalRequest) -> Result<()> {
        Ok(())
    }

    /// Drop a reservation after another rule denied the request.
    fn release(&self, _request: &ApprovalRequest) -> Result<()> {
        Ok(())
    }

    fn at_quota(&self, _request: &ApprovalRequest) -> bool {
        false
    }

    fn clear_quota(&self, _request: &ApprovalRequest) -> Result<()> {
        Ok(())
    }
}

impl Rule for ThrottlePolicy {
    fn name(&self) -> &str {
        self.rule_id()
    }

    fn approve_request(&self, request: &ApprovalRequest) -> bool {
        match self.approve(&request.profile_id) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    rule_id = self.rule_id(),
                    entity = %entity_hex(&request.profile_id),
                    error = %e,
                    "Quota check failed, denying"
                );
                false
            }
        }
    }

    fn use_quota(&self, request: &ApprovalRequest) -> Result<()> {
        ThrottlePolicy::use_quota(self, &request.profile_id).map(|_| ())
    }

    fn release(&self, request: &ApprovalRequest) -> Result<()> {
        ThrottlePolicy::release(self, &request.profile_id)
    }

    fn at_quota(&self, request: &ApprovalRequest) -> bool {
        // An unreadable store cannot prove there is budget left.
        ThrottlePolicy::at_quota(self, &request.profile_id).unwrap_or(true)
    }

    fn clear_quota(&self, request: &ApprovalRequest) -> Result<()> {
        self.clear(&request.profile_id)
    }
}

/// Conjunction of rules with deferred commit.
#[derive(Default, Clone)]
pub struct RuleSet {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: Arc<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True only if every rule approves. On denial, reservations taken by
    /// rules that had already approved are released.
    pub fn approve_request(&self, request: &ApprovalRequest) -> bool {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.approve_request(request) {
                continue;
            }

            for approved in &self.rules[..index] {
                if let Err(e) = approved.release(request) {
                    warn!(rule = approved.name(), error = %e, "Failed to release reservation");
                }
            }
            return false;
        }
        true
    }

    /// Commit every rule's reservation after a successful approval.
    pub fn use_quota(&self, request: &ApprovalRequest) -> Result<()> {
        for rule in &self.rules {
            rule.use_quota(request)?;
        }
        Ok(())
    }

    pub fn approve_and_use(&self, request: &ApprovalRequest) -> Result<bool> {
        if !self.approve_request(request) {
            return Ok(false);
        }
        self.use_quota(request)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ThrottleConfig;
    use crate::kv::MemoryStore;
    use chrono::{Local, TimeZone};

    struct Deny;

    impl Rule for Deny {
        fn name(&self) -> &str {
            "deny"
        }

        fn approve_request(&self, _request: &ApprovalRequest) -> bool {
            false
        }
    }

    fn throttle(rule_id: &str, per_day: u64) -> Arc<ThrottlePolicy> {
        let clock = Arc::new(ManualClock::new(Local.with_ymd_and_hms(2022, 3, 9, 17, 0, 0).unwrap()));
        Arc::new(
            ThrottlePolicy::with_store(
                ThrottleConfig::new(rule_id).with_per_day(per_day),
                Arc::new(MemoryStore::new("quota_throttle")),
                clock,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_single_throttle_rule() {
        let rules = RuleSet::new().with_rule(throttle("rid", 2));
        let req = ApprovalRequest::for_profile(b"pid".to_vec());

        assert!(rules.approve_and_use(&req).unwrap());
        assert!(rules.approve_request(&req));
        rules.use_quota(&req).unwrap();
        assert!(!rules.approve_request(&req));
    }

    #[test]
    fn test_later_denial_does_not_consume_quota() {
        let limited = throttle("rid", 1);
        let rules = RuleSet::new()
            .with_rule(limited.clone())
            .with_rule(Arc::new(Deny));
        let req = ApprovalRequest::for_profile(b"pid".to_vec());

        assert!(!rules.approve_request(&req));
        assert!(!rules.approve_request(&req));

        let status = limited.status(b"pid").unwrap();
        assert_eq!(status.day_count, 0);
        assert!(!status.at_quota);
        assert_eq!(limited.store().get("rid", b"pid").unwrap().lock_token, None);
    }

    #[test]
    fn test_trait_level_quota_ops() {
        let limited = throttle("rid", 1);
        let req = ApprovalRequest::for_profile(b"pid".to_vec());

        assert!(!Rule::at_quota(limited.as_ref(), &req));
        assert!(limited.approve_request(&req));
        Rule::use_quota(limited.as_ref(), &req).unwrap();
        assert!(Rule::at_quota(limited.as_ref(), &req));

        limited.clear_quota(&req).unwrap();
        assert!(!Rule::at_quota(limited.as_ref(), &req));
    }

    #[test]
    fn test_empty_rule_set_approves() {
        let rules = RuleSet::new();
        assert!(rules.is_empty());
        assert!(rules.approve_request(&ApprovalRequest::default()));
    }
}
