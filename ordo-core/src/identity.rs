use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequesterRole {
    /// Self-service caller; may only touch orders they own.
    Owner,
    Admin,
}

/// Who is asking, as supplied by the authorization collaborator.
///
/// Threaded explicitly through every cancellation call; nothing in the engine
/// looks the caller up from ambient state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequesterContext {
    pub caller_id: String,
    pub role: RequesterRole,
}

impl RequesterContext {
    pub fn owner(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            role: RequesterRole::Owner,
        }
    }

    pub fn admin(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            role: RequesterRole::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == RequesterRole::Admin
    }

    /// Admins act on any order; owners only on their own.
    pub fn may_access(&self, owner_id: &str) -> bool {
        self.is_admin() || self.caller_id == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_scope() {
        let ctx = RequesterContext::owner("member-7");
        assert!(ctx.may_access("member-7"));
        assert!(!ctx.may_access("member-8"));
    }

    #[test]
    fn test_admin_scope() {
        let ctx = RequesterContext::admin("ops-1");
        assert!(ctx.may_access("member-8"));
    }
}
