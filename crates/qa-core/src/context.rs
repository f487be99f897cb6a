//! Explicit per-request context.

use serde::{Deserialize, Serialize};

use crate::types::Role;

/// The authenticated caller of a workflow operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn is_manager(&self) -> bool {
        self.role.is_manager()
    }
}

/// Organization and caller for one workflow call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub org_id: String,
    pub caller: Caller,
}

impl RequestContext {
    pub fn new(org_id: impl Into<String>, caller: Caller) -> Self {
        Self {
            org_id: org_id.into(),
            caller,
        }
    }
}
