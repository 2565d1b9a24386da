use serde::{Deserialize, Serialize};

use crate::budget::Budget;

/// Hard ceiling on query text size. A query at exactly this size is accepted.
pub const MAX_QUERY_BYTES: usize = 32 * 1024;

/// Immutable pipeline input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_hint: Option<String>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub trace: bool,
}

fn default_tenant() -> String {
    "default".to_string()
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            domain_hint: None,
            tenant_id: default_tenant(),
            budget: Budget::default(),
            trace: false,
        }
    }

    /// Validate the query shape. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("query text must not be empty".to_string());
        }
        if self.text.len() > MAX_QUERY_BYTES {
            return Err(format!(
                "query text exceeds {} bytes (got {})",
                MAX_QUERY_BYTES,
                self.text.len()
            ));
        }
        if self.tenant_id.trim().is_empty() {
            return Err("tenant_id must not be empty".to_string());
        }
        self.budget.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_is_rejected() {
        let query = Query::new("   ");
        assert!(query.validate().is_err());
    }

    #[test]
    fn query_at_exact_limit_is_accepted() {
        let query = Query::new("x".repeat(MAX_QUERY_BYTES));
        assert!(query.validate().is_ok());
    }

    #[test]
    fn query_over_limit_is_rejected() {
        let query = Query::new("x".repeat(MAX_QUERY_BYTES + 1));
        assert!(query.validate().unwrap_err().contains("exceeds"));
    }
}
