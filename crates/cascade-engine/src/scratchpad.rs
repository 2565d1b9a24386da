use serde_json::{Map, Value};

use crate::error::{StageError, StageErrorKind};

/// Per-session keyed store passed through the plan. Writes are append-only:
/// a second write to any key is a logic error and fails the writing stage.
#[derive(Debug, Default, Clone)]
pub struct Scratchpad {
    values: Map<String, Value>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self { values: Map::new() }
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), StageError> {
        if !is_namespaced(key) {
            return Err(StageError::new(
                StageErrorKind::Internal,
                format!("scratchpad key `{key}` is not namespaced"),
            ));
        }
        if self.values.contains_key(key) {
            return Err(StageError::new(
                StageErrorKind::Internal,
                format!("scratchpad key `{key}` written twice"),
            ));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }

    /// Read view scoped to the keys a stage declared. Reads outside the
    /// declaration are logic errors, not misses.
    pub fn view<'a>(&'a self, allowed: &'a [String]) -> ScratchpadView<'a> {
        ScratchpadView {
            pad: self,
            allowed,
        }
    }
}

fn is_namespaced(key: &str) -> bool {
    match key.split_once('.') {
        Some((ns, field)) => !ns.is_empty() && !field.is_empty(),
        None => false,
    }
}

pub struct ScratchpadView<'a> {
    pad: &'a Scratchpad,
    allowed: &'a [String],
}

impl ScratchpadView<'_> {
    pub fn get(&self, key: &str) -> Result<Option<&Value>, StageError> {
        if !self.allowed.iter().any(|k| k == key) {
            return Err(StageError::new(
                StageErrorKind::Internal,
                format!("stage read undeclared scratchpad key `{key}`"),
            ));
        }
        Ok(self.pad.get(key))
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, StageError> {
        Ok(self.get(key)?.and_then(|v| v.as_str()))
    }

    /// Required string input; absence is a logic error at this point because
    /// the planner validated producers.
    pub fn require_str(&self, key: &str) -> Result<&str, StageError> {
        self.get_str(key)?.ok_or_else(|| {
            StageError::new(
                StageErrorKind::Internal,
                format!("required scratchpad key `{key}` missing"),
            )
        })
    }

    pub fn get_array(&self, key: &str) -> Result<Option<&Vec<Value>>, StageError> {
        Ok(self.get(key)?.and_then(|v| v.as_array()))
    }

    /// Optional-input read: None when the key is absent or when the planner
    /// did not grant it for this invocation. Required inputs use `get`,
    /// which treats an undeclared read as a logic error.
    pub fn opt(&self, key: &str) -> Option<&Value> {
        if !self.allowed.iter().any(|k| k == key) {
            return None;
        }
        self.pad.get(key)
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.opt(key).and_then(|v| v.as_str())
    }

    pub fn opt_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.opt(key).and_then(|v| v.as_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn double_write_is_a_logic_error() {
        let mut pad = Scratchpad::new();
        pad.insert("domain.label", json!("general")).unwrap();
        let err = pad.insert("domain.label", json!("other")).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Internal);
        assert!(err.message.contains("written twice"));
    }

    #[test]
    fn unnamespaced_key_is_rejected() {
        let mut pad = Scratchpad::new();
        assert!(pad.insert("label", json!(1)).is_err());
        assert!(pad.insert(".label", json!(1)).is_err());
        assert!(pad.insert("label.", json!(1)).is_err());
    }

    #[test]
    fn view_rejects_undeclared_reads() {
        let mut pad = Scratchpad::new();
        pad.insert("query.text", json!("hi")).unwrap();
        let allowed = vec!["query.text".to_string()];
        let view = pad.view(&allowed);

        assert_eq!(view.get_str("query.text").unwrap(), Some("hi"));
        let err = view.get("domain.label").unwrap_err();
        assert!(err.message.contains("undeclared"));
    }

    #[test]
    fn declared_but_absent_key_reads_as_none() {
        let pad = Scratchpad::new();
        let allowed = vec!["expand.variants".to_string()];
        let view = pad.view(&allowed);
        assert!(view.get("expand.variants").unwrap().is_none());
    }
}
