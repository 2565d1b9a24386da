use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stage invocation inside a plan: which stage, with what config, and
/// the scratchpad keys it is allowed to read and expected to write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default)]
    pub config: Value,
    /// Keys this invocation may read. Resolved at plan build time from the
    /// stage's required inputs plus any optional inputs an earlier stage
    /// produces.
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

/// Ordered stage sequence. Adjacent specs sharing a `parallel_group` tag may
/// run concurrently; everything else is sequential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagePlan {
    pub stages: Vec<StageSpec>,
}

impl StagePlan {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.stage.clone()).collect()
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }

    /// Split the plan into runnable groups: runs of adjacent stages sharing
    /// a `parallel_group` tag collapse into one group, everything else is a
    /// singleton group.
    pub fn groups(&self) -> Vec<Vec<&StageSpec>> {
        let mut groups: Vec<Vec<&StageSpec>> = Vec::new();
        for spec in &self.stages {
            match (groups.last_mut(), &spec.parallel_group) {
                (Some(last), Some(tag))
                    if last
                        .first()
                        .and_then(|s| s.parallel_group.as_deref())
                        .is_some_and(|t| t == tag.as_str()) =>
                {
                    last.push(spec);
                }
                _ => groups.push(vec![spec]),
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, group: Option<&str>) -> StageSpec {
        StageSpec {
            stage: name.to_string(),
            config: Value::Null,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            cacheable: false,
            idempotent: false,
            parallel_group: group.map(|g| g.to_string()),
        }
    }

    #[test]
    fn adjacent_tagged_stages_group_together() {
        let plan = StagePlan {
            stages: vec![
                spec("a", Some("prelude")),
                spec("b", Some("prelude")),
                spec("c", None),
                spec("d", Some("prelude")),
            ],
        };
        let groups = plan.groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[2].len(), 1);
    }

    #[test]
    fn untagged_stages_stay_sequential() {
        let plan = StagePlan {
            stages: vec![spec("a", None), spec("b", None)],
        };
        assert_eq!(plan.groups().len(), 2);
    }
}
