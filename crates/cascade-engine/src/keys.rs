//! Well-known scratchpad keys. Keys are namespaced `<stage>.<field>`; the
//! scratchpad rejects anything else.

pub const QUERY_TEXT: &str = "query.text";
pub const QUERY_DOMAIN_HINT: &str = "query.domain_hint";

pub const DOMAIN_LABEL: &str = "domain.label";
pub const DOMAIN_CONFIDENCE: &str = "domain.confidence";

pub const EXPAND_VARIANTS: &str = "expand.variants";

pub const RETRIEVAL_NOTES: &str = "retrieval.notes";
pub const RETRIEVAL_USED_VARIANTS: &str = "retrieval.used_variants";

pub const TEACHER_ANSWER: &str = "teacher.answer";
pub const TEACHER_CITATIONS: &str = "teacher.citations";

pub const STUDENT_ANSWER: &str = "student.answer";

pub const DECOMPOSE_STEPS: &str = "decompose.steps";

pub const RECURSE_STEP_RESULTS: &str = "recurse.step_results";

pub const CONTEXT_PLAYBOOK: &str = "context.playbook";

pub const REFINE_FINAL: &str = "refine.final";
pub const REFINE_SCORE_HISTORY: &str = "refine.score_history";

pub const FINAL_ANSWER: &str = "final.answer";
pub const FINAL_PROVENANCE: &str = "final.provenance";
