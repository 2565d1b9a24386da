//! Built-in stage library. Stage names are the registry keys and the
//! identities that appear in plans, events and provenance.

use std::sync::Arc;

use crate::stage::StageRegistry;

pub mod context_assembly;
pub mod decompose;
pub mod domain_detect;
pub mod model_call;
pub mod query_expand;
pub mod recurse;
pub mod refine;
pub mod retrieve;
pub mod synthesize;

pub const DOMAIN_DETECT: &str = "domain_detect";
pub const QUERY_EXPAND: &str = "query_expand";
pub const RETRIEVE: &str = "retrieve";
pub const TEACHER_CALL: &str = "teacher_call";
pub const STUDENT_CALL: &str = "student_call";
pub const DECOMPOSE: &str = "decompose";
pub const RECURSE: &str = "recurse";
pub const CONTEXT_ASSEMBLY: &str = "context_assembly";
pub const REFINE: &str = "refine";
pub const SYNTHESIZE: &str = "synthesize";

/// Every built-in stage, registered under its canonical name.
pub fn builtin_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(domain_detect::DomainDetect));
    registry.register(Arc::new(query_expand::QueryExpand));
    registry.register(Arc::new(retrieve::Retrieve));
    registry.register(Arc::new(model_call::ModelCall::teacher()));
    registry.register(Arc::new(model_call::ModelCall::student()));
    registry.register(Arc::new(decompose::Decompose));
    registry.register(Arc::new(recurse::Recurse));
    registry.register(Arc::new(context_assembly::ContextAssembly));
    registry.register(Arc::new(refine::Refine));
    registry.register(Arc::new(synthesize::Synthesize));
    registry
}
