use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput, CAP_NEEDS_MEMORY};

const DEFAULT_K: usize = 5;

/// Memory retrieval: top-k notes for the query (and any expansion variants
/// an earlier stage produced), ranked by similarity. An unavailable bank
/// degrades to an empty result set.
pub struct Retrieve;

#[async_trait]
impl Stage for Retrieve {
    fn name(&self) -> &'static str {
        super::RETRIEVE
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn optional_input_keys(&self) -> &'static [&'static str] {
        &[keys::EXPAND_VARIANTS, keys::DOMAIN_LABEL]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::RETRIEVAL_NOTES, keys::RETRIEVAL_USED_VARIANTS]
    }

    fn cacheable(&self) -> bool {
        true
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &[CAP_NEEDS_MEMORY]
    }

    async fn run(
        &self,
        ctx: &StageContext,
        view: ScratchpadView<'_>,
        cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        let query = view.require_str(keys::QUERY_TEXT)?;
        let k = cfg["k"].as_u64().unwrap_or(DEFAULT_K as u64) as usize;

        let Some(bank) = &ctx.memory else {
            return Ok(StageOutput::new()
                .write(keys::RETRIEVAL_NOTES, json!([]))
                .write(keys::RETRIEVAL_USED_VARIANTS, json!(false))
                .with_notes("memory bank not attached"));
        };

        let domain = view.opt_str(keys::DOMAIN_LABEL).map(str::to_string);
        let mut queries = vec![query.to_string()];
        let used_variants = match view.opt_array(keys::EXPAND_VARIANTS) {
            Some(variants) => {
                for variant in variants.iter().filter_map(|v| v.as_str()) {
                    if !queries.iter().any(|q| q == variant) {
                        queries.push(variant.to_string());
                    }
                }
                variants.len() > 1
            }
            None => false,
        };

        // Merge per-variant results by note id, keeping the best score.
        let mut merged: HashMap<String, Value> = HashMap::new();
        for q in &queries {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let matches = bank
                .search_text(q, &ctx.tenant_id, domain.as_deref(), k)
                .await;
            for m in matches {
                let score = f64::from(m.similarity);
                let entry = merged.entry(m.note.id.clone());
                match entry {
                    std::collections::hash_map::Entry::Occupied(mut slot) => {
                        let existing = slot.get()["score"].as_f64().unwrap_or(0.0);
                        if score > existing {
                            slot.insert(note_value(&m.note.id, &m.note.text, score, m.note.helpful_count));
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(note_value(&m.note.id, &m.note.text, score, m.note.helpful_count));
                    }
                }
            }
        }

        let mut notes: Vec<Value> = merged.into_values().collect();
        notes.sort_by(|a, b| {
            let sa = a["score"].as_f64().unwrap_or(0.0);
            let sb = b["score"].as_f64().unwrap_or(0.0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a["id"].as_str().cmp(&b["id"].as_str()))
        });
        notes.truncate(k);

        Ok(StageOutput::new()
            .write(keys::RETRIEVAL_NOTES, json!(notes))
            .write(keys::RETRIEVAL_USED_VARIANTS, json!(used_variants)))
    }
}

fn note_value(id: &str, text: &str, score: f64, helpful_count: i64) -> Value {
    json!({
        "id": id,
        "text": text,
        "score": score,
        "helpful_count": helpful_count,
    })
}
