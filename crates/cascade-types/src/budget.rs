use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Which model-client identity a call is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Teacher,
    Student,
}

impl ModelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelRole::Teacher => "teacher",
            ModelRole::Student => "student",
        }
    }
}

/// Compound resource envelope for a session. Monotonically consumed;
/// any field exceeded aborts the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub max_wall_ms: u64,
    pub max_cost_micros: u64,
    pub max_teacher_calls: u32,
    pub max_student_calls: u32,
    pub max_stages: u32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_wall_ms: 30_000,
            max_cost_micros: 5_000_000,
            max_teacher_calls: 4,
            max_student_calls: 8,
            max_stages: 12,
        }
    }
}

impl Budget {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_wall_ms == 0 {
            return Err("budget.max_wall_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// The budget field that tripped first, for error summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetField {
    WallMs,
    CostMicros,
    TeacherCalls,
    StudentCalls,
    Stages,
}

impl std::fmt::Display for BudgetField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetField::WallMs => write!(f, "max_wall_ms"),
            BudgetField::CostMicros => write!(f, "max_cost_micros"),
            BudgetField::TeacherCalls => write!(f, "max_teacher_calls"),
            BudgetField::StudentCalls => write!(f, "max_student_calls"),
            BudgetField::Stages => write!(f, "max_stages"),
        }
    }
}

/// Accumulated session totals, snapshotted into the final result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub cost_micros: u64,
    pub wall_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub teacher_calls: u32,
    pub student_calls: u32,
    pub stages_run: u32,
    pub cache_hits: u32,
}

/// Shared, atomically-updated view of a session budget.
///
/// Model calls reserve before dispatch (`try_reserve_call`, `check_cost`) so
/// a call that would exceed the remaining budget is refused synchronously;
/// actual spend is recorded after the fact. Wall time is owned by the
/// scheduler, which stamps elapsed time between stages.
#[derive(Debug)]
pub struct BudgetMeter {
    budget: Budget,
    cost_micros: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    wall_ms: AtomicU64,
    teacher_calls: AtomicU32,
    student_calls: AtomicU32,
    stages_run: AtomicU32,
    cache_hits: AtomicU32,
}

impl BudgetMeter {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            cost_micros: AtomicU64::new(0),
            tokens_in: AtomicU64::new(0),
            tokens_out: AtomicU64::new(0),
            wall_ms: AtomicU64::new(0),
            teacher_calls: AtomicU32::new(0),
            student_calls: AtomicU32::new(0),
            stages_run: AtomicU32::new(0),
            cache_hits: AtomicU32::new(0),
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn remaining_cost_micros(&self) -> u64 {
        self.budget
            .max_cost_micros
            .saturating_sub(self.cost_micros.load(Ordering::SeqCst))
    }

    /// Refuse synchronously if `estimate` does not fit the remaining spend.
    pub fn check_cost(&self, estimate: u64) -> Result<(), BudgetField> {
        if estimate > self.remaining_cost_micros() {
            Err(BudgetField::CostMicros)
        } else {
            Ok(())
        }
    }

    /// Reserve one model call for `role`. Returns the tripped field when the
    /// per-role call budget is already spent.
    pub fn try_reserve_call(&self, role: ModelRole) -> Result<(), BudgetField> {
        let (counter, max, field) = match role {
            ModelRole::Teacher => (
                &self.teacher_calls,
                self.budget.max_teacher_calls,
                BudgetField::TeacherCalls,
            ),
            ModelRole::Student => (
                &self.student_calls,
                self.budget.max_student_calls,
                BudgetField::StudentCalls,
            ),
        };
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return Err(field);
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a reserved call that never went out (refused pre-dispatch).
    pub fn release_call(&self, role: ModelRole) {
        let counter = match role {
            ModelRole::Teacher => &self.teacher_calls,
            ModelRole::Student => &self.student_calls,
        };
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn record_cost(&self, cost_micros: u64) {
        self.cost_micros.fetch_add(cost_micros, Ordering::SeqCst);
    }

    pub fn record_tokens(&self, tokens_in: u64, tokens_out: u64) {
        self.tokens_in.fetch_add(tokens_in, Ordering::SeqCst);
        self.tokens_out.fetch_add(tokens_out, Ordering::SeqCst);
    }

    pub fn record_stage_run(&self) {
        self.stages_run.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_wall_ms(&self, elapsed_ms: u64) {
        self.wall_ms.store(elapsed_ms, Ordering::SeqCst);
    }

    /// Which budget field, if any, is exhausted right now.
    pub fn exhausted(&self) -> Option<BudgetField> {
        if self.wall_ms.load(Ordering::SeqCst) >= self.budget.max_wall_ms {
            return Some(BudgetField::WallMs);
        }
        if self.cost_micros.load(Ordering::SeqCst) >= self.budget.max_cost_micros
            && self.budget.max_cost_micros > 0
        {
            return Some(BudgetField::CostMicros);
        }
        None
    }

    pub fn totals(&self) -> Totals {
        Totals {
            cost_micros: self.cost_micros.load(Ordering::SeqCst),
            wall_ms: self.wall_ms.load(Ordering::SeqCst),
            tokens_in: self.tokens_in.load(Ordering::SeqCst),
            tokens_out: self.tokens_out.load(Ordering::SeqCst),
            teacher_calls: self.teacher_calls.load(Ordering::SeqCst),
            student_calls: self.student_calls.load(Ordering::SeqCst),
            stages_run: self.stages_run.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_call_budget_refuses_reservation() {
        let meter = BudgetMeter::new(Budget {
            max_teacher_calls: 0,
            ..Budget::default()
        });
        assert_eq!(
            meter.try_reserve_call(ModelRole::Teacher),
            Err(BudgetField::TeacherCalls)
        );
        assert!(meter.try_reserve_call(ModelRole::Student).is_ok());
    }

    #[test]
    fn cost_check_refuses_over_remaining() {
        let meter = BudgetMeter::new(Budget {
            max_cost_micros: 100,
            ..Budget::default()
        });
        assert!(meter.check_cost(100).is_ok());
        meter.record_cost(60);
        assert_eq!(meter.check_cost(50), Err(BudgetField::CostMicros));
        assert!(meter.check_cost(40).is_ok());
    }

    #[test]
    fn release_undoes_reservation() {
        let meter = BudgetMeter::new(Budget {
            max_teacher_calls: 1,
            ..Budget::default()
        });
        meter.try_reserve_call(ModelRole::Teacher).unwrap();
        assert!(meter.try_reserve_call(ModelRole::Teacher).is_err());
        meter.release_call(ModelRole::Teacher);
        assert!(meter.try_reserve_call(ModelRole::Teacher).is_ok());
    }

    #[test]
    fn totals_reflect_recorded_spend() {
        let meter = BudgetMeter::new(Budget::default());
        meter.record_cost(1_500);
        meter.record_tokens(10, 20);
        meter.record_stage_run();
        meter.record_cache_hit();
        let totals = meter.totals();
        assert_eq!(totals.cost_micros, 1_500);
        assert_eq!(totals.tokens_in, 10);
        assert_eq!(totals.tokens_out, 20);
        assert_eq!(totals.stages_run, 1);
        assert_eq!(totals.cache_hits, 1);
    }

    #[test]
    fn wall_exhaustion_is_detected() {
        let meter = BudgetMeter::new(Budget {
            max_wall_ms: 10,
            ..Budget::default()
        });
        assert!(meter.exhausted().is_none());
        meter.set_wall_ms(10);
        assert_eq!(meter.exhausted(), Some(BudgetField::WallMs));
    }
}
