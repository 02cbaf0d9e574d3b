//! Score calculator for sandbox execution traces.
//!
//! Weighted checks: runtime errors (40), side-effect correctness (30),
//! out-of-scope access (20), time-budget compliance (10). Each sub-score is
//! 0-100; the total is `sum(sub * weight) / 100`.

use serde::{Deserialize, Serialize};

const WEIGHT_RUNTIME: u32 = 40;
const WEIGHT_SIDE_EFFECTS: u32 = 30;
const WEIGHT_SCOPE: u32 = 20;
const WEIGHT_TIME: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostConditionResult {
    pub description: String,
    pub met: bool,
}

/// Everything observed while a candidate ran in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub errors: Vec<String>,
    pub post_conditions: Vec<PostConditionResult>,
    pub out_of_scope: Vec<String>,
    pub elapsed_ms: u64,
    pub time_budget_ms: u64,
    pub timed_out: bool,
}

impl ExecutionTrace {
    /// A trace for an attempt that failed before producing observations.
    pub fn failed(error: impl Into<String>, time_budget_ms: u64) -> Self {
        Self {
            errors: vec![error.into()],
            time_budget_ms,
            ..Self::default()
        }
    }

    pub fn timed_out(limit_ms: u64, time_budget_ms: u64) -> Self {
        Self {
            errors: vec![format!("sandbox attempt timed out after {limit_ms}ms")],
            elapsed_ms: limit_ms,
            time_budget_ms,
            timed_out: true,
            ..Self::default()
        }
    }

    /// Errors plus every other reason the trace lost points, in a form a fix
    /// generator can pattern-match.
    pub fn diagnostics(&self) -> Vec<String> {
        let mut out = self.errors.clone();
        out.extend(
            self.post_conditions
                .iter()
                .filter(|pc| !pc.met)
                .map(|pc| format!("post-condition not met: {}", pc.description)),
        );
        out.extend(
            self.out_of_scope
                .iter()
                .map(|resource| format!("out-of-scope access: {resource}")),
        );
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub runtime_errors: u8,
    pub side_effects: u8,
    pub scope: u8,
    pub time_budget: u8,
    pub total: u8,
}

fn side_effect_score(trace: &ExecutionTrace) -> u32 {
    if !trace.errors.is_empty() {
        return 0;
    }
    let total = trace.post_conditions.len() as u32;
    if total == 0 {
        return 100;
    }
    let met = trace.post_conditions.iter().filter(|pc| pc.met).count() as u32;
    met * 100 / total
}

fn time_score(trace: &ExecutionTrace) -> u32 {
    if trace.timed_out {
        return 0;
    }
    let budget = trace.time_budget_ms;
    let elapsed = trace.elapsed_ms;
    if budget == 0 || elapsed <= budget {
        100
    } else if elapsed <= budget.saturating_mul(2) {
        60
    } else if elapsed <= budget.saturating_mul(5) {
        30
    } else {
        0
    }
}

/// Score a trace. Identical traces always score identically.
pub fn score_trace(trace: &ExecutionTrace) -> ScoreBreakdown {
    let runtime = if trace.errors.is_empty() { 100 } else { 0 };
    let side_effects = side_effect_score(trace);
    let violations = u32::try_from(trace.out_of_scope.len()).unwrap_or(u32::MAX);
    let scope = 100u32.saturating_sub(violations.saturating_mul(50));
    let time = time_score(trace);

    let total = (runtime * WEIGHT_RUNTIME
        + side_effects * WEIGHT_SIDE_EFFECTS
        + scope * WEIGHT_SCOPE
        + time * WEIGHT_TIME)
        / 100;

    // Every sub-score is <= 100, so the narrowing casts cannot truncate.
    ScoreBreakdown {
        runtime_errors: runtime as u8,
        side_effects: side_effects as u8,
        scope: scope as u8,
        time_budget: time as u8,
        total: total as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(met: usize, total: usize) -> Vec<PostConditionResult> {
        (0..total)
            .map(|i| PostConditionResult {
                description: format!("check {i}"),
                met: i < met,
            })
            .collect()
    }

    #[test]
    fn clean_trace_scores_100() {
        let trace = ExecutionTrace {
            post_conditions: conditions(1, 1),
            elapsed_ms: 10,
            time_budget_ms: 1000,
            ..ExecutionTrace::default()
        };
        let breakdown = score_trace(&trace);
        assert_eq!(breakdown.total, 100);
        assert_eq!(score_trace(&trace), breakdown);
    }

    #[test]
    fn partial_side_effects_and_slow_run_score_72() {
        let trace = ExecutionTrace {
            post_conditions: conditions(2, 5),
            elapsed_ms: 20_000,
            time_budget_ms: 2_000,
            ..ExecutionTrace::default()
        };
        let breakdown = score_trace(&trace);
        assert_eq!(breakdown.side_effects, 40);
        assert_eq!(breakdown.time_budget, 0);
        assert_eq!(breakdown.total, 72);
    }

    #[test]
    fn scope_violations_cost_fifty_each() {
        let trace = ExecutionTrace {
            out_of_scope: vec!["a".into(), "b".into()],
            elapsed_ms: 5,
            time_budget_ms: 1000,
            ..ExecutionTrace::default()
        };
        assert_eq!(score_trace(&trace).total, 80);

        let slow_but_clean = ExecutionTrace {
            elapsed_ms: 1500,
            time_budget_ms: 1000,
            ..ExecutionTrace::default()
        };
        assert_eq!(score_trace(&slow_but_clean).total, 96);
    }

    #[test]
    fn errors_zero_runtime_and_side_effects() {
        let breakdown = score_trace(&ExecutionTrace::failed("boom", 1000));
        assert_eq!(breakdown.runtime_errors, 0);
        assert_eq!(breakdown.side_effects, 0);
        assert_eq!(breakdown.total, 30);
    }

    #[test]
    fn timeout_scores_zero_time() {
        let breakdown = score_trace(&ExecutionTrace::timed_out(60_000, 1000));
        assert_eq!(breakdown.time_budget, 0);
        assert_eq!(breakdown.total, 20);
    }

    #[test]
    fn diagnostics_include_unmet_conditions_and_scope() {
        let trace = ExecutionTrace {
            errors: vec!["boom".into()],
            post_conditions: conditions(0, 1),
            out_of_scope: vec!["other.txt".into()],
            ..ExecutionTrace::default()
        };
        assert_eq!(
            trace.diagnostics(),
            vec![
                "boom".to_string(),
                "post-condition not met: check 0".to_string(),
                "out-of-scope access: other.txt".to_string(),
            ]
        );
    }
}
