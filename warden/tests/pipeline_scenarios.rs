//! End-to-end cycle scenarios over in-memory live state.
//!
//! Each test drives `Heartbeat::run_cycle` with a fully wired pipeline and
//! checks the written-back status, the live state and the recorded side
//! channels (metrics, notifications, snapshots).

use std::sync::Arc;

use serde_json::json;
use warden::core::router::{LevelRule, Profile};
use warden::core::score::ExecutionTrace;
use warden::core::types::{DecisionOutcome, ExecutionStatus, RiskLevel, TaskStatus};
use warden::exit_codes;
use warden::io::operator::StateOperator;
use warden::sandbox::{IsolatedTrialRunner, RuleFixer};
use warden::test_support::{
    Harness, HarnessSettings, OperatorScript, ScriptedFixer, ScriptedOperator,
    ScriptedTrialRunner, clean_trace, task,
};

fn no_live_state() -> Vec<(String, String)> {
    Vec::new()
}

/// Two out-of-scope accesses: 40 + 30 + 0 + 10.
fn trace_scoring_80() -> ExecutionTrace {
    ExecutionTrace {
        out_of_scope: vec!["a.txt".to_string(), "b.txt".to_string()],
        elapsed_ms: 5,
        time_budget_ms: 1_000,
        ..ExecutionTrace::default()
    }
}

/// Clean but 1.5x over budget: 40 + 30 + 20 + 6.
fn trace_scoring_96() -> ExecutionTrace {
    ExecutionTrace {
        elapsed_ms: 1_500,
        time_budget_ms: 1_000,
        ..ExecutionTrace::default()
    }
}

/// Two of five post-conditions met and ten times over budget: 40 + 12 + 20 + 0.
fn trace_scoring_72() -> ExecutionTrace {
    ExecutionTrace {
        post_conditions: (0..5)
            .map(|i| warden::core::score::PostConditionResult {
                description: format!("check {i}"),
                met: i < 2,
            })
            .collect(),
        elapsed_ms: 20_000,
        time_budget_ms: 2_000,
        ..ExecutionTrace::default()
    }
}

/// Scenario A: a plain query is LOW, auto-executes after a perfect sandbox
/// run and succeeds against live state.
#[tokio::test]
async fn low_risk_query_executes_and_succeeds() {
    let h = Harness::new(
        vec![task("a", "db_query", json!({"table": "x"}))],
        [("tables/x.json", r#"{"rows": 3}"#)],
    );
    let operator = Arc::new(ScriptedOperator::new(OperatorScript::Apply));
    let cycle = h.heartbeat(
        Arc::new(IsolatedTrialRunner::new(h.live.clone(), Arc::new(StateOperator))),
        Arc::new(RuleFixer),
        operator.clone(),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    let report = &outcome.reports[0];
    assert_eq!(report.assessment.score, 0);
    assert_eq!(report.assessment.level, RiskLevel::Low);
    assert_eq!(
        report.decision.as_ref().map(|d| d.outcome),
        Some(DecisionOutcome::AutoExecute)
    );
    let sandbox = report.sandbox.as_ref().expect("sandbox report");
    assert_eq!(sandbox.best_score(), 100);
    assert_eq!(sandbox.iterations(), 1);
    assert_eq!(report.final_status, TaskStatus::Succeeded);
    assert_eq!(operator.calls(), 1);

    assert_eq!(h.source.task("a").expect("a").status, TaskStatus::Succeeded);
    assert_eq!(h.live_text("tables/x.json").as_deref(), Some(r#"{"rows": 3}"#));
    assert_eq!(h.snapshots.list().expect("snapshots").len(), 1);
    assert!(h.notifier.sent().is_empty());
    let metrics = h.metrics.tasks();
    assert_eq!(
        metrics[0].execution_outcome,
        Some(ExecutionStatus::Succeeded)
    );
}

/// Scenario B: sending email is CRITICAL and blocked before any sandbox or
/// production work.
#[tokio::test]
async fn email_is_blocked_without_sandbox_or_execution() {
    let h = Harness::new(
        vec![task("b", "send_email", json!({"to": "team@example.com"}))],
        no_live_state(),
    );
    let runner = Arc::new(ScriptedTrialRunner::repeating(clean_trace(1_000)));
    let operator = Arc::new(ScriptedOperator::new(OperatorScript::Apply));
    let cycle = h.heartbeat(
        runner.clone(),
        Arc::new(ScriptedFixer::default()),
        operator.clone(),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    let report = &outcome.reports[0];
    assert_eq!(report.assessment.score, 86);
    assert_eq!(report.assessment.level, RiskLevel::Critical);
    assert_eq!(report.final_status, TaskStatus::Blocked);
    assert!(report.sandbox.is_none());
    assert_eq!(runner.calls(), 0);
    assert_eq!(operator.calls(), 0);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, TaskStatus::Blocked);
    assert_eq!(h.metrics.tasks()[0].decision, Some(DecisionOutcome::Block));
}

/// Scenario C: a MEDIUM update whose sandbox tops out at 72 is escalated
/// and never touches live state.
#[tokio::test]
async fn medium_update_below_threshold_is_escalated() {
    let h = Harness::new(
        vec![task(
            "c",
            "db_update",
            json!({"table": "users", "updates": {"active": false}}),
        )],
        [("tables/users.json", r#"{"active": true}"#)],
    );
    let runner = Arc::new(ScriptedTrialRunner::repeating(trace_scoring_72()));
    let operator = Arc::new(ScriptedOperator::new(OperatorScript::Apply));
    let cycle = h.heartbeat(
        runner.clone(),
        Arc::new(ScriptedFixer::default()),
        operator.clone(),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    let report = &outcome.reports[0];
    assert_eq!(report.assessment.score, 38);
    assert_eq!(report.assessment.level, RiskLevel::Medium);
    assert_eq!(
        report.decision.as_ref().map(|d| d.outcome),
        Some(DecisionOutcome::EscalateHuman)
    );
    assert_eq!(report.final_status, TaskStatus::Escalated);
    assert!(report.rationale.contains("72"));
    assert_eq!(runner.calls(), 5);
    assert_eq!(operator.calls(), 0);
    assert!(h.snapshots.list().expect("snapshots").is_empty());
    assert_eq!(
        h.live_text("tables/users.json").as_deref(),
        Some(r#"{"active": true}"#)
    );
    assert_eq!(h.metrics.tasks()[0].sandbox_iterations, 5);
}

/// Scenario D: a workdir write fails its first attempt at 80, passes the
/// second at 96 after a fix and is committed.
#[tokio::test]
async fn low_write_passes_after_one_fix_and_commits() {
    let h = Harness::new(
        vec![task(
            "d",
            "file_write",
            json!({"path": "notes.txt", "content": "new", "scope": "workdir"}),
        )],
        [("notes.txt", "old")],
    );
    let runner = Arc::new(ScriptedTrialRunner::new(vec![
        trace_scoring_80(),
        trace_scoring_96(),
    ]));
    let fixer = Arc::new(ScriptedFixer::default());
    let cycle = h.heartbeat(
        runner.clone(),
        fixer.clone(),
        Arc::new(ScriptedOperator::new(OperatorScript::Apply)),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    let report = &outcome.reports[0];
    assert_eq!(report.assessment.score, 29);
    let sandbox = report.sandbox.as_ref().expect("sandbox");
    let scores: Vec<u8> = sandbox.attempts.iter().map(|a| a.score).collect();
    assert_eq!(scores, vec![80, 96]);
    assert!(sandbox.passed());
    assert_eq!(runner.calls(), 2);
    assert_eq!(fixer.calls(), 1);
    assert_eq!(report.final_status, TaskStatus::Succeeded);
    assert_eq!(h.live_text("notes.txt").as_deref(), Some("new"));
}

/// Scenario D, failing post-flight: the committed content is wrong, so the
/// snapshot is restored and the task ends rolled back.
#[tokio::test]
async fn failed_postflight_rolls_back_to_snapshot() {
    let h = Harness::new(
        vec![task(
            "d",
            "file_write",
            json!({"path": "notes.txt", "content": "new", "scope": "workdir"}),
        )],
        [("notes.txt", "old")],
    );
    let cycle = h.heartbeat(
        Arc::new(ScriptedTrialRunner::new(vec![
            trace_scoring_80(),
            trace_scoring_96(),
        ])),
        Arc::new(ScriptedFixer::default()),
        Arc::new(ScriptedOperator::new(OperatorScript::Overwrite(
            "garbage".to_string(),
        ))),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    let report = &outcome.reports[0];
    assert_eq!(report.final_status, TaskStatus::RolledBack);
    assert!(report.trail.contains(&TaskStatus::Executing));
    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(h.live_text("notes.txt").as_deref(), Some("old"));
    assert_eq!(outcome.summary.rolled_back, 1);
    let execution = report.execution.as_ref().expect("execution");
    assert!(execution.record.rollback_triggered);
    assert_eq!(h.notifier.sent()[0].status, TaskStatus::RolledBack);
    assert!(h.quarantine.entries().expect("quarantine").is_empty());
}

/// The rule fixer repairs an escaping path in the sandbox; the repaired
/// candidate, not the original payload, is what gets committed.
#[tokio::test]
async fn rule_fixer_repairs_escaping_path_before_commit() {
    let h = Harness::new(
        vec![task(
            "e",
            "file_write",
            json!({"path": "../notes.txt", "content": "fixed"}),
        )],
        no_live_state(),
    );
    let cycle = h.heartbeat(
        Arc::new(IsolatedTrialRunner::new(h.live.clone(), Arc::new(StateOperator))),
        Arc::new(RuleFixer),
        Arc::new(ScriptedOperator::new(OperatorScript::Apply)),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    let report = &outcome.reports[0];
    let sandbox = report.sandbox.as_ref().expect("sandbox");
    assert_eq!(sandbox.iterations(), 2);
    assert!(sandbox.attempts[0].errors[0].contains("path escapes workdir"));
    assert_eq!(sandbox.candidate.payload["path"], "notes.txt");
    assert_eq!(report.final_status, TaskStatus::Succeeded);
    assert_eq!(h.live_text("notes.txt").as_deref(), Some("fixed"));
}

/// Even a profile that auto-executes every level cannot run CRITICAL work.
#[tokio::test]
async fn critical_tasks_never_execute_under_permissive_profile() {
    let permissive = LevelRule {
        action: DecisionOutcome::AutoExecute,
        sandbox_threshold: Some(0),
        escalation_target: None,
    };
    let settings = HarnessSettings {
        profile: Profile {
            low: Some(permissive.clone()),
            medium: Some(permissive.clone()),
            high: Some(permissive.clone()),
            critical: Some(permissive),
        },
        ..HarnessSettings::default()
    };
    let h = Harness::new(
        vec![
            task("p", "payment", json!({"amount": 500})),
            task("q", "db_delete", json!({"table": "users"})),
        ],
        [("tables/users.json", "{}")],
    );
    let runner = Arc::new(ScriptedTrialRunner::repeating(clean_trace(1_000)));
    let operator = Arc::new(ScriptedOperator::new(OperatorScript::Apply));
    let cycle = h.heartbeat(
        runner.clone(),
        Arc::new(ScriptedFixer::default()),
        operator.clone(),
        &settings,
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    assert_eq!(outcome.summary.blocked, 2);
    assert_eq!(runner.calls(), 0);
    assert_eq!(operator.calls(), 0);
    assert_eq!(h.live_text("tables/users.json").as_deref(), Some("{}"));
}

#[tokio::test]
async fn kill_switch_halts_cycle_with_halted_exit_code() {
    let h = Harness::new(
        vec![task("a", "db_query", json!({"table": "x"}))],
        [("tables/x.json", "{}")],
    );
    h.kill_switch.engage();
    let operator = Arc::new(ScriptedOperator::new(OperatorScript::Apply));
    let cycle = h.heartbeat(
        Arc::new(ScriptedTrialRunner::repeating(clean_trace(1_000))),
        Arc::new(ScriptedFixer::default()),
        operator.clone(),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(false).await.expect("cycle");

    assert_eq!(outcome.exit_code(), exit_codes::HALTED);
    assert_eq!(outcome.summary.discovered, 0);
    assert_eq!(operator.calls(), 0);
    assert_eq!(h.source.task("a").expect("a").status, TaskStatus::Pending);
    assert!(h.metrics.cycles()[0].halted);

    // Releasing the switch lets the next cycle proceed.
    h.kill_switch.release();
    let resumed = cycle.run_cycle(false).await.expect("cycle");
    assert_eq!(resumed.summary.succeeded, 1);
}

#[tokio::test]
async fn dry_run_leaves_live_state_and_task_table_untouched() {
    let h = Harness::new(
        vec![task(
            "d",
            "file_write",
            json!({"path": "notes.txt", "content": "new"}),
        )],
        [("notes.txt", "old")],
    );
    let operator = Arc::new(ScriptedOperator::new(OperatorScript::Apply));
    let cycle = h.heartbeat(
        Arc::new(IsolatedTrialRunner::new(h.live.clone(), Arc::new(StateOperator))),
        Arc::new(RuleFixer),
        operator.clone(),
        &HarnessSettings::default(),
    );

    let outcome = cycle.run_cycle(true).await.expect("cycle");

    assert_eq!(outcome.reports[0].final_status, TaskStatus::Approved);
    assert_eq!(
        outcome.reports[0]
            .execution
            .as_ref()
            .map(|e| e.record.outcome),
        Some(ExecutionStatus::Simulated)
    );
    assert_eq!(operator.calls(), 0);
    assert_eq!(h.live_text("notes.txt").as_deref(), Some("old"));
    assert_eq!(h.source.task("d").expect("d").status, TaskStatus::Pending);
    assert!(h.snapshots.list().expect("snapshots").is_empty());
    assert!(h.metrics.tasks().is_empty());
}
