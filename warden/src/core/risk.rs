//! Deterministic risk scoring for task descriptors.
//!
//! Four weighted components (raw 0-100 each) are combined as
//! `raw * weight / 100`, then additive keyword and scope modifiers apply. The
//! sum is clamped to 100 and critical action types are floored into the
//! CRITICAL band.

use std::fmt::Write as _;

use crate::core::types::{RiskAssessment, RiskFactor, RiskLevel, Scope, TaskDescriptor};

const WEIGHT_EXTERNAL: u32 = 40;
const WEIGHT_DATA: u32 = 30;
const WEIGHT_IRREVERSIBILITY: u32 = 20;
const WEIGHT_FINANCIAL: u32 = 10;

/// Minimum score for action types that must never run autonomously.
pub const CRITICAL_FLOOR: u8 = 86;

const CRITICAL_TYPES: &[&str] = &["send_email", "payment", "db_delete", "deploy", "merge_pr"];

const SENSITIVE_KEYWORDS: &[(&str, u32)] = &[("payment", 25), ("delete", 20), ("email", 15)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CategoryProfile {
    external: u32,
    data: u32,
    irreversibility: u32,
}

const fn profile(external: u32, data: u32, irreversibility: u32) -> CategoryProfile {
    CategoryProfile {
        external,
        data,
        irreversibility,
    }
}

fn category_profile(task_type: &str) -> CategoryProfile {
    match task_type {
        "db_query" | "file_read" => profile(0, 0, 0),
        "db_update" => profile(0, 100, 40),
        "db_write" => profile(0, 100, 0),
        "db_delete" => profile(0, 100, 100),
        "file_write" => profile(0, 70, 40),
        "file_delete" => profile(0, 70, 100),
        "system_optimization" | "file_migration" | "bulk_operation" => profile(0, 85, 70),
        "execute_script" | "run_command" => profile(0, 80, 60),
        "send_email" => profile(100, 0, 100),
        "api_call" | "webhook" | "slack_message" | "http_post" | "http_put" | "http_delete"
        | "external_service" => profile(100, 0, 0),
        "payment" | "deploy" | "merge_pr" | "close_pr" => profile(0, 0, 100),
        _ => profile(0, 80, 60),
    }
}

fn financial_raw(cost: f64) -> u32 {
    if cost <= 0.0 {
        0
    } else if cost <= 10.0 {
        30
    } else if cost <= 100.0 {
        70
    } else {
        100
    }
}

fn scope_points(scope: Scope) -> u32 {
    match scope {
        Scope::Workdir => 0,
        Scope::Shared => 15,
        Scope::Production => 30,
    }
}

fn push_factor(factors: &mut Vec<RiskFactor>, name: impl Into<String>, points: u32) {
    if points > 0 {
        factors.push(RiskFactor {
            name: name.into(),
            points,
        });
    }
}

/// Score a task. Pure: identical descriptors always yield identical assessments.
pub fn assess(task_id: &str, descriptor: &TaskDescriptor) -> RiskAssessment {
    let category = category_profile(&descriptor.task_type);
    let mut factors = Vec::new();

    push_factor(
        &mut factors,
        "external_action",
        category.external * WEIGHT_EXTERNAL / 100,
    );
    push_factor(
        &mut factors,
        "data_modification",
        category.data * WEIGHT_DATA / 100,
    );
    push_factor(
        &mut factors,
        "irreversibility",
        category.irreversibility * WEIGHT_IRREVERSIBILITY / 100,
    );
    push_factor(
        &mut factors,
        "financial_impact",
        financial_raw(descriptor.cost) * WEIGHT_FINANCIAL / 100,
    );

    for (keyword, points) in SENSITIVE_KEYWORDS {
        if descriptor.keywords.iter().any(|k| k.contains(keyword)) {
            push_factor(&mut factors, format!("keyword:{keyword}"), *points);
        }
    }
    push_factor(
        &mut factors,
        format!("scope:{:?}", descriptor.scope).to_ascii_lowercase(),
        scope_points(descriptor.scope),
    );

    let raw: u32 = factors.iter().map(|f| f.points).sum();
    let mut score = u8::try_from(raw.min(100)).unwrap_or(100);

    if CRITICAL_TYPES.contains(&descriptor.task_type.as_str()) && score < CRITICAL_FLOOR {
        push_factor(
            &mut factors,
            "critical_action_floor",
            u32::from(CRITICAL_FLOOR - score),
        );
        score = CRITICAL_FLOOR;
    }

    RiskAssessment {
        task_id: task_id.to_string(),
        score,
        level: RiskLevel::from_score(score),
        factors,
    }
}

/// Human-readable breakdown of an assessment.
pub fn explain(assessment: &RiskAssessment) -> String {
    let mut out = format!(
        "task {}: risk {} ({})\n",
        assessment.task_id, assessment.score, assessment.level
    );
    if assessment.factors.is_empty() {
        out.push_str("  no contributing factors\n");
    }
    for factor in &assessment.factors {
        let _ = writeln!(out, "  +{:>3}  {}", factor.points, factor.name);
    }
    if assessment.score == 100 {
        out.push_str("  (clamped to 100)\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn score(task_type: &str, payload: serde_json::Value) -> RiskAssessment {
        assess("t", &TaskDescriptor::from_parts(task_type, &payload))
    }

    #[test]
    fn bands_partition_the_range() {
        let mut counts = [0usize; 4];
        for s in 0..=100u8 {
            let level = RiskLevel::from_score(s);
            let idx = RiskLevel::ALL
                .iter()
                .position(|l| *l == level)
                .expect("known level");
            counts[idx] += 1;
        }
        assert_eq!(counts, [31, 30, 25, 15]);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(31), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(61), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(85), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(86), RiskLevel::Critical);
    }

    #[test]
    fn read_only_query_is_zero() {
        let assessment = score("db_query", json!({}));
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.factors.is_empty());
    }

    #[test]
    fn update_and_write_land_in_expected_bands() {
        let update = score("db_update", json!({}));
        assert_eq!(update.score, 38);
        assert_eq!(update.level, RiskLevel::Medium);

        let write = score("file_write", json!({"scope": "workdir"}));
        assert_eq!(write.score, 29);
        assert_eq!(write.level, RiskLevel::Low);
    }

    #[test]
    fn critical_types_are_floored() {
        let email = score("send_email", json!({}));
        assert_eq!(email.score, CRITICAL_FLOOR);
        assert_eq!(email.level, RiskLevel::Critical);
        assert!(
            email
                .factors
                .iter()
                .any(|f| f.name == "critical_action_floor" && f.points == 26)
        );
    }

    #[test]
    fn keywords_count_once_and_scope_adds() {
        let assessment = score(
            "file_write",
            json!({"keywords": ["delete_rows", "delete_all"], "scope": "shared"}),
        );
        // 21 + 8 + delete 20 + shared 15
        assert_eq!(assessment.score, 64);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn sum_is_clamped_to_100() {
        let assessment = score(
            "system_optimization",
            json!({"keywords": ["payment", "delete", "email"], "scope": "production", "cost": 500}),
        );
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.level, RiskLevel::Critical);
    }

    #[test]
    fn unknown_types_are_medium() {
        let assessment = score("reticulate_splines", json!({}));
        assert_eq!(assessment.score, 36);
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    #[test]
    fn cost_tiers_feed_financial_impact() {
        assert_eq!(score("db_query", json!({"cost": 5})).score, 3);
        assert_eq!(score("db_query", json!({"cost": 50})).score, 7);
        assert_eq!(score("db_query", json!({"cost": 5000})).score, 10);
    }

    #[test]
    fn explain_lists_factors() {
        let text = explain(&score("db_update", json!({})));
        assert!(text.contains("risk 38 (MEDIUM)"));
        assert!(text.contains("data_modification"));
        assert!(text.contains("irreversibility"));
    }
}
