//! Decision routing: risk level + sandbox score + profile -> decision.
//!
//! The router only classifies. It is a pure function, so the same inputs
//! always produce the same [`Decision`].

use serde::{Deserialize, Serialize};

use crate::core::types::{Decision, DecisionOutcome, RiskLevel};
use crate::error::PipelineError;

/// What a profile prescribes for one risk level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRule {
    pub action: DecisionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_target: Option<String>,
}

impl LevelRule {
    fn execute(action: DecisionOutcome, threshold: u8) -> Self {
        Self {
            action,
            sandbox_threshold: Some(threshold),
            escalation_target: None,
        }
    }

    fn escalate(action: DecisionOutcome, target: &str) -> Self {
        Self {
            action,
            sandbox_threshold: None,
            escalation_target: Some(target.to_string()),
        }
    }
}

/// Per-level routing rules, loaded from `[profiles.<name>]` in the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<LevelRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<LevelRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<LevelRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<LevelRule>,
}

impl Profile {
    /// LOW runs after a 95+ sandbox pass, MEDIUM after 90+.
    pub fn autonomous() -> Self {
        Self {
            low: Some(LevelRule::execute(DecisionOutcome::AutoExecute, 95)),
            medium: Some(LevelRule::execute(DecisionOutcome::ConditionalExecute, 90)),
            high: Some(LevelRule::escalate(DecisionOutcome::EscalateHuman, "operator")),
            critical: Some(LevelRule::escalate(DecisionOutcome::Block, "operator")),
        }
    }

    /// Only LOW runs unattended, and only after a 98+ sandbox pass.
    pub fn supervised() -> Self {
        Self {
            low: Some(LevelRule::execute(DecisionOutcome::ConditionalExecute, 98)),
            medium: Some(LevelRule::escalate(DecisionOutcome::EscalateHuman, "operator")),
            high: Some(LevelRule::escalate(DecisionOutcome::EscalateHuman, "operator")),
            critical: Some(LevelRule::escalate(DecisionOutcome::Block, "operator")),
        }
    }

    pub fn rule(&self, level: RiskLevel) -> Option<&LevelRule> {
        match level {
            RiskLevel::Low => self.low.as_ref(),
            RiskLevel::Medium => self.medium.as_ref(),
            RiskLevel::High => self.high.as_ref(),
            RiskLevel::Critical => self.critical.as_ref(),
        }
    }

    /// Every level needs a rule, and every executing rule needs a threshold.
    pub fn validate(&self, name: &str) -> Result<(), PipelineError> {
        for level in RiskLevel::ALL {
            let Some(rule) = self.rule(level) else {
                return Err(PipelineError::Configuration(format!(
                    "profile '{name}' has no rule for {level}"
                )));
            };
            if rule.action.executes() {
                match rule.sandbox_threshold {
                    None => {
                        return Err(PipelineError::Configuration(format!(
                            "profile '{name}' {level} rule executes without a sandbox_threshold"
                        )));
                    }
                    Some(threshold) if threshold > 100 => {
                        return Err(PipelineError::Configuration(format!(
                            "profile '{name}' {level} sandbox_threshold must be <= 100"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Route a task.
///
/// Without a sandbox score an executing decision is returned with
/// `requires_sandbox = true`; the caller must run the sandbox and route again.
pub fn decide(
    task_id: &str,
    level: RiskLevel,
    sandbox_score: Option<u8>,
    profile: &Profile,
) -> Decision {
    let rule = profile.rule(level);
    let escalation_target = rule.and_then(|r| r.escalation_target.clone());
    let decision = |outcome: DecisionOutcome, rationale: String, threshold: Option<u8>| Decision {
        task_id: task_id.to_string(),
        outcome,
        rationale,
        requires_sandbox: outcome.executes(),
        sandbox_threshold: threshold,
        escalation_target: escalation_target.clone(),
    };

    match level {
        RiskLevel::Critical => {
            return decision(
                DecisionOutcome::Block,
                "CRITICAL risk: blocked regardless of profile".to_string(),
                None,
            );
        }
        RiskLevel::High => {
            return decision(
                DecisionOutcome::EscalateHuman,
                "HIGH risk: requires human approval".to_string(),
                None,
            );
        }
        RiskLevel::Low | RiskLevel::Medium => {}
    }

    let Some(rule) = rule else {
        return decision(
            DecisionOutcome::EscalateHuman,
            format!("profile has no rule for {level}"),
            None,
        );
    };
    if !rule.action.executes() {
        return decision(
            rule.action,
            format!("{level} risk: profile prescribes {}", rule.action),
            None,
        );
    }
    // LOW may only be as permissive as AUTO_EXECUTE, MEDIUM only CONDITIONAL_EXECUTE.
    let action = match level {
        RiskLevel::Medium => DecisionOutcome::ConditionalExecute,
        _ => rule.action,
    };
    let Some(threshold) = rule.sandbox_threshold else {
        return decision(
            DecisionOutcome::EscalateHuman,
            format!("{level} rule has no sandbox_threshold"),
            None,
        );
    };

    match sandbox_score {
        None => decision(
            action,
            format!("{level} risk: {action} pending sandbox score >= {threshold}"),
            Some(threshold),
        ),
        Some(score) if score >= threshold => decision(
            action,
            format!("{level} risk: sandbox score {score} >= {threshold}"),
            Some(threshold),
        ),
        Some(score) => decision(
            DecisionOutcome::EscalateHuman,
            format!("{level} risk: sandbox score {score} below threshold {threshold}"),
            Some(threshold),
        ),
    }
}
