//! Sandbox validation: bounded validate/fix iterations.
//!
//! Each attempt runs a [`Candidate`] in isolation and scores the resulting
//! trace. Below-threshold attempts go to a [`FixGenerator`] for a revised
//! candidate until the attempt budget is spent or the generator gives up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::fingerprint::DigestMap;
use crate::core::fix_rules::propose_fix;
use crate::core::operation::{plan, time_budget};
use crate::core::score::{ExecutionTrace, PostConditionResult, score_trace};
use crate::core::types::{Candidate, SandboxAttempt};
use crate::io::operator::Operator;
use crate::io::state_store::{MemoryStateStore, RecordingStore, StateStore, digests};

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What one trial observed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrialOutput {
    pub trace: ExecutionTrace,
    /// Live digests of the covered resources at the time the trial copied them.
    pub baseline: DigestMap,
}

/// Runs one candidate without touching live state.
#[async_trait]
pub trait TrialRunner: Send + Sync {
    async fn trial(&self, candidate: &Candidate) -> Result<TrialOutput>;
}

/// Proposes the next candidate after a failed attempt.
///
/// `Ok(None)` means the failure is unfixable and ends the loop.
#[async_trait]
pub trait FixGenerator: Send + Sync {
    async fn propose(
        &self,
        candidate: &Candidate,
        errors: &[String],
        history: &[SandboxAttempt],
    ) -> Result<Option<Candidate>>;
}

/// Copies covered resources from live state into memory and applies the
/// candidate there through the production [`Operator`].
pub struct IsolatedTrialRunner {
    live: Arc<dyn StateStore>,
    operator: Arc<dyn Operator>,
}

impl IsolatedTrialRunner {
    pub fn new(live: Arc<dyn StateStore>, operator: Arc<dyn Operator>) -> Self {
        Self { live, operator }
    }
}

#[async_trait]
impl TrialRunner for IsolatedTrialRunner {
    async fn trial(&self, candidate: &Candidate) -> Result<TrialOutput> {
        let budget_ms = duration_ms(time_budget(&candidate.task_type));
        let plan = match plan(&candidate.task_type, &candidate.payload) {
            Ok(plan) => plan,
            Err(err) => {
                return Ok(TrialOutput {
                    trace: ExecutionTrace::failed(err.to_string(), budget_ms),
                    baseline: DigestMap::new(),
                });
            }
        };

        let baseline = digests(self.live.as_ref(), &plan.resources)?;
        let sandbox = MemoryStateStore::default();
        for resource in &plan.resources {
            if let Some(bytes) = self.live.read(resource)? {
                sandbox.write(resource, &bytes)?;
            }
        }

        let recorder = RecordingStore::new(&sandbox);
        let started = Instant::now();
        let result = self.operator.apply(&plan.operation, &recorder).await;
        let elapsed_ms = duration_ms(started.elapsed());

        let errors = match result {
            Ok(_) => Vec::new(),
            Err(err) => vec![format!("{err:#}")],
        };
        let mut post_conditions = Vec::new();
        if errors.is_empty() {
            for condition in &plan.post_conditions {
                let current = sandbox.read(condition.resource())?;
                post_conditions.push(PostConditionResult {
                    description: condition.describe(),
                    met: condition.evaluate(current.as_deref()),
                });
            }
        }
        let out_of_scope = recorder
            .touched()?
            .into_iter()
            .filter(|resource| !plan.resources.contains(resource))
            .collect();

        Ok(TrialOutput {
            trace: ExecutionTrace {
                errors,
                post_conditions,
                out_of_scope,
                elapsed_ms,
                time_budget_ms: duration_ms(plan.time_budget),
                timed_out: false,
            },
            baseline,
        })
    }
}

/// Deterministic fixer backed by [`crate::core::fix_rules`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleFixer;

#[async_trait]
impl FixGenerator for RuleFixer {
    async fn propose(
        &self,
        candidate: &Candidate,
        errors: &[String],
        _history: &[SandboxAttempt],
    ) -> Result<Option<Candidate>> {
        Ok(propose_fix(&candidate.payload, errors).map(|fix| Candidate {
            iteration: candidate.iteration + 1,
            task_type: candidate.task_type.clone(),
            payload: fix.payload,
            fix_note: Some(fix.note),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SandboxVerdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxReport {
    pub verdict: SandboxVerdict,
    pub attempts: Vec<SandboxAttempt>,
    /// The passing candidate, or the last one tried.
    pub candidate: Candidate,
    /// Baseline digests observed by the passing trial (empty on failure).
    pub baseline: DigestMap,
}

impl SandboxReport {
    pub fn passed(&self) -> bool {
        self.verdict == SandboxVerdict::Pass
    }

    /// Best score across attempts; this is what the router sees.
    pub fn best_score(&self) -> u8 {
        self.attempts.iter().map(|a| a.score).max().unwrap_or(0)
    }

    pub fn iterations(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }
}

pub struct SandboxOrchestrator {
    runner: Arc<dyn TrialRunner>,
    fixer: Arc<dyn FixGenerator>,
    max_iterations: u32,
    attempt_timeout: Duration,
}

impl SandboxOrchestrator {
    pub fn new(
        runner: Arc<dyn TrialRunner>,
        fixer: Arc<dyn FixGenerator>,
        max_iterations: u32,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            fixer,
            max_iterations,
            attempt_timeout,
        }
    }

    /// Run at most `max_iterations` strictly sequential attempts.
    #[instrument(skip_all, fields(task_id = %task_id, threshold = threshold))]
    pub async fn run(&self, task_id: &str, initial: Candidate, threshold: u8) -> SandboxReport {
        let mut candidate = initial;
        let mut attempts: Vec<SandboxAttempt> = Vec::new();

        for iteration in 1..=self.max_iterations {
            candidate.iteration = iteration;
            let output = match tokio::time::timeout(
                self.attempt_timeout,
                self.runner.trial(&candidate),
            )
            .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => TrialOutput {
                    trace: ExecutionTrace::failed(
                        format!("{err:#}"),
                        duration_ms(time_budget(&candidate.task_type)),
                    ),
                    baseline: DigestMap::new(),
                },
                Err(_) => TrialOutput {
                    trace: ExecutionTrace::timed_out(
                        duration_ms(self.attempt_timeout),
                        duration_ms(time_budget(&candidate.task_type)),
                    ),
                    baseline: DigestMap::new(),
                },
            };

            let checks = score_trace(&output.trace);
            let passed = checks.total >= threshold;
            let errors = output.trace.diagnostics();
            info!(
                task_id,
                iteration,
                score = checks.total,
                passed,
                "sandbox attempt scored"
            );
            attempts.push(SandboxAttempt {
                task_id: task_id.to_string(),
                iteration,
                score: checks.total,
                passed,
                errors: errors.clone(),
                checks,
            });

            if passed {
                return SandboxReport {
                    verdict: SandboxVerdict::Pass,
                    attempts,
                    candidate,
                    baseline: output.baseline,
                };
            }
            if iteration == self.max_iterations {
                break;
            }

            match self.fixer.propose(&candidate, &errors, &attempts).await {
                Ok(Some(next)) => {
                    debug!(task_id, note = next.fix_note.as_deref().unwrap_or("-"), "fix proposed");
                    candidate = next;
                }
                Ok(None) => {
                    info!(task_id, iteration, "no fix available; ending sandbox loop");
                    break;
                }
                Err(err) => {
                    warn!(task_id, error = %format!("{err:#}"), "fix generator failed");
                    break;
                }
            }
        }

        SandboxReport {
            verdict: SandboxVerdict::Fail,
            attempts,
            candidate,
            baseline: DigestMap::new(),
        }
    }
}
