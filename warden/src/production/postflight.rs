//! Post-condition verification against live state after a commit.

use crate::core::operation::OperationPlan;
use crate::error::PipelineError;
use crate::io::state_store::StateStore;

pub fn verify(plan: &OperationPlan, live: &dyn StateStore) -> Result<(), PipelineError> {
    let mut unmet = Vec::new();
    for condition in &plan.post_conditions {
        let current = live.read(condition.resource()).map_err(|err| {
            PipelineError::Postflight(format!("read {}: {err:#}", condition.resource()))
        })?;
        if !condition.evaluate(current.as_deref()) {
            unmet.push(condition.describe());
        }
    }
    if unmet.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Postflight(format!(
            "unmet post-conditions: {}",
            unmet.join("; ")
        )))
    }
}
