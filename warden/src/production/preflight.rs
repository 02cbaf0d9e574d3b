//! Checks that must pass before a production operation may start.
//!
//! Nothing here mutates live state. On success the caller holds the resource
//! guard through commit, post-flight and any rollback.

use crate::core::fingerprint::{DigestMap, drifted};
use crate::core::operation::OperationPlan;
use crate::error::PipelineError;
use crate::io::locks::{ResourceGuard, ResourceLocks};
use crate::io::quarantine::Quarantine;
use crate::io::state_store::{StateStore, digests};

pub struct PreflightContext<'a> {
    pub plan: &'a OperationPlan,
    pub live: &'a dyn StateStore,
    pub locks: &'a ResourceLocks,
    pub quarantine: &'a Quarantine,
    /// Digests the sandbox trial observed. Empty skips the divergence check.
    pub baseline: &'a DigestMap,
}

fn failed(message: String) -> PipelineError {
    PipelineError::Preflight(message)
}

pub fn run(ctx: &PreflightContext<'_>) -> Result<ResourceGuard, PipelineError> {
    for resource in &ctx.plan.resources {
        let entry = ctx
            .quarantine
            .find(resource)
            .map_err(|err| failed(format!("read quarantine: {err:#}")))?;
        if let Some(entry) = entry {
            return Err(failed(format!(
                "resource '{resource}' is quarantined since {} ({})",
                entry.since.to_rfc3339(),
                entry.reason
            )));
        }
    }

    let guard = ctx
        .locks
        .try_acquire(&ctx.plan.resources)
        .map_err(PipelineError::ResourceBusy)?;

    ctx.live
        .health_check()
        .map_err(|err| failed(format!("state store unhealthy: {err:#}")))?;

    let current = digests(ctx.live, &ctx.plan.resources)
        .map_err(|err| failed(format!("read live state: {err:#}")))?;

    for resource in &ctx.plan.requires_existing {
        if current.get(resource).is_none_or(Option::is_none) {
            return Err(failed(format!("required resource '{resource}' does not exist")));
        }
    }

    if !ctx.baseline.is_empty() {
        let diverged = drifted(ctx.baseline, &current);
        if !diverged.is_empty() {
            return Err(failed(format!(
                "live state diverged from sandbox baseline: {}",
                diverged.join(", ")
            )));
        }
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::plan;
    use crate::io::quarantine::QuarantineEntry;
    use crate::io::state_store::MemoryStateStore;
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        _temp: tempfile::TempDir,
        quarantine: Quarantine,
        locks: ResourceLocks,
        live: MemoryStateStore,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let quarantine = Quarantine::new(temp.path().join("quarantine.json"));
        Fixture {
            _temp: temp,
            quarantine,
            locks: ResourceLocks::default(),
            live: MemoryStateStore::from_entries([("tables/users.json", r#"{"a": 1}"#)]),
        }
    }

    fn update_plan() -> OperationPlan {
        plan("db_update", &json!({"table": "users", "updates": {"a": 2}})).expect("plan")
    }

    fn run_with(f: &Fixture, plan: &OperationPlan, baseline: &DigestMap) -> Result<ResourceGuard, PipelineError> {
        run(&PreflightContext {
            plan,
            live: &f.live,
            locks: &f.locks,
            quarantine: &f.quarantine,
            baseline,
        })
    }

    #[test]
    fn passes_when_baseline_matches_and_holds_lock() {
        let f = fixture();
        let plan = update_plan();
        let baseline = digests(&f.live, &plan.resources).expect("digests");
        let guard = run_with(&f, &plan, &baseline).expect("preflight");
        assert!(f.locks.is_held("tables/users.json"));
        drop(guard);
        assert!(!f.locks.is_held("tables/users.json"));
    }

    #[test]
    fn divergence_aborts() {
        let f = fixture();
        let plan = update_plan();
        let baseline = digests(&f.live, &plan.resources).expect("digests");
        f.live
            .write("tables/users.json", br#"{"a": 9}"#)
            .expect("concurrent change");
        let err = run_with(&f, &plan, &baseline).expect_err("diverged");
        assert!(err.to_string().contains("diverged"));
        assert!(!f.locks.is_held("tables/users.json"));
    }

    #[test]
    fn busy_resource_is_reported_as_such() {
        let f = fixture();
        let plan = update_plan();
        let _held = f.locks.try_acquire(&plan.resources).expect("hold");
        let err = run_with(&f, &plan, &DigestMap::new()).expect_err("busy");
        assert!(err.is_deferrable());
    }

    #[test]
    fn quarantined_resource_aborts() {
        let f = fixture();
        f.quarantine
            .add(vec![QuarantineEntry {
                resource: "tables/users.json".into(),
                task_id: "old".into(),
                snapshot_id: "s".into(),
                reason: "rollback did not verify".into(),
                since: Utc::now(),
            }])
            .expect("quarantine");
        let err = run_with(&f, &update_plan(), &DigestMap::new()).expect_err("quarantined");
        assert!(matches!(err, PipelineError::Preflight(msg) if msg.contains("quarantined")));
    }

    #[test]
    fn missing_required_resource_aborts() {
        let f = fixture();
        let plan = plan("db_update", &json!({"table": "ghost", "updates": {"a": 2}})).expect("plan");
        let err = run_with(&f, &plan, &DigestMap::new()).expect_err("missing");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn dotted_spelling_shares_lock_and_quarantine() {
        let f = fixture();
        let plain = plan("file_write", &json!({"path": "notes.txt", "content": "a"})).expect("plan");
        let dotted =
            plan("file_write", &json!({"path": "./notes.txt", "content": "b"})).expect("plan");

        let held = run_with(&f, &plain, &DigestMap::new()).expect("first writer");
        let err = run_with(&f, &dotted, &DigestMap::new()).expect_err("busy");
        assert!(matches!(err, PipelineError::ResourceBusy(_)), "{err}");
        drop(held);

        f.quarantine
            .add(vec![QuarantineEntry {
                resource: "notes.txt".into(),
                task_id: "old".into(),
                snapshot_id: "s".into(),
                reason: "rollback did not verify".into(),
                since: Utc::now(),
            }])
            .expect("quarantine");
        let err = run_with(&f, &dotted, &DigestMap::new()).expect_err("quarantined");
        assert!(matches!(err, PipelineError::Preflight(msg) if msg.contains("quarantined")));
    }
}
