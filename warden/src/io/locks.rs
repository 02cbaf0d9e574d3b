//! Resource-keyed mutual exclusion for production executions.
//!
//! Acquisition is all-or-nothing and never waits: a held resource is reported
//! back so the caller can defer the task. The returned guard releases on drop.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Default)]
pub struct ResourceLocks {
    held: Arc<Mutex<BTreeSet<String>>>,
}

#[derive(Debug)]
pub struct ResourceGuard {
    held: Arc<Mutex<BTreeSet<String>>>,
    resources: Vec<String>,
}

impl ResourceLocks {
    /// Lock every resource or none. On conflict returns the busy resource.
    pub fn try_acquire(&self, resources: &[String]) -> Result<ResourceGuard, String> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = resources.iter().find(|r| held.contains(*r)) {
            return Err(busy.clone());
        }
        held.extend(resources.iter().cloned());
        Ok(ResourceGuard {
            held: Arc::clone(&self.held),
            resources: resources.to_vec(),
        })
    }

    pub fn is_held(&self, resource: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(resource)
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for resource in &self.resources {
            held.remove(resource);
        }
    }
}
