//! Snapshot retention policy and garbage-collection selection.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many unpinned snapshots.
    pub max_snapshots: usize,
    /// Snapshots older than this are collected.
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_snapshots: 50,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Ids of snapshots that should be deleted.
///
/// Pinned snapshots are never selected and do not count toward
/// `max_snapshots`. Among the rest, anything past the age limit goes, then
/// the oldest beyond the count limit.
pub fn select_expired(
    entries: &[RetentionEntry],
    now: DateTime<Utc>,
    policy: &RetentionPolicy,
    pinned: &BTreeSet<String>,
) -> Vec<String> {
    // An age limit reaching past the earliest representable date expires nothing.
    let cutoff = Duration::try_days(i64::from(policy.max_age_days))
        .and_then(|age| now.checked_sub_signed(age));
    let mut newest_first: Vec<&RetentionEntry> = entries.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

    let mut kept = 0usize;
    let mut expired = Vec::new();
    for entry in newest_first {
        if pinned.contains(&entry.id) {
            continue;
        }
        let too_old = cutoff.is_some_and(|cutoff| entry.created_at < cutoff);
        if too_old || kept >= policy.max_snapshots {
            expired.push(entry.id.clone());
        } else {
            kept += 1;
        }
    }
    expired.sort();
    expired
}
