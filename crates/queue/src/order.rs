//! Priority order over pending jobs.
//!
//! Jobs are ranked by `(priority desc, created_at asc, admission sequence asc)`.
//! The sequence number makes the order total: two jobs admitted within the
//! same clock tick still dispatch in arrival order, so equal-priority jobs
//! never starve each other.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use renderq_core::JobId;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    priority: Reverse<i64>,
    created_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

/// Ordered index of pending job ids.
#[derive(Debug, Default)]
pub struct PriorityOrder {
    ranked: BTreeSet<RankKey>,
    keys: HashMap<JobId, RankKey>,
}

impl PriorityOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or re-key) a pending job.
    pub fn insert(&mut self, id: JobId, priority: i64, created_at: DateTime<Utc>, seq: u64) {
        self.remove(&id);
        let key = RankKey {
            priority: Reverse(priority),
            created_at,
            seq,
            id: id.clone(),
        };
        self.ranked.insert(key.clone());
        self.keys.insert(id, key);
    }

    /// Drop a job from the order. Returns whether it was present.
    pub fn remove(&mut self, id: &JobId) -> bool {
        match self.keys.remove(id) {
            Some(key) => self.ranked.remove(&key),
            None => false,
        }
    }

    /// Change the priority of a pending job, keeping its arrival position among equals.
    pub fn reprioritize(&mut self, id: &JobId, priority: i64) -> bool {
        let Some(key) = self.keys.get(id).cloned() else {
            return false;
        };
        self.insert(key.id, priority, key.created_at, key.seq);
        true
    }

    /// 1-based rank of a pending job.
    pub fn position(&self, id: &JobId) -> Option<usize> {
        let key = self.keys.get(id)?;
        Some(self.ranked.range(..key).count() + 1)
    }

    /// First job in rank order accepted by `eligible`.
    pub fn first_where<F>(&self, mut eligible: F) -> Option<&JobId>
    where
        F: FnMut(&JobId) -> bool,
    {
        self.ranked.iter().map(|k| &k.id).find(|id| eligible(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobId> {
        self.ranked.iter().map(|k| &k.id)
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}
