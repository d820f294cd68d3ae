//! Lifecycle timing and counters shared by every orchestrated entity.
//!
//! Each job, namespace and shard embeds a [`Timing`] by composition. A child's
//! timing folds into its parent through [`Timing::rollup`]: the parent keeps the
//! earliest start and the latest activity, and accumulates processed counts and
//! named counters. The fold is commutative and associative, so the order in
//! which children report never changes the aggregate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Latest activity seen on this entity or any rolled-up child.
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Items processed.
    pub count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, i64>,
}

impl ValueObject for Timing {}

impl Timing {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            count: 0,
            counters: BTreeMap::new(),
        }
    }

    /// Mark the entity started. Only the first start is kept.
    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.touch(now);
    }

    /// Mark the entity completed. Only the first completion is kept.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.touch(now);
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Add locally processed work.
    pub fn record(&mut self, count: u64, counters: &BTreeMap<String, i64>) {
        self.count += count;
        for (name, value) in counters {
            *self.counters.entry(name.clone()).or_insert(0) += value;
        }
    }

    /// Fold a child's timing and counters into this (parent) timing.
    pub fn rollup(&mut self, child: &Timing) {
        self.started_at = match (self.started_at, child.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child_end = child.completed_at.unwrap_or(child.updated_at);
        self.touch(child_end);
        self.record(child.count, &child.counters);
    }

    /// Wall-clock time between start and completion, once both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn child(start: i64, end: i64, count: u64) -> Timing {
        let mut t = Timing::new(at(0));
        t.start(at(start));
        t.record(count, &BTreeMap::from([("rows".to_string(), count as i64)]));
        t.complete(at(end));
        t
    }

    #[test]
    fn completion_is_kept_once() {
        let mut t = Timing::new(at(0));
        t.complete(at(5));
        t.complete(at(9));
        assert_eq!(t.completed_at, Some(at(5)));
        assert_eq!(t.started_at, Some(at(5)));
        assert_eq!(t.updated_at, at(9));
    }

    #[test]
    fn rollup_keeps_earliest_start_and_latest_end() {
        let mut parent = Timing::new(at(0));
        parent.rollup(&child(10, 20, 3));
        parent.rollup(&child(5, 15, 4));

        assert_eq!(parent.started_at, Some(at(5)));
        assert_eq!(parent.updated_at, at(20));
        assert_eq!(parent.count, 7);
        assert_eq!(parent.counters.get("rows"), Some(&7));
        assert!(parent.completed_at.is_none());
    }

    proptest! {
        #[test]
        fn rollup_is_order_independent(children in prop::collection::vec((0i64..100, 0i64..100, 0u64..50), 1..8)) {
            let built: Vec<Timing> = children
                .iter()
                .map(|(s, d, c)| child(*s, s + d, *c))
                .collect();

            let mut forward = Timing::new(at(0));
            for c in &built {
                forward.rollup(c);
            }
            let mut backward = Timing::new(at(0));
            for c in built.iter().rev() {
                backward.rollup(c);
            }
            prop_assert_eq!(forward, backward);
        }
    }
}
