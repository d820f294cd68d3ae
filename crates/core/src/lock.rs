//! Lock bookkeeping embedded in every lock-protected entity.
//!
//! A delivered task carries the sequence it was scheduled with, always
//! `sequence + 1` of the entity at scheduling time. Acquiring the lock moves the
//! entity to that sequence and records the holder; a successful release keeps
//! the sequence (so redeliveries of the same step are recognised as done) and a
//! failed release rolls it back (so the same step can be acquired again).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::RequestId;
use crate::value_object::ValueObject;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Sequence of the last acquired step.
    pub sequence: u64,
    /// Delivery currently executing the step, if any.
    pub request_id: Option<RequestId>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Attempts made at the current step (acquisitions and takeovers).
    pub attempts: u32,
}

impl ValueObject for LockState {}

/// What a delivery carrying `seq` is allowed to do with a lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// Expected next step: take the lock and run.
    Acquire,
    /// The holder's lease expired: take over and run again.
    TakeOver,
    /// The step already ran to completion; acknowledge and drop.
    AlreadyComplete,
    /// Delivery for an older step; acknowledge and drop.
    Stale,
    /// Another delivery holds a live lease for this step; retry later.
    InProgress,
    /// The entity has not reached the preceding step yet; retry later.
    NotReady,
    /// The step exhausted its attempt limit; acknowledge and give up.
    Abandon,
}

impl LockState {
    /// Sequence a newly scheduled step must carry.
    pub fn next_sequence(&self) -> u64 {
        self.sequence + 1
    }

    pub fn is_held(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn is_held_by(&self, request_id: RequestId) -> bool {
        self.request_id == Some(request_id)
    }

    pub fn evaluate(
        &self,
        seq: u64,
        now: DateTime<Utc>,
        lease: Duration,
        max_attempts: u32,
    ) -> LockDecision {
        if seq == self.next_sequence() {
            if self.is_held() {
                return LockDecision::InProgress;
            }
            if self.attempts >= max_attempts {
                return LockDecision::Abandon;
            }
            return LockDecision::Acquire;
        }

        if seq < self.sequence {
            return LockDecision::Stale;
        }

        if seq > self.next_sequence() {
            return LockDecision::NotReady;
        }

        // seq == self.sequence
        if !self.is_held() {
            return LockDecision::AlreadyComplete;
        }

        let expired = self
            .acquired_at
            .map_or(true, |acquired| acquired + lease <= now);
        if !expired {
            LockDecision::InProgress
        } else if self.attempts >= max_attempts {
            LockDecision::Abandon
        } else {
            LockDecision::TakeOver
        }
    }

    pub fn acquire(&mut self, seq: u64, request_id: RequestId, now: DateTime<Utc>) {
        self.sequence = seq;
        self.request_id = Some(request_id);
        self.acquired_at = Some(now);
        self.attempts += 1;
    }

    pub fn take_over(&mut self, request_id: RequestId, now: DateTime<Utc>) {
        self.request_id = Some(request_id);
        self.acquired_at = Some(now);
        self.attempts += 1;
    }

    /// Give up on step `seq`: later deliveries of it are treated as complete.
    pub fn abandon(&mut self, seq: u64) {
        self.sequence = self.sequence.max(seq);
        self.request_id = None;
        self.acquired_at = None;
        self.attempts = 0;
    }

    pub fn release(&mut self, success: bool) {
        if self.request_id.take().is_none() {
            return;
        }
        self.acquired_at = None;
        if success {
            self.attempts = 0;
        } else {
            self.sequence = self.sequence.saturating_sub(1);
        }
    }

    /// Successful release (the entity's business step landed).
    pub fn complete(&mut self) {
        self.release(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn next_step_acquires_and_completed_step_is_dropped() {
        let now = Utc::now();
        let mut lock = LockState::default();
        assert_eq!(lock.evaluate(1, now, lease(), 3), LockDecision::Acquire);

        lock.acquire(1, RequestId::new(), now);
        assert_eq!(lock.evaluate(1, now, lease(), 3), LockDecision::InProgress);

        lock.complete();
        assert_eq!(lock.sequence, 1);
        assert_eq!(lock.evaluate(1, now, lease(), 3), LockDecision::AlreadyComplete);
        assert_eq!(lock.evaluate(0, now, lease(), 3), LockDecision::Stale);
        assert_eq!(lock.evaluate(3, now, lease(), 3), LockDecision::NotReady);
        assert_eq!(lock.evaluate(2, now, lease(), 3), LockDecision::Acquire);
    }

    #[test]
    fn failed_release_allows_the_same_step_again() {
        let now = Utc::now();
        let mut lock = LockState::default();
        lock.acquire(1, RequestId::new(), now);
        lock.release(false);

        assert_eq!(lock.sequence, 0);
        assert!(!lock.is_held());
        assert_eq!(lock.evaluate(1, now, lease(), 3), LockDecision::Acquire);
    }

    #[test]
    fn expired_lease_is_taken_over_until_attempts_run_out() {
        let start = Utc::now();
        let later = start + Duration::seconds(61);
        let mut lock = LockState::default();

        lock.acquire(1, RequestId::new(), start);
        assert_eq!(lock.evaluate(1, later, lease(), 2), LockDecision::TakeOver);

        lock.take_over(RequestId::new(), start);
        assert_eq!(lock.evaluate(1, later, lease(), 2), LockDecision::Abandon);

        lock.abandon(1);
        assert_eq!(lock.evaluate(1, later, lease(), 2), LockDecision::AlreadyComplete);
    }

    #[test]
    fn repeated_failures_exhaust_attempts() {
        let now = Utc::now();
        let mut lock = LockState::default();
        for _ in 0..3 {
            assert_eq!(lock.evaluate(1, now, lease(), 3), LockDecision::Acquire);
            lock.acquire(1, RequestId::new(), now);
            lock.release(false);
        }
        assert_eq!(lock.evaluate(1, now, lease(), 3), LockDecision::Abandon);
    }

    #[test]
    fn release_without_holder_is_a_no_op() {
        let mut lock = LockState {
            sequence: 4,
            ..Default::default()
        };
        lock.release(false);
        assert_eq!(lock.sequence, 4);
    }
}
