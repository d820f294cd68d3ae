//! Optimistic concurrency expectations for stored entities.

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a stored entity.
///
/// Versions are assigned by the store: `0` means "never written", and every
/// successful write bumps the version by one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (blind writes).
    Any,
    /// Require the entity to be at an exact version (`Exact(0)` = absent).
    Exact(u64),
}

impl ExpectedVersion {
    pub fn absent() -> Self {
        ExpectedVersion::Exact(0)
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
