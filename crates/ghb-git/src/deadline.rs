//! Per-request deadlines for long-running engine work.

use crate::{GitError, Result};
use std::time::{Duration, Instant};

/// A point in time after which engine work must stop.
///
/// Engines call [`Deadline::check`] at their cancellation points: between
/// objects during reachability walks and unpacking, and between reference
/// commands. A command that already started is always completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self(None)
    }

    /// Returns true once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry, `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fails with [`GitError::Timeout`] once the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(GitError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_expires() {
        let deadline = Deadline::never();
        assert!(!deadline.is_expired());
        assert!(deadline.check().is_ok());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_zero_timeout_expires_immediately() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
        assert!(matches!(deadline.check(), Err(GitError::Timeout)));
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_future_deadline() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(deadline.check().is_ok());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(30));
    }
}
