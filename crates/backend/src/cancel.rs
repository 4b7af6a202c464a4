//! Cooperative cancellation.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::error::{BackendError, Result};

/// A shared flag long-running operations poll between sub-steps.
///
/// Cancelling never interrupts a commit; the operation notices the flag at
/// its next check, aborts its open transaction and returns
/// [`BackendError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// A flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with [`BackendError::Cancelled`] once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Cancelled`].
    #[allow(clippy::result_large_err)]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(BackendError::Cancelled) } else { Ok(()) }
    }
}

/// Checks an optional flag.
#[allow(clippy::result_large_err)]
pub(crate) fn check(cancel: Option<&Cancellation>) -> Result<()> {
    cancel.map_or(Ok(()), Cancellation::check)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let cancel = Cancellation::new();
        let other = cancel.clone();
        assert!(cancel.check().is_ok());
        other.cancel();
        assert!(cancel.is_cancelled());
        assert!(matches!(cancel.check(), Err(BackendError::Cancelled)));
        assert!(check(None).is_ok());
        assert!(check(Some(&cancel)).is_err());
    }
}
