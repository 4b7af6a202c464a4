//! Pre-commit hooks.
//!
//! Admin-layer validation runs as an ordered list of hooks the write pipeline
//! calls after it has computed the new entry state and before anything is
//! written. The first rejection aborts the operation.

use dirstore_types::{Dn, Entry};

/// Kind of write a hook is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// An entry is being added.
    Add,
    /// An entry (and with cascade, its subtree) is being deleted.
    Delete,
    /// An entry's attributes are being modified.
    Modify,
    /// An entry is being renamed or moved.
    Rename,
}

/// What a hook sees of the operation.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// Kind of write.
    pub kind: WriteKind,
    /// Target DN as requested.
    pub dn: &'a Dn,
    /// Entry before the operation. `None` for adds.
    pub before: Option<&'a Entry>,
    /// Entry after the operation. `None` for deletes.
    pub after: Option<&'a Entry>,
}

/// Why a hook refused an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRejection {
    /// Human-readable reason, reported to the caller.
    pub reason: String,
}

impl HookRejection {
    /// Creates a rejection.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// A synchronous validation step run before every write commits.
///
/// Hooks must not call back into the backend.
pub trait PreCommitHook: Send + Sync {
    /// Name reported in [`crate::BackendError::HookRejected`].
    fn name(&self) -> &str;

    /// Accepts or rejects the operation.
    ///
    /// # Errors
    ///
    /// Returns a [`HookRejection`] to abort the operation.
    fn check(&self, context: &HookContext<'_>) -> Result<(), HookRejection>;
}

/// A hook built from a closure.
pub struct FnHook<F> {
    name: String,
    check: F,
}

impl<F> FnHook<F>
where
    F: Fn(&HookContext<'_>) -> Result<(), HookRejection> + Send + Sync,
{
    /// Wraps `check` under `name`.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self { name: name.into(), check }
    }
}

impl<F> std::fmt::Debug for FnHook<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHook").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<F> PreCommitHook for FnHook<F>
where
    F: Fn(&HookContext<'_>) -> Result<(), HookRejection> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, context: &HookContext<'_>) -> Result<(), HookRejection> {
        (self.check)(context)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_test_utils::fixtures;

    use super::*;

    #[test]
    fn test_fn_hook_reports_rejection() {
        let hook = FnHook::new("no-mail", |ctx: &HookContext<'_>| {
            match ctx.after {
                Some(e) if e.has("mail") => Err(HookRejection::new("mail is managed elsewhere")),
                _ => Ok(()),
            }
        });
        let alice = fixtures::person("alice", "Alice", "Smith", "alice@example.com");
        let ctx = HookContext { kind: WriteKind::Add, dn: alice.dn(), before: None, after: Some(&alice) };
        assert_eq!(hook.name(), "no-mail");
        assert_eq!(hook.check(&ctx).unwrap_err().reason, "mail is managed elsewhere");

        let ctx = HookContext { kind: WriteKind::Delete, dn: alice.dn(), before: Some(&alice), after: None };
        assert!(hook.check(&ctx).is_ok());
    }
}
