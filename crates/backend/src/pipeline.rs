//! The write pipeline.
//!
//! Every write request runs the same state machine inside one substrate
//! write transaction:
//!
//! 1. **Validate** the target and its parent.
//! 2. **Compute** the new entry state and the index, VLV and counter deltas.
//! 3. **Hooks** see the before and after state and may reject.
//! 4. **Apply** entry records, then every delta.
//! 5. **Commit**, or abort on any error so nothing becomes visible.
//!
//! A commit conflict confined to shared bookkeeping trees (index sets,
//! counters, tokens) re-runs the whole request in a fresh transaction; a
//! conflict on the entry trees means another writer changed the same entry
//! and is reported as [`BackendError::ConcurrentModification`].

use std::sync::Arc;

use chrono::Utc;
use dirstore_substrate::{Direction, Substrate, SubstrateError, WriteTxn};
use dirstore_types::{
    Dn, Entry, EntryId, Modification, ModificationKind, Rdn, RuleSet, matching::MatchingRule,
};
use snafu::{IntoError, ResultExt};

use crate::{
    cancel::{self, Cancellation},
    container::{ContainerTrees, CounterDeltas, EntryContainer, IdReservation},
    error::{BackendError, Result, StorageSnafu, corruption, invalid_request},
    hooks::{HookContext, PreCommitHook, WriteKind},
    index::IndexManager,
    operational,
    tokens::PendingTokens,
    vlv::VlvManager,
};

/// Attempts per request when commits conflict on shared trees.
const MAX_ATTEMPTS: usize = 8;

/// A write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    /// Adds a new entry below an existing parent.
    Add {
        /// The entry, DN included.
        entry: Entry,
    },
    /// Deletes an entry; with `cascade`, its whole subtree.
    Delete {
        /// Target DN.
        dn: Dn,
        /// Delete descendants too.
        cascade: bool,
    },
    /// Applies an ordered list of attribute changes.
    Modify {
        /// Target DN.
        dn: Dn,
        /// Changes, applied in order.
        changes: Vec<Modification>,
    },
    /// Renames an entry and optionally moves it below a new parent.
    Rename {
        /// Target DN.
        dn: Dn,
        /// The entry's new RDN.
        new_rdn: Rdn,
        /// New parent; `None` keeps the current one.
        new_superior: Option<Dn>,
        /// Remove the old RDN values from the entry.
        delete_old_rdn: bool,
    },
}

impl WriteRequest {
    /// The kind reported to hooks.
    pub fn kind(&self) -> WriteKind {
        match self {
            Self::Add { .. } => WriteKind::Add,
            Self::Delete { .. } => WriteKind::Delete,
            Self::Modify { .. } => WriteKind::Modify,
            Self::Rename { .. } => WriteKind::Rename,
        }
    }

    /// The target DN.
    pub fn dn(&self) -> &Dn {
        match self {
            Self::Add { entry } => entry.dn(),
            Self::Delete { dn, .. } | Self::Modify { dn, .. } | Self::Rename { dn, .. } => dn,
        }
    }
}

/// What a committed write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The entry was stored under this id.
    Added(EntryId),
    /// This many entries were removed.
    Deleted {
        /// Removed entries, the target included.
        entries: u64,
    },
    /// The entry with this id was changed.
    Modified(EntryId),
    /// This many entries now have a new DN.
    Renamed {
        /// Renamed entries, the target included.
        entries: u64,
    },
}

/// Transaction-scoped state of one attempt.
struct Scope<'t> {
    txn: Box<dyn WriteTxn + 't>,
    tokens: PendingTokens,
    ids: IdReservation,
    counters: CounterDeltas,
}

/// Runs write requests against the backend components.
pub(crate) struct Pipeline<'a> {
    pub substrate: &'a dyn Substrate,
    pub container: &'a EntryContainer,
    pub indexes: &'a IndexManager,
    pub vlv: &'a VlvManager,
    pub rules: &'a RuleSet,
    pub hooks: &'a [Arc<dyn PreCommitHook>],
    pub cancel: Option<&'a Cancellation>,
}

#[allow(clippy::result_large_err)]
impl Pipeline<'_> {
    /// Executes `request` atomically, retrying on conflicts confined to
    /// shared trees.
    pub fn execute(&self, request: &WriteRequest) -> Result<WriteOutcome> {
        for attempt in 1..=MAX_ATTEMPTS {
            cancel::check(self.cancel)?;
            let txn = self.substrate.begin_write().context(StorageSnafu)?;
            let mut scope = Scope {
                txn,
                tokens: PendingTokens::default(),
                ids: IdReservation::default(),
                counters: CounterDeltas::default(),
            };
            let outcome = match self.run(&mut scope, request) {
                Ok(outcome) => outcome,
                Err(e) => {
                    scope.txn.abort();
                    return Err(e);
                },
            };
            let Scope { txn, tokens, ids, .. } = scope;

            match txn.commit() {
                Ok(()) => {
                    self.container.confirm_ids(ids);
                    if !tokens.is_empty() {
                        let read = self.substrate.begin_read().context(StorageSnafu)?;
                        self.container.tokens().publish(tokens, read.as_ref());
                    }
                    tracing::debug!(dn = %request.dn(), ?outcome, attempt, "write committed");
                    return Ok(outcome);
                },
                Err(SubstrateError::Conflict { tree }) => {
                    if touches_entry_trees(&tree) || attempt == MAX_ATTEMPTS {
                        return Err(BackendError::ConcurrentModification { trees: tree });
                    }
                    tracing::debug!(dn = %request.dn(), trees = %tree, attempt, "retrying after conflict");
                },
                Err(e) => return Err(StorageSnafu.into_error(e)),
            }
        }
        Err(BackendError::ConcurrentModification { trees: String::new() })
    }

    fn run(&self, scope: &mut Scope<'_>, request: &WriteRequest) -> Result<WriteOutcome> {
        let outcome = match request {
            WriteRequest::Add { entry } => self.add(scope, entry)?,
            WriteRequest::Delete { dn, cascade } => self.delete(scope, dn, *cascade)?,
            WriteRequest::Modify { dn, changes } => self.modify(scope, dn, changes)?,
            WriteRequest::Rename { dn, new_rdn, new_superior, delete_old_rdn } => {
                self.rename(scope, dn, new_rdn, new_superior.as_ref(), *delete_old_rdn)?
            },
        };
        let counters = std::mem::take(&mut scope.counters).pruned();
        self.container.apply_counters(scope.txn.as_mut(), &counters)?;
        Ok(outcome)
    }

    fn run_hooks(&self, context: &HookContext<'_>) -> Result<()> {
        for hook in self.hooks {
            if let Err(rejection) = hook.check(context) {
                tracing::debug!(hook = hook.name(), dn = %context.dn, "hook rejected write");
                return Err(BackendError::HookRejected {
                    hook: hook.name().to_string(),
                    reason: rejection.reason,
                });
            }
        }
        Ok(())
    }

    fn rule(&self, attribute: &str) -> MatchingRule {
        self.rules.rule_for(attribute)
    }

    // ========================================================================
    // Add
    // ========================================================================

    fn add(&self, scope: &mut Scope<'_>, entry: &Entry) -> Result<WriteOutcome> {
        let dn = entry.dn();
        let key = self.container.key_for(dn)?;
        if self.container.id_for_key(scope.txn.as_read(), &key)?.is_some() {
            return Err(BackendError::EntryAlreadyExists { dn: dn.to_string() });
        }
        let ancestors = self.container.ancestor_ids(scope.txn.as_read(), dn)?;

        let mut entry = entry.clone();
        if let Some(rdn) = dn.rdn() {
            add_rdn_values(&mut entry, rdn, self.rules);
        }
        operational::stamp_new(&mut entry, Utc::now());
        self.run_hooks(&HookContext { kind: WriteKind::Add, dn, before: None, after: Some(&entry) })?;

        let id = self.container.allocate_id(scope.txn.as_mut(), &mut scope.ids)?;
        self.container.bind_dn(scope.txn.as_mut(), &key, id)?;
        self.container.write_entry(scope.txn.as_mut(), &mut scope.tokens, id, &entry)?;
        self.indexes.apply(scope.txn.as_mut(), id, &self.indexes.changes(None, Some(&entry)))?;
        self.vlv.apply(scope.txn.as_mut(), &self.vlv.changes(id, None, Some(&entry), self.rules))?;

        scope.counters.attach(ancestors.first().copied(), &ancestors, 1);
        scope.counters.entries += 1;
        Ok(WriteOutcome::Added(id))
    }

    // ========================================================================
    // Delete
    // ========================================================================

    fn delete(&self, scope: &mut Scope<'_>, dn: &Dn, cascade: bool) -> Result<WriteOutcome> {
        let key = self.container.key_for(dn)?;
        let (id, entry) = self.existing(scope, dn, &key)?;
        let children = self.container.children_count(scope.txn.as_read(), id)?;
        if children > 0 && !cascade {
            return Err(BackendError::NotAllowedOnNonLeaf { dn: dn.to_string(), children });
        }
        let ancestors = self.container.ancestor_ids(scope.txn.as_read(), dn)?;
        self.run_hooks(&HookContext { kind: WriteKind::Delete, dn, before: Some(&entry), after: None })?;

        // Reverse key order visits children before their parents.
        let descendants = if children > 0 {
            self.container.descendants(scope.txn.as_read(), &key, Direction::Reverse)?
        } else {
            Vec::new()
        };
        for (descendant_key, descendant) in &descendants {
            cancel::check(self.cancel)?;
            let old = self
                .container
                .read_entry(scope.txn.as_read(), *descendant)?
                .ok_or_else(|| corruption(format!("dn2id references missing {descendant}")))?;
            self.remove(scope, descendant_key, *descendant, &old)?;
        }
        self.remove(scope, &key, id, &entry)?;

        let removed = 1 + descendants.len() as u64;
        let delta = i64::try_from(removed).map_err(|_| corruption("subtree size overflows"))?;
        scope.counters.attach(ancestors.first().copied(), &ancestors, -delta);
        scope.counters.entries -= delta;
        if removed > 1 {
            tracing::info!(dn = %dn, entries = removed, "deleted subtree");
        }
        Ok(WriteOutcome::Deleted { entries: removed })
    }

    fn remove(&self, scope: &mut Scope<'_>, key: &[u8], id: EntryId, entry: &Entry) -> Result<()> {
        self.indexes.apply(scope.txn.as_mut(), id, &self.indexes.changes(Some(entry), None))?;
        self.vlv.apply(scope.txn.as_mut(), &self.vlv.changes(id, Some(entry), None, self.rules))?;
        self.container.unbind_dn(scope.txn.as_mut(), key)?;
        self.container.remove_entry(scope.txn.as_mut(), id)
    }

    // ========================================================================
    // Modify
    // ========================================================================

    fn modify(&self, scope: &mut Scope<'_>, dn: &Dn, changes: &[Modification]) -> Result<WriteOutcome> {
        let key = self.container.key_for(dn)?;
        let (id, before) = self.existing(scope, dn, &key)?;

        let mut after = before.clone();
        for change in changes {
            if operational::is_read_only(&change.attribute) {
                return Err(invalid_request(format!("{} is not modifiable", change.attribute)));
            }
            apply_modification(&mut after, change, self.rules)?;
        }
        if let Some(rdn) = dn.rdn() {
            for ava in rdn.avas() {
                let rule = self.rule(ava.attr_type());
                if !after.get(ava.attr_type()).is_some_and(|a| a.contains(rule, ava.value().as_bytes())) {
                    return Err(BackendError::NotAllowedOnRdn {
                        attribute: ava.attr_type().to_string(),
                        dn: dn.to_string(),
                    });
                }
            }
        }
        operational::stamp_modified(&mut after, Utc::now());
        self.run_hooks(&HookContext {
            kind: WriteKind::Modify,
            dn,
            before: Some(&before),
            after: Some(&after),
        })?;

        self.container.write_entry(scope.txn.as_mut(), &mut scope.tokens, id, &after)?;
        self.indexes.apply(scope.txn.as_mut(), id, &self.indexes.changes(Some(&before), Some(&after)))?;
        self.vlv.apply(scope.txn.as_mut(), &self.vlv.changes(id, Some(&before), Some(&after), self.rules))?;
        Ok(WriteOutcome::Modified(id))
    }

    // ========================================================================
    // Rename
    // ========================================================================

    fn rename(
        &self,
        scope: &mut Scope<'_>,
        dn: &Dn,
        new_rdn: &Rdn,
        new_superior: Option<&Dn>,
        delete_old_rdn: bool,
    ) -> Result<WriteOutcome> {
        let key = self.container.key_for(dn)?;
        if key.is_empty() {
            return Err(invalid_request("the base entry cannot be renamed"));
        }
        let (id, before) = self.existing(scope, dn, &key)?;
        let (Some(old_parent), Some(old_rdn)) = (dn.parent(), dn.rdn()) else {
            return Err(invalid_request(format!("{dn} has no parent")));
        };
        let new_parent = new_superior.cloned().unwrap_or(old_parent);
        if new_parent.is_within(dn) {
            return Err(invalid_request(format!("cannot move {dn} below itself")));
        }
        let new_dn = new_parent.child(new_rdn.clone());
        let new_key = self.container.key_for(&new_dn)?;
        if new_key != key && self.container.id_for_key(scope.txn.as_read(), &new_key)?.is_some() {
            return Err(BackendError::EntryAlreadyExists { dn: new_dn.to_string() });
        }
        let old_ancestors = self.container.ancestor_ids(scope.txn.as_read(), dn)?;
        let new_ancestors = self.container.ancestor_ids(scope.txn.as_read(), &new_dn)?;

        let mut after = before.clone();
        add_rdn_values(&mut after, new_rdn, self.rules);
        if delete_old_rdn {
            for ava in old_rdn.avas() {
                let rule = self.rule(ava.attr_type());
                let kept = new_rdn.avas().iter().any(|n| {
                    n.attr_type().eq_ignore_ascii_case(ava.attr_type())
                        && rule.values_match(n.value().as_bytes(), ava.value().as_bytes())
                });
                if !kept {
                    after.remove_value(ava.attr_type(), rule, ava.value().as_bytes());
                }
            }
        }
        after.set_dn(new_dn.clone());
        operational::stamp_modified(&mut after, Utc::now());
        self.run_hooks(&HookContext {
            kind: WriteKind::Rename,
            dn,
            before: Some(&before),
            after: Some(&after),
        })?;

        let descendants = self.container.descendants(scope.txn.as_read(), &key, Direction::Forward)?;
        self.container.unbind_dn(scope.txn.as_mut(), &key)?;
        self.container.bind_dn(scope.txn.as_mut(), &new_key, id)?;
        self.container.write_entry(scope.txn.as_mut(), &mut scope.tokens, id, &after)?;
        self.indexes.apply(scope.txn.as_mut(), id, &self.indexes.changes(Some(&before), Some(&after)))?;
        self.vlv.apply(scope.txn.as_mut(), &self.vlv.changes(id, Some(&before), Some(&after), self.rules))?;

        for (descendant_key, descendant) in &descendants {
            cancel::check(self.cancel)?;
            let old = self
                .container
                .read_entry(scope.txn.as_read(), *descendant)?
                .ok_or_else(|| corruption(format!("dn2id references missing {descendant}")))?;
            let moved_dn = old
                .dn()
                .rebase(dn, &new_dn)
                .ok_or_else(|| corruption(format!("{} is stored below {dn}", old.dn())))?;
            let mut moved = old.clone();
            moved.set_dn(moved_dn);

            self.container.unbind_dn(scope.txn.as_mut(), descendant_key)?;
            let moved_key = crate::keys::rebase_key(descendant_key, &key, &new_key);
            self.container.bind_dn(scope.txn.as_mut(), &moved_key, *descendant)?;
            self.container.write_entry(scope.txn.as_mut(), &mut scope.tokens, *descendant, &moved)?;
            self.indexes.apply(scope.txn.as_mut(), *descendant, &self.indexes.changes(Some(&old), Some(&moved)))?;
            self.vlv.apply(
                scope.txn.as_mut(),
                &self.vlv.changes(*descendant, Some(&old), Some(&moved), self.rules),
            )?;
        }

        let renamed = 1 + descendants.len() as u64;
        let delta = i64::try_from(renamed).map_err(|_| corruption("subtree size overflows"))?;
        scope.counters.attach(old_ancestors.first().copied(), &old_ancestors, -delta);
        scope.counters.attach(new_ancestors.first().copied(), &new_ancestors, delta);
        if renamed > 1 {
            tracing::info!(from = %dn, to = %new_dn, entries = renamed, "renamed subtree");
        }
        Ok(WriteOutcome::Renamed { entries: renamed })
    }

    fn existing(&self, scope: &Scope<'_>, dn: &Dn, key: &[u8]) -> Result<(EntryId, Entry)> {
        let txn = scope.txn.as_read();
        let Some(id) = self.container.id_for_key(txn, key)? else {
            return Err(BackendError::NoSuchEntry { dn: dn.to_string() });
        };
        let entry = self
            .container
            .read_entry(txn, id)?
            .ok_or_else(|| corruption(format!("dn2id maps {dn} to missing {id}")))?;
        Ok((id, entry))
    }
}

/// Whether a comma-joined conflict tree list names an entry tree.
fn touches_entry_trees(trees: &str) -> bool {
    trees.split(',').any(|t| ContainerTrees::is_entry_tree(t.trim()))
}

/// Adds the naming values of `rdn` the entry does not already hold.
pub(crate) fn add_rdn_values(entry: &mut Entry, rdn: &Rdn, rules: &RuleSet) {
    for ava in rdn.avas() {
        let rule = rules.rule_for(ava.attr_type());
        let value = ava.value().as_bytes();
        if !entry.get(ava.attr_type()).is_some_and(|a| a.contains(rule, value)) {
            entry.add_value(ava.attr_type(), value.to_vec());
        }
    }
}

/// Applies one modification to `entry` in place.
///
/// # Errors
///
/// Returns [`BackendError::AttributeOrValueExists`],
/// [`BackendError::NoSuchAttribute`] or [`BackendError::InvalidRequest`].
#[allow(clippy::result_large_err)]
pub(crate) fn apply_modification(entry: &mut Entry, change: &Modification, rules: &RuleSet) -> Result<()> {
    let attribute = change.attribute.as_str();
    let rule = rules.rule_for(attribute);
    let dn = entry.dn().to_string();
    let no_such = || BackendError::NoSuchAttribute { attribute: attribute.to_string(), dn: dn.clone() };
    match change.kind {
        ModificationKind::Add => {
            if change.values.is_empty() {
                return Err(invalid_request(format!("add of {attribute} lists no values")));
            }
            for value in &change.values {
                if entry.get(attribute).is_some_and(|a| a.contains(rule, value)) {
                    return Err(BackendError::AttributeOrValueExists {
                        attribute: attribute.to_string(),
                        dn: dn.clone(),
                    });
                }
                entry.add_value(attribute, value.clone());
            }
        },
        ModificationKind::Delete => {
            if change.values.is_empty() {
                if entry.remove_attribute(attribute).is_none() {
                    return Err(no_such());
                }
            } else {
                for value in &change.values {
                    if !entry.remove_value(attribute, rule, value) {
                        return Err(no_such());
                    }
                }
            }
        },
        ModificationKind::Replace => {
            let mut values: Vec<Vec<u8>> = Vec::with_capacity(change.values.len());
            for value in &change.values {
                if !values.iter().any(|v| rule.values_match(v, value)) {
                    values.push(value.clone());
                }
            }
            entry.replace(attribute, values);
        },
        ModificationKind::Increment => {
            let [delta] = change.values.as_slice() else {
                return Err(invalid_request(format!("increment of {attribute} needs exactly one value")));
            };
            let delta = parse_integer(delta)
                .ok_or_else(|| invalid_request(format!("increment of {attribute} is not an integer")))?;
            let current = match entry.values(attribute) {
                [] => return Err(no_such()),
                [value] => parse_integer(value)
                    .ok_or_else(|| invalid_request(format!("{attribute} does not hold an integer")))?,
                _ => return Err(invalid_request(format!("{attribute} is multi-valued"))),
            };
            let updated = current
                .checked_add(delta)
                .ok_or_else(|| invalid_request(format!("increment of {attribute} overflows")))?;
            entry.replace(attribute, vec![updated.to_string().into_bytes()]);
        },
    }
    Ok(())
}

fn parse_integer(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}
