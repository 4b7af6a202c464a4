//! Search execution.
//!
//! [`SearchResults`] owns the read snapshot it was planned against, so the
//! whole iteration observes one consistent state no matter what commits
//! meanwhile. Entries come back in DN key order: parents before children,
//! siblings by normalized RDN.

use std::time::{Duration, Instant};

use dirstore_substrate::{Direction, ReadTxn};
use dirstore_types::{Dn, Entry, EntryId, Filter, RuleSet, Scope, SearchStatus};

use crate::{
    container::{ChildScan, EntryContainer, SubtreeScan},
    entry_id_set::EntryIdSet,
    error::{BackendError, Result, corruption},
    operational,
    plan::{SearchPlan, Strategy},
};

/// Where candidate entries come from.
enum Source {
    /// The base entry alone, then nothing.
    Base(Option<EntryId>),
    /// Candidates already fetched and ordered by DN key.
    Fetched(std::vec::IntoIter<(EntryId, Entry)>),
    /// The base (for subtree scope), then its children.
    Children { base: Option<EntryId>, scan: ChildScan },
    /// The base (for subtree scope), then every descendant.
    Subtree { base: Option<EntryId>, scan: SubtreeScan },
}

/// A lazy, finite, non-restartable sequence of matching entries.
///
/// Yields `Result<Entry>`. Once it returns `None`, [`SearchResults::status`]
/// tells whether every match was returned or a limit stopped the search.
pub struct SearchResults<'b> {
    txn: Box<dyn ReadTxn + 'b>,
    container: &'b EntryContainer,
    rules: &'b RuleSet,
    filter: Filter,
    candidates: EntryIdSet,
    source: Source,
    size_limit: Option<usize>,
    deadline: Option<Instant>,
    include_operational: bool,
    returned: usize,
    finished: bool,
    status: Option<SearchStatus>,
}

impl std::fmt::Debug for SearchResults<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchResults")
            .field("filter", &self.filter.to_string())
            .field("returned", &self.returned)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Limits and options of one search.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchLimits {
    pub size_limit: Option<usize>,
    pub time_limit: Option<Duration>,
    pub include_operational: bool,
}

#[allow(clippy::result_large_err)]
impl<'b> SearchResults<'b> {
    /// Prepares execution of `plan` over the snapshot `txn`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoSuchEntry`] when the base does not exist,
    /// or a storage or decoding error.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        txn: Box<dyn ReadTxn + 'b>,
        container: &'b EntryContainer,
        rules: &'b RuleSet,
        base: &Dn,
        scope: Scope,
        filter: Filter,
        plan: SearchPlan,
        limits: SearchLimits,
    ) -> Result<Self> {
        let started = Instant::now();
        let base_key = container.key_for(base)?;
        let Some(base_id) = container.id_for_key(txn.as_ref(), &base_key)? else {
            return Err(BackendError::NoSuchEntry { dn: base.to_string() });
        };
        let subtree_base = (scope == Scope::Subtree).then_some(base_id);

        let source = match plan.strategy {
            Strategy::BaseEntry => Source::Base(Some(base_id)),
            Strategy::CandidateFetch => {
                let ids = plan.candidates.ids().unwrap_or_default();
                let mut fetched = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(entry) = container.read_entry(txn.as_ref(), *id)? else {
                        return Err(corruption(format!("index references missing {id}")));
                    };
                    if scope.contains(base, entry.dn()) {
                        fetched.push((container.key_for(entry.dn())?, *id, entry));
                    }
                }
                fetched.sort_by(|a, b| a.0.cmp(&b.0));
                Source::Fetched(
                    fetched.into_iter().map(|(_, id, e)| (id, e)).collect::<Vec<_>>().into_iter(),
                )
            },
            Strategy::ScopeScan => match scope {
                Scope::OneLevel => Source::Children { base: None, scan: container.child_scan(&base_key) },
                Scope::Base | Scope::Subtree => Source::Subtree {
                    base: subtree_base,
                    scan: container.subtree_scan(&base_key, Direction::Forward),
                },
            },
        };

        Ok(Self {
            txn,
            container,
            rules,
            filter,
            candidates: plan.candidates,
            source,
            size_limit: limits.size_limit,
            deadline: limits.time_limit.map(|limit| started + limit),
            include_operational: limits.include_operational,
            returned: 0,
            finished: false,
            status: None,
        })
    }

    /// How the search ended; `None` while entries remain or after an error.
    pub fn status(&self) -> Option<SearchStatus> {
        self.status
    }

    /// Number of entries returned so far.
    pub fn returned(&self) -> usize {
        self.returned
    }

    /// The next candidate `(id, entry)` before filtering.
    fn next_candidate(&mut self) -> Result<Option<(EntryId, Entry)>> {
        let id = match &mut self.source {
            Source::Base(base) => base.take(),
            Source::Fetched(entries) => return Ok(entries.next()),
            Source::Children { base, scan } => match base.take() {
                Some(id) => Some(id),
                None => scan
                    .next(self.txn.as_ref(), &self.container.trees().dn2id)?
                    .map(|(_, id)| id),
            },
            Source::Subtree { base, scan } => match base.take() {
                Some(id) => Some(id),
                None => scan.next(self.txn.as_ref())?.map(|(_, id)| id),
            },
        };
        let Some(id) = id else {
            return Ok(None);
        };
        match self.container.read_entry(self.txn.as_ref(), id)? {
            Some(entry) => Ok(Some((id, entry))),
            None => Err(corruption(format!("dn2id references missing {id}"))),
        }
    }

    /// The next entry in scope matching the filter.
    fn next_match(&mut self) -> Result<Option<(EntryId, Entry)>> {
        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                self.status = Some(SearchStatus::TimeLimitExceeded);
                return Ok(None);
            }
            let Some((id, entry)) = self.next_candidate()? else {
                return Ok(None);
            };
            if self.candidates.may_contain(id) && self.filter.matches(&entry, self.rules) {
                return Ok(Some((id, entry)));
            }
        }
    }
}

impl Iterator for SearchResults<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let found = match self.next_match() {
            Ok(found) => found,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            },
        };
        let Some((id, entry)) = found else {
            self.finished = true;
            self.status.get_or_insert(SearchStatus::Success);
            return None;
        };
        if self.size_limit.is_some_and(|limit| self.returned >= limit) {
            self.finished = true;
            self.status = Some(SearchStatus::SizeLimitExceeded);
            return None;
        }
        self.returned += 1;
        if !self.include_operational {
            return Some(Ok(entry));
        }
        Some(
            self.container
                .children_count(self.txn.as_ref(), id)
                .map(|children| operational::with_virtual(entry, children)),
        )
    }
}
