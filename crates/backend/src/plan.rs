//! Query planning.
//!
//! The planner turns a filter into a candidate [`EntryIdSet`] using the
//! attribute indexes. Leaves resolve to index reads; anything that cannot be
//! answered by a trusted index resolves to undefined, which means "every
//! entry in scope" and leaves the work to the post-filter. Candidates are
//! always a superset of the matching entries, so the search executor
//! re-checks every entry against the full filter.

use std::fmt;

use dirstore_substrate::{KeyRange, ReadTxn};
use dirstore_types::{
    Filter, Scope,
    config::{IndexKind, SearchConfig},
};

use crate::{
    container::EntryContainer,
    entry_id_set::EntryIdSet,
    error::Result,
    index::{AttributeIndex, IndexManager},
    indexer::{KeyDeriver, MAX_INDEX_KEY_LEN, PRESENCE_KEY},
    trust::{TrustState, index_descriptor},
};

/// How one filter node was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A point read of one index key.
    Indexed {
        /// Index tree.
        index: String,
        /// Key read.
        key: Vec<u8>,
    },
    /// A range or prefix scan over an index tree.
    Range {
        /// Index tree.
        index: String,
    },
    /// The intersection of several substring keys.
    Substring {
        /// Index tree.
        index: String,
        /// Number of keys or scans intersected.
        probes: usize,
    },
    /// A set combination of the children.
    Composite,
    /// No usable index; every entry in scope is a candidate.
    Undefined {
        /// Why.
        reason: String,
    },
}

/// One evaluated filter node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    /// The node in string form.
    pub filter: String,
    /// How it was answered.
    pub resolution: Resolution,
    /// Candidate count, `None` when undefined.
    pub candidates: Option<usize>,
}

/// How the executor produces entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Read the base entry only.
    BaseEntry,
    /// Fetch each candidate by id, then check scope and filter.
    CandidateFetch,
    /// Walk the base's DN range and test candidate membership.
    ScopeScan,
}

/// The planner's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPlan {
    /// Evaluated nodes, in evaluation order.
    pub nodes: Vec<NodeReport>,
    /// Candidate set for the whole filter.
    pub candidates: EntryIdSet,
    /// Execution strategy.
    pub strategy: Strategy,
}

impl SearchPlan {
    /// Whether no index narrowed the search.
    pub fn is_unindexed(&self) -> bool {
        self.strategy == Strategy::ScopeScan && !self.candidates.is_defined()
    }
}

impl fmt::Display for SearchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.strategy)?;
        match self.candidates.len() {
            Some(n) => write!(f, " over {n} candidates")?,
            None => write!(f, " over all entries in scope")?,
        }
        for node in &self.nodes {
            write!(f, "\n  {} -> {:?}", node.filter, node.resolution)?;
        }
        Ok(())
    }
}

/// A node's candidates. `exact` means the set holds precisely the entries
/// matching the node, which makes it safe to subtract for a NOT.
#[derive(Debug, Clone)]
struct Candidates {
    set: EntryIdSet,
    exact: bool,
}

impl Candidates {
    fn undefined() -> Self {
        Self { set: EntryIdSet::undefined(), exact: false }
    }
}

/// Evaluation cost class, cheapest first.
fn cost_rank(filter: &Filter) -> u8 {
    match filter {
        Filter::Equality { .. } | Filter::Approximate { .. } => 0,
        Filter::Present { .. } => 1,
        Filter::Substring { .. } => 2,
        Filter::GreaterOrEqual { .. } | Filter::LessOrEqual { .. } => 3,
        Filter::And(_) | Filter::Or(_) => 4,
        Filter::Not(_) => 5,
    }
}

/// Intersects `set` into `running`. Returns `true` once the result is small
/// enough to stop probing.
fn narrow(running: &mut Option<EntryIdSet>, set: EntryIdSet, threshold: usize) -> bool {
    let next = match running.take() {
        Some(r) => r.intersect(&set),
        None => set,
    };
    let done = next.len().is_some_and(|n| n <= threshold);
    *running = Some(next);
    done
}

/// Plans one search against a read snapshot.
pub(crate) struct Planner<'a> {
    txn: &'a dyn ReadTxn,
    container: &'a EntryContainer,
    indexes: &'a IndexManager,
    trust: &'a TrustState,
    config: &'a SearchConfig,
    /// DN key of the search base.
    base_key: &'a [u8],
    scope: Scope,
    nodes: Vec<NodeReport>,
}

#[allow(clippy::result_large_err)]
impl<'a> Planner<'a> {
    pub fn new(
        txn: &'a dyn ReadTxn,
        container: &'a EntryContainer,
        indexes: &'a IndexManager,
        trust: &'a TrustState,
        config: &'a SearchConfig,
        base_key: &'a [u8],
        scope: Scope,
    ) -> Self {
        Self { txn, container, indexes, trust, config, base_key, scope, nodes: Vec::new() }
    }

    /// Plans `filter`.
    pub fn plan(mut self, filter: &Filter) -> Result<SearchPlan> {
        if self.scope == Scope::Base {
            return Ok(SearchPlan {
                nodes: Vec::new(),
                candidates: EntryIdSet::undefined(),
                strategy: Strategy::BaseEntry,
            });
        }
        let candidates = self.evaluate(filter)?.set;
        let strategy = match candidates.len() {
            Some(n) if n <= self.config.candidate_fetch_limit => Strategy::CandidateFetch,
            _ => Strategy::ScopeScan,
        };
        if !candidates.is_defined() {
            tracing::warn!(filter = %filter, "unindexed search; scanning every entry in scope");
        }
        tracing::debug!(filter = %filter, ?strategy, candidates = ?candidates.len(), "planned search");
        Ok(SearchPlan { nodes: self.nodes, candidates, strategy })
    }

    fn evaluate(&mut self, filter: &Filter) -> Result<Candidates> {
        match filter {
            Filter::And(children) => self.evaluate_and(filter, children),
            Filter::Or(children) => {
                let mut set = EntryIdSet::empty();
                let mut exact = true;
                for child in children {
                    let c = self.evaluate(child)?;
                    set = set.union(&c.set);
                    exact &= c.exact;
                    if !set.is_defined() {
                        break;
                    }
                }
                let exact = exact && set.is_defined();
                self.report(filter, Resolution::Composite, &set);
                Ok(Candidates { set, exact })
            },
            Filter::Not(child) => {
                let inner = self.evaluate(child)?;
                let result = if inner.exact && inner.set.is_defined() {
                    let universe = self.universe()?;
                    Candidates { exact: universe.is_defined(), set: inner.set.negate_within(&universe) }
                } else {
                    Candidates::undefined()
                };
                self.report(filter, Resolution::Composite, &result.set);
                Ok(result)
            },
            _ => self.evaluate_leaf(filter),
        }
    }

    fn evaluate_and(&mut self, filter: &Filter, children: &[Filter]) -> Result<Candidates> {
        let mut ordered: Vec<&Filter> = children.iter().collect();
        ordered.sort_by_key(|f| cost_rank(f));
        let (negated, positive): (Vec<&Filter>, Vec<&Filter>) =
            ordered.into_iter().partition(|f| matches!(f, Filter::Not(_)));

        let mut running: Option<EntryIdSet> = None;
        let mut exact = true;
        let mut evaluated = 0;
        for child in &positive {
            let c = self.evaluate(child)?;
            evaluated += 1;
            exact &= c.exact;
            if narrow(&mut running, c.set, self.config.candidate_threshold) {
                break;
            }
        }
        exact &= evaluated == positive.len();

        let mut set = running.unwrap_or_else(EntryIdSet::undefined);
        for child in negated {
            let Filter::Not(inner) = child else { continue };
            if !set.is_defined() {
                exact = false;
                break;
            }
            let c = self.evaluate(inner)?;
            if c.exact && c.set.is_defined() {
                set = set.difference(&c.set);
            } else {
                exact = false;
            }
        }
        let exact = exact && set.is_defined();
        self.report(filter, Resolution::Composite, &set);
        Ok(Candidates { set, exact })
    }

    fn evaluate_leaf(&mut self, filter: &Filter) -> Result<Candidates> {
        let Some(attribute) = filter.attribute() else {
            return Ok(Candidates::undefined());
        };
        let Some(index) = self.indexes.index_for(attribute) else {
            return Ok(self.undefined(filter, format!("{attribute} is not indexed")));
        };
        let deriver = *index.deriver();

        match filter {
            Filter::Equality { value, .. } => {
                let key = deriver.equality_key(value);
                let exact = !KeyDeriver::is_truncated(&key);
                self.point(filter, index, IndexKind::Equality, key, exact)
            },
            Filter::Present { .. } => {
                self.point(filter, index, IndexKind::Presence, PRESENCE_KEY.to_vec(), true)
            },
            Filter::Approximate { value, .. } => match deriver.approximate_key(value) {
                Some(key) => self.point(filter, index, IndexKind::Approximate, key, false),
                None => Ok(self.undefined(filter, "assertion has no phonetic content".to_string())),
            },
            Filter::GreaterOrEqual { value, .. } => {
                let range = KeyRange::at_or_after(&deriver.ordering_key(value));
                self.range(filter, index, range)
            },
            Filter::LessOrEqual { value, .. } => {
                let range = KeyRange::at_or_before(&deriver.ordering_key(value));
                self.range(filter, index, range)
            },
            Filter::Substring { sub_initial, sub_any, sub_final, .. } => self.substring(
                filter,
                index,
                sub_initial.as_deref(),
                sub_any,
                sub_final.as_deref(),
            ),
            Filter::And(_) | Filter::Or(_) | Filter::Not(_) => Ok(Candidates::undefined()),
        }
    }

    /// The tree of `kind` on `index` if it exists and is trusted.
    fn usable_tree(&self, index: &AttributeIndex, kind: IndexKind) -> Option<dirstore_substrate::Tree> {
        let tree = index.tree(kind)?;
        if self.trust.is_trusted(&index_descriptor(tree.name())) {
            Some(tree.clone())
        } else {
            tracing::warn!(index = %tree, "ignoring untrusted index");
            None
        }
    }

    fn point(
        &mut self,
        filter: &Filter,
        index: &AttributeIndex,
        kind: IndexKind,
        key: Vec<u8>,
        exact: bool,
    ) -> Result<Candidates> {
        let Some(tree) = self.usable_tree(index, kind) else {
            return Ok(self.undefined(filter, format!("no trusted {} index", kind.as_str())));
        };
        let set = self.indexes.read_set(self.txn, &tree, &key)?;
        let exact = exact && set.is_defined();
        self.report(filter, Resolution::Indexed { index: tree.name().to_string(), key }, &set);
        Ok(Candidates { set, exact })
    }

    fn range(&mut self, filter: &Filter, index: &AttributeIndex, range: KeyRange) -> Result<Candidates> {
        let Some(tree) = self.usable_tree(index, IndexKind::Ordering) else {
            return Ok(self.undefined(filter, "no trusted ordering index".to_string()));
        };
        let set = self.indexes.scan_union(self.txn, &tree, range, self.config.candidate_fetch_limit)?;
        self.report(filter, Resolution::Range { index: tree.name().to_string() }, &set);
        Ok(Candidates { set, exact: false })
    }

    fn substring(
        &mut self,
        filter: &Filter,
        index: &AttributeIndex,
        initial: Option<&[u8]>,
        any: &[Vec<u8>],
        last: Option<&[u8]>,
    ) -> Result<Candidates> {
        let deriver = *index.deriver();
        let rule = deriver.rule;
        let substring_tree = self.usable_tree(index, IndexKind::Substring);
        let cap = self.config.candidate_fetch_limit;
        let mut running: Option<EntryIdSet> = None;
        let mut probes = 0;
        let mut used_tree = None;

        let threshold = self.config.candidate_threshold;

        // The leading fragment is a prefix of the whole normalized value.
        let mut initial_done = false;
        if let Some(initial) = initial.map(|i| rule.substring_form(i)).filter(|i| !i.is_empty()) {
            if rule != dirstore_types::MatchingRule::Integer {
                let prefix_tree = self
                    .usable_tree(index, IndexKind::Equality)
                    .or_else(|| self.usable_tree(index, IndexKind::Ordering));
                if let Some(tree) = prefix_tree {
                    let prefix = &initial[..initial.len().min(MAX_INDEX_KEY_LEN)];
                    let set = self.indexes.scan_union(self.txn, &tree, KeyRange::prefix(prefix), cap)?;
                    probes += 1;
                    used_tree = Some(tree.name().to_string());
                    initial_done = true;
                    if narrow(&mut running, set, threshold) {
                        return Ok(self.finish_substring(filter, running, used_tree, probes));
                    }
                }
            }
            if !initial_done {
                if let Some(tree) = &substring_tree {
                    let set = self.fragment(tree, &deriver, &initial, false)?;
                    probes += 1;
                    used_tree = Some(tree.name().to_string());
                    if narrow(&mut running, set, threshold) {
                        return Ok(self.finish_substring(filter, running, used_tree, probes));
                    }
                }
            }
        }

        if let Some(tree) = &substring_tree {
            let mut fragments: Vec<(Vec<u8>, bool)> =
                any.iter().map(|f| (rule.substring_form(f), false)).collect();
            if let Some(last) = last {
                fragments.push((rule.substring_form(last), true));
            }
            for (fragment, is_final) in fragments.iter().filter(|(f, _)| !f.is_empty()) {
                let set = self.fragment(tree, &deriver, fragment, *is_final)?;
                probes += 1;
                used_tree = Some(tree.name().to_string());
                if narrow(&mut running, set, threshold) {
                    break;
                }
            }
        }

        Ok(self.finish_substring(filter, running, used_tree, probes))
    }

    /// Candidates for one substring fragment.
    fn fragment(
        &self,
        tree: &dirstore_substrate::Tree,
        deriver: &KeyDeriver,
        fragment: &[u8],
        is_final: bool,
    ) -> Result<EntryIdSet> {
        let length = deriver.substring_length;
        let cap = self.config.candidate_fetch_limit;
        if is_final && fragment.len() <= length {
            // A trailing fragment is itself the key at its position.
            return self.indexes.read_set(self.txn, tree, fragment);
        }
        if fragment.len() < length {
            return self.indexes.scan_union(self.txn, tree, KeyRange::prefix(fragment), cap);
        }
        let mut running: Option<EntryIdSet> = None;
        for window in deriver.substring_windows(fragment) {
            let set = self.indexes.read_set(self.txn, tree, &window)?;
            if narrow(&mut running, set, self.config.candidate_threshold) {
                break;
            }
        }
        Ok(running.unwrap_or_else(EntryIdSet::undefined))
    }

    fn finish_substring(
        &mut self,
        filter: &Filter,
        running: Option<EntryIdSet>,
        tree: Option<String>,
        probes: usize,
    ) -> Candidates {
        match (running, tree) {
            (Some(set), Some(index)) => {
                self.report(filter, Resolution::Substring { index, probes }, &set);
                Candidates { set, exact: false }
            },
            _ => self.undefined(filter, "no trusted substring index covers the assertion".to_string()),
        }
    }

    /// Ids of every entry in scope of the base, or undefined above the
    /// fetch limit.
    fn universe(&self) -> Result<EntryIdSet> {
        let cap = self.config.candidate_fetch_limit;
        let mut ids = Vec::new();
        match self.scope {
            Scope::Base => {
                if let Some(id) = self.container.id_for_key(self.txn, self.base_key)? {
                    ids.push(id);
                }
            },
            Scope::OneLevel => {
                let mut scan = self.container.child_scan(self.base_key);
                while let Some((_, id)) = scan.next(self.txn, &self.container.trees().dn2id)? {
                    ids.push(id);
                    if ids.len() > cap {
                        return Ok(EntryIdSet::Undefined { count: ids.len() as u64 });
                    }
                }
            },
            Scope::Subtree => {
                if let Some(id) = self.container.id_for_key(self.txn, self.base_key)? {
                    ids.push(id);
                }
                let mut scan =
                    self.container.subtree_scan(self.base_key, dirstore_substrate::Direction::Forward);
                while let Some((_, id)) = scan.next(self.txn)? {
                    ids.push(id);
                    if ids.len() > cap {
                        return Ok(EntryIdSet::Undefined { count: ids.len() as u64 });
                    }
                }
            },
        }
        Ok(EntryIdSet::from_ids(ids))
    }

    fn undefined(&mut self, filter: &Filter, reason: String) -> Candidates {
        self.nodes.push(NodeReport {
            filter: filter.to_string(),
            resolution: Resolution::Undefined { reason },
            candidates: None,
        });
        Candidates::undefined()
    }

    fn report(&mut self, filter: &Filter, resolution: Resolution, set: &EntryIdSet) {
        self.nodes.push(NodeReport { filter: filter.to_string(), resolution, candidates: set.len() });
    }
}
