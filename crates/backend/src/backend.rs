//! The backend facade.
//!
//! A [`Backend`] owns one entry container on one substrate together with its
//! attribute indexes, VLV indexes, index trust state and pre-commit hooks.
//! Every operation is a method here; the components behind it are wired up
//! once in [`Backend::open`].

use std::{
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use dirstore_substrate::{
    Direction, KeyRange, Substrate, SubstrateConfig, dump, open_substrate,
};
use dirstore_types::{
    Dn, Entry, EntryId, Modification, Rdn, RuleSet, SearchRequest, config::BackendConfig,
};
use parking_lot::RwLock;
use snafu::ResultExt;
use tracing::instrument;

use crate::{
    cancel::Cancellation,
    container::EntryContainer,
    error::{BackendError, ConfigSnafu, Result, StorageSnafu, invalid_request},
    export::{ExportReader, ExportStream, write_export},
    hooks::PreCommitHook,
    import::{BulkLoader, ImportReport},
    index::IndexManager,
    operational,
    pipeline::{Pipeline, WriteOutcome, WriteRequest},
    plan::{Planner, SearchPlan},
    rebuild::{IndexSelector, Rebuilder, RebuildReport},
    search::{SearchLimits, SearchResults},
    trust::{TrustState, vlv_descriptor},
    verify::{Inconsistency, Verifier, VerifyOptions},
    vlv::{VlvManager, VlvRequest, VlvResponse},
};

/// One entry container with its indexes.
pub struct Backend {
    config: BackendConfig,
    substrate: Arc<dyn Substrate>,
    rules: RuleSet,
    container: EntryContainer,
    indexes: IndexManager,
    vlv: VlvManager,
    trust: TrustState,
    hooks: RwLock<Vec<Arc<dyn PreCommitHook>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("base_dn", &self.config.base_dn.to_string())
            .field("engine", &self.substrate.kind())
            .field("indexes", &self.config.indexes.len())
            .field("vlv_indexes", &self.config.vlv_indexes.len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::result_large_err)]
impl Backend {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the container described by `config` on `substrate`, creating
    /// its trees if needed.
    ///
    /// Indexes whose definition changed since the last open (or that are
    /// new) are untrusted until rebuilt, unless the container is empty.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] for an invalid configuration, or a
    /// storage or decoding error.
    pub fn open(config: BackendConfig, substrate: Arc<dyn Substrate>) -> Result<Self> {
        config.validate().context(ConfigSnafu)?;
        let rules = config.rule_set();
        let container =
            EntryContainer::open(substrate.as_ref(), config.base_dn.clone(), &config.encoding)?;
        let indexes = IndexManager::open(substrate.as_ref(), &config.indexes, &rules)?;
        let vlv = VlvManager::open(substrate.as_ref(), &config.vlv_indexes, &rules)?;

        let mut definitions = indexes.definitions()?;
        definitions.extend(vlv.definitions()?);
        let entries = {
            let txn = substrate.begin_read().context(StorageSnafu)?;
            container.entry_count(txn.as_ref())?
        };
        let trust = TrustState::reconcile(
            substrate.as_ref(),
            container.trees().state.clone(),
            definitions,
            entries == 0,
        )?;

        tracing::info!(
            base = %config.base_dn,
            engine = ?substrate.kind(),
            entries,
            indexes = config.indexes.len(),
            vlv_indexes = config.vlv_indexes.len(),
            untrusted = trust.untrusted().len(),
            "backend opened"
        );
        Ok(Self {
            config,
            substrate,
            rules,
            container,
            indexes,
            vlv,
            trust,
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Opens the engine described by `substrate` and then the backend.
    ///
    /// # Errors
    ///
    /// See [`Backend::open`]; also fails if the engine cannot be opened.
    pub fn open_with(config: BackendConfig, substrate: &SubstrateConfig) -> Result<Self> {
        let substrate = open_substrate(substrate).context(StorageSnafu)?;
        Self::open(config, substrate)
    }

    /// The configuration this backend was opened with.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The substrate holding the container.
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Descriptor names of indexes that must be rebuilt before use.
    pub fn untrusted_indexes(&self) -> Vec<String> {
        self.trust.untrusted()
    }

    /// Registers a hook that sees every later write before it commits.
    pub fn register_hook(&self, hook: Arc<dyn PreCommitHook>) {
        tracing::debug!(hook = hook.name(), "registered pre-commit hook");
        self.hooks.write().push(hook);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Runs one write request atomically.
    ///
    /// # Errors
    ///
    /// Returns the input error describing why the request was refused,
    /// [`BackendError::ConcurrentModification`] when another writer changed
    /// the same entries first, [`BackendError::Cancelled`], or a storage error.
    #[instrument(skip(self, request, cancel), fields(dn = %request.dn(), kind = ?request.kind()))]
    pub fn execute(
        &self,
        request: &WriteRequest,
        cancel: Option<&Cancellation>,
    ) -> Result<WriteOutcome> {
        let hooks = self.hooks.read().clone();
        Pipeline {
            substrate: self.substrate.as_ref(),
            container: &self.container,
            indexes: &self.indexes,
            vlv: &self.vlv,
            rules: &self.rules,
            hooks: &hooks,
            cancel,
        }
        .execute(request)
    }

    /// Adds `entry` below its existing parent.
    ///
    /// # Errors
    ///
    /// See [`Backend::execute`].
    pub fn add(&self, entry: Entry, cancel: Option<&Cancellation>) -> Result<EntryId> {
        match self.execute(&WriteRequest::Add { entry }, cancel)? {
            WriteOutcome::Added(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Deletes `dn`; with `cascade`, its whole subtree. Returns the number
    /// of entries removed.
    ///
    /// # Errors
    ///
    /// See [`Backend::execute`].
    pub fn delete(&self, dn: &Dn, cascade: bool, cancel: Option<&Cancellation>) -> Result<u64> {
        match self.execute(&WriteRequest::Delete { dn: dn.clone(), cascade }, cancel)? {
            WriteOutcome::Deleted { entries } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    /// Applies `changes` to `dn` in order.
    ///
    /// # Errors
    ///
    /// See [`Backend::execute`].
    pub fn modify(
        &self,
        dn: &Dn,
        changes: Vec<Modification>,
        cancel: Option<&Cancellation>,
    ) -> Result<EntryId> {
        match self.execute(&WriteRequest::Modify { dn: dn.clone(), changes }, cancel)? {
            WriteOutcome::Modified(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Renames `dn` to `new_rdn`, optionally below `new_superior`. Returns
    /// the number of entries whose DN changed.
    ///
    /// # Errors
    ///
    /// See [`Backend::execute`].
    pub fn rename(
        &self,
        dn: &Dn,
        new_rdn: Rdn,
        new_superior: Option<Dn>,
        delete_old_rdn: bool,
        cancel: Option<&Cancellation>,
    ) -> Result<u64> {
        let request = WriteRequest::Rename { dn: dn.clone(), new_rdn, new_superior, delete_old_rdn };
        match self.execute(&request, cancel)? {
            WriteOutcome::Renamed { entries } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Starts a search. Results are read lazily from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoSuchEntry`] when the base does not exist,
    /// [`BackendError::OutsideBase`] when it lies outside the container, or
    /// a storage error.
    #[instrument(skip(self, request), fields(base = %request.base, scope = ?request.scope, filter = %request.filter))]
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults<'_>> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        let plan = self.plan(txn.as_ref(), request)?;
        let limits = SearchLimits {
            size_limit: request.size_limit.or(self.config.search.default_size_limit),
            time_limit: request.time_limit.or(self.config.search.default_time_limit),
            include_operational: request.include_operational,
        };
        SearchResults::open(
            txn,
            &self.container,
            &self.rules,
            &request.base,
            request.scope,
            request.filter.clone(),
            plan,
            limits,
        )
    }

    /// Plans `request` without running it.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::OutsideBase`] or a storage error.
    pub fn explain(&self, request: &SearchRequest) -> Result<SearchPlan> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        self.plan(txn.as_ref(), request)
    }

    fn plan(&self, txn: &dyn dirstore_substrate::ReadTxn, request: &SearchRequest) -> Result<SearchPlan> {
        let base_key = self.container.key_for(&request.base)?;
        Planner::new(
            txn,
            &self.container,
            &self.indexes,
            &self.trust,
            &self.config.search,
            &base_key,
            request.scope,
        )
        .plan(&request.filter)
    }

    /// Counts every entry `request` matches, ignoring its limits.
    ///
    /// # Errors
    ///
    /// See [`Backend::search`].
    pub fn count_matches(&self, request: &SearchRequest) -> Result<u64> {
        let unlimited = SearchRequest {
            size_limit: None,
            time_limit: None,
            include_operational: false,
            ..request.clone()
        };
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        let plan = self.plan(txn.as_ref(), &unlimited)?;
        let limits = SearchLimits { size_limit: None, time_limit: None, include_operational: false };
        let results = SearchResults::open(
            txn,
            &self.container,
            &self.rules,
            &unlimited.base,
            unlimited.scope,
            unlimited.filter.clone(),
            plan,
            limits,
        )?;
        let mut count = 0;
        for entry in results {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Serves one page of a VLV index.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::UnknownIndex`] for an unconfigured name,
    /// [`BackendError::IndexUntrusted`] when the index needs a rebuild, or a
    /// storage error.
    #[instrument(skip(self, request), fields(index = %request.index))]
    pub fn vlv_search(&self, request: &VlvRequest) -> Result<VlvResponse> {
        let index = self
            .vlv
            .get(&request.index)
            .ok_or_else(|| BackendError::UnknownIndex { name: request.index.clone() })?;
        if !self.trust.is_trusted(&vlv_descriptor(index.name())) {
            return Err(BackendError::IndexUntrusted { name: index.name().to_string() });
        }
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        self.vlv.search(txn.as_ref(), &self.container, request)
    }

    /// Reads one entry; with `include_operational`, adds the computed
    /// subordinate attributes.
    ///
    /// # Errors
    ///
    /// Returns a storage or decoding error.
    pub fn get_entry(&self, dn: &Dn, include_operational: bool) -> Result<Option<Entry>> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        let Some((id, entry)) = self.container.entry_by_dn(txn.as_ref(), dn)? else {
            return Ok(None);
        };
        if !include_operational {
            return Ok(Some(entry));
        }
        let children = self.container.children_count(txn.as_ref(), id)?;
        Ok(Some(operational::with_virtual(entry, children)))
    }

    /// Number of entries in the container.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn entry_count(&self) -> Result<u64> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        self.container.entry_count(txn.as_ref())
    }

    /// DNs of the direct children of `dn`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoSuchEntry`] when `dn` does not exist, or a
    /// storage or decoding error.
    pub fn children(&self, dn: &Dn) -> Result<Vec<Dn>> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        let key = self.container.key_for(dn)?;
        if self.container.id_for_key(txn.as_ref(), &key)?.is_none() {
            return Err(BackendError::NoSuchEntry { dn: dn.to_string() });
        }
        let mut scan = self.container.child_scan(&key);
        let mut children = Vec::new();
        while let Some((_, id)) = scan.next(txn.as_ref(), &self.container.trees().dn2id)? {
            if let Some(entry) = self.container.read_entry(txn.as_ref(), id)? {
                children.push(entry.dn().clone());
            }
        }
        Ok(children)
    }

    // ========================================================================
    // Bulk load and export
    // ========================================================================

    /// Loads `entries`, parents first, in batches.
    ///
    /// # Errors
    ///
    /// Returns a storage error; earlier batches stay committed.
    #[instrument(skip(self, entries, cancel))]
    pub fn bulk_load<I>(&self, entries: I, cancel: Option<&Cancellation>) -> Result<ImportReport>
    where
        I: IntoIterator<Item = Entry>,
    {
        self.loader(cancel).load(entries.into_iter().map(Ok))
    }

    /// Loads an export stream written by [`Backend::export_to_writer`].
    ///
    /// # Errors
    ///
    /// Returns corruption for a malformed stream, or a storage or I/O error;
    /// batches committed before the failure stay.
    #[instrument(skip(self, reader, cancel))]
    pub fn import_from_reader<R: Read>(
        &self,
        reader: R,
        cancel: Option<&Cancellation>,
    ) -> Result<ImportReport> {
        let entries = ExportReader::new(reader)?;
        self.loader(cancel).load(entries)
    }

    fn loader<'a>(&'a self, cancel: Option<&'a Cancellation>) -> BulkLoader<'a> {
        BulkLoader {
            substrate: self.substrate.as_ref(),
            container: &self.container,
            indexes: &self.indexes,
            vlv: &self.vlv,
            rules: &self.rules,
            batch_size: self.config.import.batch_size,
            cancel,
        }
    }

    /// Every entry, parents before children, from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn bulk_export(&self) -> Result<ExportStream<'_>> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        Ok(ExportStream::new(txn, &self.container))
    }

    /// Writes every entry to `writer` as an export stream. Returns the
    /// number of entries written.
    ///
    /// # Errors
    ///
    /// Returns a storage, codec or I/O error.
    #[instrument(skip(self, writer))]
    pub fn export_to_writer<W: Write>(&self, writer: W) -> Result<u64> {
        let written = write_export(self.bulk_export()?, writer)?;
        tracing::info!(entries = written, "exported entries");
        Ok(written)
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Rebuilds the selected indexes from the stored entries.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::UnknownIndex`], [`BackendError::Cancelled`],
    /// [`BackendError::ConcurrentModification`] or a storage error. Nothing
    /// changes on error.
    #[instrument(skip(self, cancel))]
    pub fn rebuild_index(
        &self,
        selector: &IndexSelector,
        cancel: Option<&Cancellation>,
    ) -> Result<RebuildReport> {
        Rebuilder {
            substrate: self.substrate.as_ref(),
            container: &self.container,
            indexes: &self.indexes,
            vlv: &self.vlv,
            trust: &self.trust,
            rules: &self.rules,
            cancel,
        }
        .run(selector)
    }

    /// Checks the container and its trusted indexes against each other.
    ///
    /// # Errors
    ///
    /// Returns a storage or decoding error; findings are not errors.
    #[instrument(skip(self))]
    pub fn verify_index_consistency(&self, options: VerifyOptions) -> Result<Vec<Inconsistency>> {
        let txn = self.substrate.begin_read().context(StorageSnafu)?;
        Verifier {
            txn: txn.as_ref(),
            container: &self.container,
            indexes: &self.indexes,
            vlv: &self.vlv,
            trust: &self.trust,
            rules: &self.rules,
        }
        .run(options)
    }

    /// Writes a consistent copy of the whole substrate to `path`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn backup(&self, path: &Path) -> Result<()> {
        self.substrate.backup_to(path).context(StorageSnafu)?;
        tracing::info!("backup written");
        Ok(())
    }
}

/// Opens the engine described by `config` and loads the backup at `path`
/// into it. The engine must not hold any data yet.
///
/// # Errors
///
/// Returns [`BackendError::InvalidRequest`] when the engine already holds
/// data, or a storage error.
#[allow(clippy::result_large_err)]
pub fn restore_substrate(config: &SubstrateConfig, path: &Path) -> Result<Arc<dyn Substrate>> {
    let substrate = open_substrate(config).context(StorageSnafu)?;
    let names = substrate.tree_names().context(StorageSnafu)?;
    let trees = names
        .iter()
        .map(|name| substrate.open_tree(name))
        .collect::<Result<Vec<_>, _>>()
        .context(StorageSnafu)?;
    {
        let txn = substrate.begin_read().context(StorageSnafu)?;
        for tree in &trees {
            if !txn.scan(tree, &KeyRange::all(), Direction::Forward, 1).context(StorageSnafu)?.is_empty()
            {
                return Err(invalid_request(format!(
                    "cannot restore into a substrate holding data (tree {tree})"
                )));
            }
        }
    }
    let pairs = dump::restore_from_file(substrate.as_ref(), path).context(StorageSnafu)?;
    tracing::info!(pairs, path = %path.display(), "restored substrate from backup");
    Ok(substrate)
}

fn unexpected(outcome: &WriteOutcome) -> BackendError {
    crate::error::corruption(format!("write returned mismatched outcome {outcome:?}"))
}
