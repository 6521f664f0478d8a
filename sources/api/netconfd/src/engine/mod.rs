//! The engine owns the datastores.  Every read and write of a configuration tree goes through it,
//! so it can enforce session locks and run the validate-commit protocol that keeps `running` from
//! ever holding an unvalidated tree.
//!
//! The backend sits behind a reader/writer lock.  Queries take the read side; everything that
//! changes a datastore takes the write side, and validate-commit holds it from the snapshot of
//! `running` until the snapshot is gone, so no reader sees an intermediate state.

mod error;
pub mod lock;

pub use error::{Error, Result};
pub use lock::LockTable;

use datastore::edit::{self, DefaultOperation};
use datastore::select::{Path, Selector};
use datastore::{ConfigTree, DataStore, DatastoreId};
use log::{debug, info, trace, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::validate::{Validation, Validator};

/// Identifies a client session.  Allocated by the server, starting at 1.
pub type SessionId = u32;

/// Who is asking for an operation.  Locks only bind client sessions; the daemon's own startup
/// bookkeeping runs as the internal caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Caller {
    Internal,
    Session(SessionId),
}

/// Where validate-commit takes the new content of `running` from.
#[derive(Debug, Copy, Clone)]
pub enum CommitSource<'a> {
    /// The whole tree of a datastore replaces `running`.
    Datastore(&'a DatastoreId),
    /// The fragment is merged into the current `running`.
    Merge(&'a ConfigTree),
}

/// Result of a validate-commit that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Validation rejected the new tree and `running` was restored.
    Rejected(String),
}

pub struct Engine<D> {
    ds: RwLock<D>,
    locks: LockTable,
    validator: Box<dyn Validator + Send + Sync>,
    scratch_sequence: AtomicU64,
}

impl<D: DataStore> Engine<D> {
    pub fn new<V>(datastore: D, validator: V) -> Self
    where
        V: Validator + Send + Sync + 'static,
    {
        Self {
            ds: RwLock::new(datastore),
            locks: LockTable::new(),
            validator: Box::new(validator),
            scratch_sequence: AtomicU64::new(0),
        }
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, D>> {
        self.ds.read().ok().context(error::DataStoreLockSnafu)
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, D>> {
        self.ds.write().ok().context(error::DataStoreLockSnafu)
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn exists(&self, id: &DatastoreId) -> Result<bool> {
        let ds = self.read_guard()?;
        exists(&*ds, id)
    }

    /// Creates `id` holding the empty tree.
    pub fn create(&self, caller: Caller, id: &DatastoreId) -> Result<()> {
        let mut ds = self.write_guard()?;
        ensure!(
            !exists(&*ds, id)?,
            error::AlreadyExistsSnafu { id: id.name() }
        );
        self.locks.check(id, caller)?;
        debug!("Creating datastore '{}'", id);
        ds.reset(id)
            .context(error::DataStoreSnafu { op: "create" })
    }

    pub fn delete(&self, caller: Caller, id: &DatastoreId) -> Result<()> {
        let mut ds = self.write_guard()?;
        ensure!(exists(&*ds, id)?, error::NotFoundSnafu { id: id.name() });
        self.locks.check(id, caller)?;
        debug!("Deleting datastore '{}'", id);
        ds.remove(id).context(error::DataStoreSnafu { op: "delete" })
    }

    /// Replaces the content of `to` with a duplicate of the tree in `from`.
    pub fn copy(&self, caller: Caller, from: &DatastoreId, to: &DatastoreId) -> Result<()> {
        let mut ds = self.write_guard()?;
        ensure!(exists(&*ds, from)?, error::NotFoundSnafu { id: from.name() });
        self.locks.check(to, caller)?;
        debug!("Copying datastore '{}' to '{}'", from, to);
        ds.copy(from, to).context(error::DataStoreSnafu { op: "copy" })
    }

    /// Collapses `id` to the empty tree, creating it if it's absent.
    pub fn reset(&self, caller: Caller, id: &DatastoreId) -> Result<()> {
        let mut ds = self.write_guard()?;
        self.locks.check(id, caller)?;
        debug!("Resetting datastore '{}'", id);
        ds.reset(id).context(error::DataStoreSnafu { op: "reset" })
    }

    /// Returns the part of the tree in `id` chosen by `selector`.
    pub fn get(&self, id: &DatastoreId, selector: &Selector) -> Result<ConfigTree> {
        let ds = self.read_guard()?;
        let tree = read_tree(&*ds, id)?;
        Ok(selector.select(&tree))
    }

    /// Applies an edit fragment to the tree in `id`.  Nothing is stored unless the whole edit
    /// succeeds.
    pub fn put(
        &self,
        caller: Caller,
        id: &DatastoreId,
        operation: DefaultOperation,
        path: Option<&Path>,
        fragment: ConfigTree,
    ) -> Result<()> {
        let mut ds = self.write_guard()?;
        let mut tree = read_tree(&*ds, id)?;
        self.locks.check(id, caller)?;
        debug!("Editing datastore '{}' with default operation {:?}", id, operation);
        edit::apply(&mut tree, operation, path, fragment)
            .context(error::EditSnafu { id: id.name() })?;
        ds.write(id, &tree).context(error::DataStoreSnafu { op: "put" })
    }

    // Locks are taken under the backend write guard so a lock can't land in the middle of
    // another session's write.

    /// Locks `id` for `session` if `is_live` says the session is still open.  Ending a session
    /// closes it before `unlock_all` takes the write guard, so a lock taken here is either
    /// refused or released.
    pub fn lock<F>(&self, id: &DatastoreId, session: SessionId, is_live: F) -> Result<()>
    where
        F: Fn(SessionId) -> bool,
    {
        let _ds = self.write_guard()?;
        ensure!(is_live(session), error::SessionClosedSnafu { session });
        self.locks.lock(id, session)
    }

    pub fn unlock(&self, id: &DatastoreId, session: SessionId) -> Result<()> {
        let _ds = self.write_guard()?;
        self.locks.unlock(id, session)
    }

    /// Releases every lock the session holds; used when a session ends for any reason.
    pub fn unlock_all(&self, session: SessionId) -> Result<Vec<DatastoreId>> {
        let _ds = self.write_guard()?;
        self.locks.unlock_all(session)
    }

    /// Validates the tree in `id` without changing anything.
    pub fn validate(&self, id: &DatastoreId) -> Result<Validation> {
        let ds = self.read_guard()?;
        let tree = read_tree(&*ds, id)?;
        self.run_validator(&tree)
    }

    /// Makes `source` the new `running`, but only if it validates.
    ///
    /// The source is read first, so `running` may be its own source.  `running` is then
    /// snapshotted to a scratch datastore, populated from the source, and validated.  If
    /// validation rejects the tree, or anything fails after the snapshot, `running` is restored
    /// from the snapshot.  The snapshot is removed on every path.
    pub fn validate_commit(&self, caller: Caller, source: CommitSource<'_>) -> Result<CommitOutcome> {
        let running = DatastoreId::running();
        let mut ds = self.write_guard()?;
        self.locks.check(&running, caller)?;

        let new_tree = match source {
            CommitSource::Datastore(id) => {
                debug!("Validate-commit from datastore '{}'", id);
                read_tree(&*ds, id)?
            }
            CommitSource::Merge(fragment) => {
                debug!("Validate-commit merging {} nodes", fragment.root().len());
                let mut tree = match ds
                    .read(&running)
                    .context(error::DataStoreSnafu { op: "read running" })?
                {
                    Some(tree) => tree,
                    None => ConfigTree::empty(),
                };
                edit::apply(&mut tree, DefaultOperation::Merge, None, fragment.clone())
                    .context(error::EditSnafu { id: running.name() })?;
                tree
            }
        };

        let snapshot = self.next_scratch();
        let had_running = exists(&*ds, &running)?;
        if had_running {
            trace!("Snapshotting running to '{}'", snapshot);
            ds.copy(&running, &snapshot)
                .context(error::DataStoreSnafu { op: "snapshot running" })?;
        }

        let result = self.populate_and_validate(&mut *ds, &running, &new_tree);
        let outcome = match result {
            Ok(Validation::Valid) => {
                info!("Committed new running configuration");
                Ok(CommitOutcome::Committed)
            }
            Ok(Validation::Rejected(diagnostics)) => {
                warn!("New running configuration rejected: {}", diagnostics);
                restore(&mut *ds, &running, &snapshot, had_running)
                    .map(|_| CommitOutcome::Rejected(diagnostics))
            }
            Err(e) => {
                warn!("Validate-commit failed, restoring running: {}", e);
                restore(&mut *ds, &running, &snapshot, had_running).and(Err(e))
            }
        };

        if had_running {
            if let Err(e) = ds.remove(&snapshot) {
                warn!("Unable to remove snapshot '{}': {}", snapshot, e);
            }
        }
        outcome
    }

    fn populate_and_validate(
        &self,
        ds: &mut D,
        running: &DatastoreId,
        new_tree: &ConfigTree,
    ) -> Result<Validation> {
        ds.write(running, new_tree)
            .context(error::DataStoreSnafu { op: "populate running" })?;
        let stored = read_tree(ds, running)?;
        self.run_validator(&stored)
    }

    fn run_validator(&self, tree: &ConfigTree) -> Result<Validation> {
        self.validator
            .validate(tree)
            .map_err(|msg| error::Error::Validator { msg })
    }

    /// Commits `candidate` to `running` for a session.  A rejected candidate, or one that can't
    /// be parsed, leaves `running` as it was.  `candidate` itself is never changed.
    pub fn commit(&self, session: SessionId) -> Result<()> {
        let candidate = DatastoreId::candidate();
        match self.validate_commit(Caller::Session(session), CommitSource::Datastore(&candidate)) {
            Ok(CommitOutcome::Committed) => Ok(()),
            Ok(CommitOutcome::Rejected(diagnostics)) => {
                error::ValidationRejectedSnafu { diagnostics }.fail()
            }
            Err(e) if e.is_malformed() => error::ValidationRejectedSnafu {
                diagnostics: e.to_string(),
            }
            .fail(),
            Err(e) => Err(e),
        }
    }

    /// Throws away uncommitted changes by copying `running` over `candidate`.
    pub fn discard_changes(&self, session: SessionId) -> Result<()> {
        self.copy(
            Caller::Session(session),
            &DatastoreId::running(),
            &DatastoreId::candidate(),
        )
    }

    /// Removes scratch snapshots left behind by a previous run.  Returns how many were removed.
    pub fn cleanup_scratch(&self) -> Result<usize> {
        let mut ds = self.write_guard()?;
        let leftovers: Vec<DatastoreId> = ds
            .list()
            .context(error::DataStoreSnafu { op: "list" })?
            .into_iter()
            .filter(DatastoreId::is_scratch)
            .collect();
        for id in &leftovers {
            info!("Removing leftover scratch datastore '{}'", id);
            ds.remove(id).context(error::DataStoreSnafu { op: "cleanup" })?;
        }
        Ok(leftovers.len())
    }

    fn next_scratch(&self) -> DatastoreId {
        DatastoreId::scratch(self.scratch_sequence.fetch_add(1, Ordering::SeqCst))
    }
}

fn exists<D: DataStore>(ds: &D, id: &DatastoreId) -> Result<bool> {
    ds.exists(id).context(error::DataStoreSnafu { op: "exists" })
}

fn read_tree<D: DataStore>(ds: &D, id: &DatastoreId) -> Result<ConfigTree> {
    ds.read(id)
        .context(error::DataStoreSnafu { op: "read" })?
        .context(error::NotFoundSnafu { id: id.name() })
}

fn restore<D: DataStore>(
    ds: &mut D,
    running: &DatastoreId,
    snapshot: &DatastoreId,
    had_running: bool,
) -> Result<()> {
    let restored = if had_running {
        ds.copy(snapshot, running)
    } else {
        ds.remove(running)
    };
    restored.context(error::RestoreSnafu {
        snapshot: snapshot.name(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::validate::StructuralValidator;
    use datastore::{codec, MemoryDataStore};
    use std::sync::Arc;
    use std::thread;

    fn tree(xml: &str) -> ConfigTree {
        codec::parse(xml).unwrap()
    }

    /// Rejects any tree holding a <bad/> element at the top.
    fn reject_bad(tree: &ConfigTree) -> std::result::Result<Validation, String> {
        if tree.root().child("bad").is_some() {
            Ok(Validation::Rejected("bad element present".to_string()))
        } else {
            Ok(Validation::Valid)
        }
    }

    fn engine_with(entries: &[(DatastoreId, &str)]) -> Engine<MemoryDataStore> {
        let mut ds = MemoryDataStore::new();
        for (id, xml) in entries {
            ds.write_raw(id, *xml);
        }
        Engine::new(ds, reject_bad)
    }

    fn live(_: SessionId) -> bool {
        true
    }

    fn running_tree<D: DataStore>(engine: &Engine<D>) -> ConfigTree {
        engine
            .get(&DatastoreId::running(), &Selector::All)
            .unwrap()
    }

    #[test]
    fn create_delete() {
        let engine = engine_with(&[]);
        let id = DatastoreId::new("extra").unwrap();
        engine.create(Caller::Internal, &id).unwrap();
        assert!(engine.exists(&id).unwrap());
        assert!(matches!(
            engine.create(Caller::Internal, &id).unwrap_err(),
            Error::AlreadyExists { .. }
        ));
        engine.delete(Caller::Internal, &id).unwrap();
        assert!(matches!(
            engine.delete(Caller::Internal, &id).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn locks_block_other_sessions() {
        let engine = engine_with(&[(DatastoreId::candidate(), "<config/>")]);
        let candidate = DatastoreId::candidate();
        engine.lock(&candidate, 1, live).unwrap();
        assert!(matches!(
            engine.lock(&candidate, 2, live).unwrap_err(),
            Error::Locked { holder: 1, .. }
        ));
        assert!(matches!(
            engine
                .put(
                    Caller::Session(2),
                    &candidate,
                    DefaultOperation::Merge,
                    None,
                    tree("<config><x>1</x></config>"),
                )
                .unwrap_err(),
            Error::Locked { .. }
        ));
        assert!(engine.reset(Caller::Session(2), &candidate).is_err());
        // The holder and the internal caller are not blocked.
        engine
            .put(
                Caller::Session(1),
                &candidate,
                DefaultOperation::Merge,
                None,
                tree("<config><x>1</x></config>"),
            )
            .unwrap();
        engine.reset(Caller::Internal, &candidate).unwrap();

        assert_eq!(engine.unlock_all(1).unwrap(), vec![candidate.clone()]);
        engine.lock(&candidate, 2, live).unwrap();
    }

    #[test]
    fn closed_session_cannot_lock() {
        let engine = engine_with(&[(DatastoreId::candidate(), "<config/>")]);
        let candidate = DatastoreId::candidate();
        assert!(matches!(
            engine.lock(&candidate, 1, |_| false).unwrap_err(),
            Error::SessionClosed { session: 1 }
        ));
        assert_eq!(engine.locks().holder(&candidate).unwrap(), None);
    }

    #[test]
    fn get_with_selector() {
        let engine = engine_with(&[(
            DatastoreId::running(),
            "<config><a><b>1</b></a><c>2</c></config>",
        )]);
        let path: Path = "/a/b".parse().unwrap();
        assert_eq!(
            engine
                .get(&DatastoreId::running(), &Selector::Path(path))
                .unwrap(),
            tree("<config><a><b>1</b></a></config>")
        );
        assert!(matches!(
            engine
                .get(&DatastoreId::startup(), &Selector::All)
                .unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn failed_edit_changes_nothing() {
        let engine = engine_with(&[(DatastoreId::candidate(), "<config><x>1</x></config>")]);
        let err = engine
            .put(
                Caller::Session(1),
                &DatastoreId::candidate(),
                DefaultOperation::Merge,
                None,
                tree(r#"<config><y>2</y><x operation="create">3</x></config>"#),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Edit { .. }));
        assert_eq!(
            engine
                .get(&DatastoreId::candidate(), &Selector::All)
                .unwrap(),
            tree("<config><x>1</x></config>")
        );
    }

    #[test]
    fn commit_then_reject() {
        let engine = engine_with(&[
            (DatastoreId::running(), "<config/>"),
            (DatastoreId::candidate(), "<config><x>1</x></config>"),
        ]);
        engine.commit(1).unwrap();
        assert_eq!(running_tree(&engine), tree("<config><x>1</x></config>"));

        // Invalid candidate.
        engine
            .put(
                Caller::Session(1),
                &DatastoreId::candidate(),
                DefaultOperation::Merge,
                None,
                tree("<config><bad/></config>"),
            )
            .unwrap();
        assert!(matches!(
            engine.commit(1).unwrap_err(),
            Error::ValidationRejected { .. }
        ));
        assert_eq!(running_tree(&engine), tree("<config><x>1</x></config>"));
        // The candidate keeps its changes.
        assert!(engine
            .get(&DatastoreId::candidate(), &Selector::All)
            .unwrap()
            .root()
            .child("bad")
            .is_some());

        // Malformed candidate.
        engine
            .ds
            .write()
            .unwrap()
            .write_raw(&DatastoreId::candidate(), "<config><x>");
        assert!(matches!(
            engine.commit(1).unwrap_err(),
            Error::ValidationRejected { .. }
        ));
        assert_eq!(running_tree(&engine), tree("<config><x>1</x></config>"));

        // No scratch snapshots are left behind.
        assert_eq!(engine.cleanup_scratch().unwrap(), 0);
    }

    #[test]
    fn commit_blocked_by_running_lock() {
        let engine = engine_with(&[
            (DatastoreId::running(), "<config/>"),
            (DatastoreId::candidate(), "<config><x>1</x></config>"),
        ]);
        engine.lock(&DatastoreId::running(), 2, live).unwrap();
        assert!(matches!(
            engine.commit(1).unwrap_err(),
            Error::Locked { holder: 2, .. }
        ));
        engine.commit(2).unwrap();
    }

    #[test]
    fn running_is_its_own_source() {
        let engine = engine_with(&[(DatastoreId::running(), "<config><x>1</x></config>")]);
        let running = DatastoreId::running();
        for _ in 0..2 {
            assert_eq!(
                engine
                    .validate_commit(Caller::Internal, CommitSource::Datastore(&running))
                    .unwrap(),
                CommitOutcome::Committed
            );
            assert_eq!(running_tree(&engine), tree("<config><x>1</x></config>"));
        }
    }

    #[test]
    fn merge_source() {
        let engine = engine_with(&[(DatastoreId::running(), "<config><x>1</x></config>")]);
        let extra = tree("<config><y>2</y></config>");
        assert_eq!(
            engine
                .validate_commit(Caller::Internal, CommitSource::Merge(&extra))
                .unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(running_tree(&engine), tree("<config><x>1</x><y>2</y></config>"));

        let bad = tree("<config><bad/></config>");
        assert!(matches!(
            engine
                .validate_commit(Caller::Internal, CommitSource::Merge(&bad))
                .unwrap(),
            CommitOutcome::Rejected(_)
        ));
        assert_eq!(running_tree(&engine), tree("<config><x>1</x><y>2</y></config>"));
    }

    #[test]
    fn validator_failure_restores_running() {
        let mut ds = MemoryDataStore::new();
        ds.write_raw(&DatastoreId::running(), "<config><x>1</x></config>");
        ds.write_raw(&DatastoreId::candidate(), "<config><x>2</x></config>");
        let engine = Engine::new(ds, |_: &ConfigTree| -> std::result::Result<Validation, String> {
            Err("validator crashed".to_string())
        });
        assert!(matches!(
            engine.commit(1).unwrap_err(),
            Error::Validator { .. }
        ));
        assert_eq!(running_tree(&engine), tree("<config><x>1</x></config>"));
    }

    #[test]
    fn copy_is_independent() {
        let engine = engine_with(&[(DatastoreId::running(), "<config><x>1</x></config>")]);
        let running = DatastoreId::running();
        let backup = DatastoreId::new("backup").unwrap();
        engine.copy(Caller::Internal, &running, &backup).unwrap();
        engine
            .put(
                Caller::Internal,
                &running,
                DefaultOperation::Merge,
                None,
                tree("<config><x>2</x></config>"),
            )
            .unwrap();
        assert_eq!(
            engine.get(&backup, &Selector::All).unwrap(),
            tree("<config><x>1</x></config>")
        );
        assert!(matches!(
            engine
                .copy(Caller::Internal, &DatastoreId::startup(), &backup)
                .unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn discard_changes_restores_candidate() {
        let engine = engine_with(&[
            (DatastoreId::running(), "<config><x>1</x></config>"),
            (DatastoreId::candidate(), "<config><x>9</x></config>"),
        ]);
        engine.discard_changes(1).unwrap();
        assert_eq!(
            engine
                .get(&DatastoreId::candidate(), &Selector::All)
                .unwrap(),
            tree("<config><x>1</x></config>")
        );
    }

    #[test]
    fn cleanup_removes_only_scratch() {
        let engine = engine_with(&[
            (DatastoreId::running(), "<config/>"),
            (DatastoreId::scratch(4), "<config/>"),
            (DatastoreId::tmp(), "<config/>"),
        ]);
        assert_eq!(engine.cleanup_scratch().unwrap(), 1);
        assert!(!engine.exists(&DatastoreId::scratch(4)).unwrap());
        assert!(engine.exists(&DatastoreId::tmp()).unwrap());
    }

    #[test]
    fn structural_validator_rejects_duplicates() {
        let mut ds = MemoryDataStore::new();
        ds.write_raw(&DatastoreId::running(), "<config/>");
        ds.write_raw(
            &DatastoreId::candidate(),
            "<config><a><name>x</name></a><a><name>x</name></a></config>",
        );
        let engine = Engine::new(ds, StructuralValidator);
        assert!(engine.commit(1).is_err());
        assert_eq!(running_tree(&engine), ConfigTree::empty());
    }

    #[test]
    fn readers_never_see_intermediate_state() {
        let before = tree("<config><x>1</x></config>");
        let engine = Arc::new(engine_with(&[
            (DatastoreId::running(), "<config><x>1</x></config>"),
            (DatastoreId::candidate(), "<config><x>2</x><bad/></config>"),
        ]));

        let reader = {
            let engine = Arc::clone(&engine);
            let before = before.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert_eq!(running_tree(&*engine), before);
                }
            })
        };
        for _ in 0..50 {
            assert!(engine.commit(1).is_err());
        }
        reader.join().unwrap();
        assert_eq!(running_tree(&*engine), before);
    }
}
