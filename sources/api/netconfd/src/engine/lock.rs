//! Advisory locks held by sessions on datastores.

use datastore::DatastoreId;
use log::debug;
use snafu::{ensure, OptionExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::error::{self, Result};
use super::{Caller, SessionId};

/// Maps each locked datastore to the session holding it.  A datastore has at most one holder; a
/// session may hold any number of locks.  Nothing here is persisted, so locks never outlive the
/// process.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<DatastoreId, SessionId>>,
}

impl LockTable {
    pub fn new() -> Self {
        Default::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<DatastoreId, SessionId>>> {
        self.locks.lock().ok().context(error::LockTablePoisonedSnafu)
    }

    /// Locks `id` for `session`.  Locking a datastore you already hold succeeds.
    pub fn lock(&self, id: &DatastoreId, session: SessionId) -> Result<()> {
        let mut table = self.table()?;
        if let Some(&holder) = table.get(id) {
            ensure!(
                holder == session,
                error::LockedSnafu {
                    id: id.name(),
                    holder,
                }
            );
            return Ok(());
        }
        debug!("Session {} locked '{}'", session, id);
        table.insert(id.clone(), session);
        Ok(())
    }

    /// Releases the lock `session` holds on `id`.
    pub fn unlock(&self, id: &DatastoreId, session: SessionId) -> Result<()> {
        let mut table = self.table()?;
        let holder = table.get(id).copied();
        ensure!(
            holder == Some(session),
            error::NotOwnerSnafu {
                id: id.name(),
                session,
                holder,
            }
        );
        debug!("Session {} unlocked '{}'", session, id);
        table.remove(id);
        Ok(())
    }

    /// Releases every lock held by `session`, returning the datastores that were unlocked.
    pub fn unlock_all(&self, session: SessionId) -> Result<Vec<DatastoreId>> {
        let mut table = self.table()?;
        let mut released: Vec<DatastoreId> = table
            .iter()
            .filter(|(_, holder)| **holder == session)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &released {
            table.remove(id);
        }
        released.sort();
        if !released.is_empty() {
            debug!("Released locks of session {}: {:?}", session, released);
        }
        Ok(released)
    }

    /// Returns the session holding the lock on `id`, if any.
    pub fn holder(&self, id: &DatastoreId) -> Result<Option<SessionId>> {
        Ok(self.table()?.get(id).copied())
    }

    /// Fails if `id` is locked by a session other than the caller.  The internal caller is never
    /// blocked.
    pub fn check(&self, id: &DatastoreId, caller: Caller) -> Result<()> {
        let session = match caller {
            Caller::Internal => return Ok(()),
            Caller::Session(session) => session,
        };
        if let Some(holder) = self.holder(id)? {
            ensure!(
                holder == session,
                error::LockedSnafu {
                    id: id.name(),
                    holder,
                }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Error;

    #[test]
    fn exclusive() {
        let table = LockTable::new();
        let running = DatastoreId::running();
        table.lock(&running, 1).unwrap();
        // Re-locking by the holder is fine.
        table.lock(&running, 1).unwrap();
        match table.lock(&running, 2).unwrap_err() {
            Error::Locked { holder, .. } => assert_eq!(holder, 1),
            e => panic!("unexpected error: {}", e),
        }
        assert_eq!(table.holder(&running).unwrap(), Some(1));
    }

    #[test]
    fn unlock_requires_owner() {
        let table = LockTable::new();
        let candidate = DatastoreId::candidate();
        assert!(matches!(
            table.unlock(&candidate, 1).unwrap_err(),
            Error::NotOwner { holder: None, .. }
        ));
        table.lock(&candidate, 1).unwrap();
        assert!(matches!(
            table.unlock(&candidate, 2).unwrap_err(),
            Error::NotOwner {
                holder: Some(1),
                ..
            }
        ));
        table.unlock(&candidate, 1).unwrap();
        assert_eq!(table.holder(&candidate).unwrap(), None);
    }

    #[test]
    fn unlock_all_releases_session() {
        let table = LockTable::new();
        table.lock(&DatastoreId::running(), 1).unwrap();
        table.lock(&DatastoreId::candidate(), 1).unwrap();
        table.lock(&DatastoreId::startup(), 2).unwrap();

        assert_eq!(
            table.unlock_all(1).unwrap(),
            vec![DatastoreId::candidate(), DatastoreId::running()]
        );
        table.lock(&DatastoreId::running(), 2).unwrap();
        assert_eq!(table.holder(&DatastoreId::startup()).unwrap(), Some(2));
        assert!(table.unlock_all(1).unwrap().is_empty());
    }

    #[test]
    fn check_callers() {
        let table = LockTable::new();
        let running = DatastoreId::running();
        table.check(&running, Caller::Session(2)).unwrap();
        table.lock(&running, 1).unwrap();
        table.check(&running, Caller::Session(1)).unwrap();
        table.check(&running, Caller::Internal).unwrap();
        assert!(table.check(&running, Caller::Session(2)).is_err());
    }
}
