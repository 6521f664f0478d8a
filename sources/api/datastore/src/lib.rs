/*!
# Background

A 'datastore' in netconfd is a named slot holding one complete configuration tree.  The daemon
keeps a handful of them (running, candidate, startup, failsafe, and scratch snapshots) and moves
trees between them with copy, reset and validate-commit operations.

For more detail about their usage, see [netconfd](../netconfd).

# Library

This library provides a trait defining the exact requirements of a datastore backend, along with
implementations for the filesystem and for memory.

It also holds the pieces that work on trees themselves:

* `tree`, the configuration tree model.
* `codec`, which reads and writes trees as XML.
* `select`, which extracts parts of a tree by path or by subtree filter.
* `edit`, which applies edit fragments with merge, replace, create, delete and remove semantics.

# Current limitations

* The user (e.g. netconfd) needs to handle locking.
* Trees are untyped; there's no schema, so list entries are recognized by their first leaf.
*/

pub mod codec;
pub mod edit;
pub mod error;
pub mod filesystem;
pub mod id;
pub mod memory;
pub mod select;
pub mod tree;

pub use error::{Error, Result};
pub use filesystem::FilesystemDataStore;
pub use id::DatastoreId;
pub use memory::MemoryDataStore;
pub use tree::{ConfigTree, Node};

use log::trace;
use snafu::OptionExt;
use std::collections::HashSet;

pub trait DataStore {
    /// Returns whether the datastore exists.
    fn exists(&self, id: &DatastoreId) -> Result<bool>;

    /// Retrieves the tree held by the datastore, or None if it doesn't exist.  Stored content that
    /// can't be parsed as a tree is an error.
    fn read(&self, id: &DatastoreId) -> Result<Option<ConfigTree>>;

    /// Replaces the whole content of the datastore, creating it if needed.  Readers see either
    /// the old tree or the new one, never a mix.
    fn write(&mut self, id: &DatastoreId, tree: &ConfigTree) -> Result<()>;

    /// Removes the datastore.  If we succeeded, we return Ok(()); if the datastore didn't exist,
    /// we also return Ok(()); we return Err only if we failed to check or remove it.
    fn remove(&mut self, id: &DatastoreId) -> Result<()>;

    /// Returns the identifiers of all existing datastores.
    fn list(&self) -> Result<HashSet<DatastoreId>>;

    /// Copies the tree held by `from` into `to`, replacing whatever `to` held.
    ///
    /// Implementers can replace the default implementation if there's a faster way than reading
    /// and writing the whole tree.
    fn copy(&mut self, from: &DatastoreId, to: &DatastoreId) -> Result<()> {
        trace!("Copying datastore '{}' to '{}'", from, to);
        let tree = self
            .read(from)?
            .context(error::NotFoundSnafu { id: from.name() })?;
        self.write(to, &tree)
    }

    /// Collapses the datastore to the empty tree, creating it if needed.
    fn reset(&mut self, id: &DatastoreId) -> Result<()> {
        trace!("Resetting datastore '{}'", id);
        self.write(id, &ConfigTree::empty())
    }
}

#[cfg(test)]
mod test {
    use super::memory::MemoryDataStore;
    use super::{ConfigTree, DataStore, DatastoreId, Error, Node};

    #[test]
    fn copy_duplicates() {
        let mut m = MemoryDataStore::new();
        let running = DatastoreId::running();
        let candidate = DatastoreId::candidate();
        let tree = ConfigTree::from_children(vec![Node::leaf("hostname", "a")]);
        m.write(&running, &tree).unwrap();

        m.copy(&running, &candidate).unwrap();
        assert_eq!(m.read(&candidate).unwrap(), Some(tree.clone()));

        // Changing the copy leaves the source alone.
        m.reset(&candidate).unwrap();
        assert_eq!(m.read(&running).unwrap(), Some(tree));
        assert_eq!(m.read(&candidate).unwrap(), Some(ConfigTree::empty()));
    }

    #[test]
    fn copy_missing_source() {
        let mut m = MemoryDataStore::new();
        let err = m
            .copy(&DatastoreId::startup(), &DatastoreId::running())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(!m.exists(&DatastoreId::running()).unwrap());
    }

    #[test]
    fn reset_creates() {
        let mut m = MemoryDataStore::new();
        let id = DatastoreId::new("scratch").unwrap();
        m.reset(&id).unwrap();
        assert!(m.exists(&id).unwrap());
        assert!(m.read(&id).unwrap().unwrap().is_empty());
    }
}
