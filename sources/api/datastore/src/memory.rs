//! In-memory datastore for use in testing other modules.
//!
//! Mimics some of the decisions made for FilesystemDataStore, e.g. trees being held in their XML
//! form, so malformed content can be stored and is only detected on read.

use snafu::ResultExt;
use std::collections::{HashMap, HashSet};

use super::{codec, error, ConfigTree, DataStore, DatastoreId, Result};

#[derive(Debug, Default)]
pub struct MemoryDataStore {
    // Datastore name -> serialized tree.
    datastores: HashMap<DatastoreId, String>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores raw text as the content of a datastore without checking it, the way a file might
    /// be edited by hand.
    pub fn write_raw<S: Into<String>>(&mut self, id: &DatastoreId, content: S) {
        self.datastores.insert(id.clone(), content.into());
    }
}

impl DataStore for MemoryDataStore {
    fn exists(&self, id: &DatastoreId) -> Result<bool> {
        Ok(self.datastores.contains_key(id))
    }

    fn read(&self, id: &DatastoreId) -> Result<Option<ConfigTree>> {
        match self.datastores.get(id) {
            Some(xml) => {
                let tree =
                    codec::parse(xml).context(error::MalformedTreeSnafu { id: id.name() })?;
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    fn write(&mut self, id: &DatastoreId, tree: &ConfigTree) -> Result<()> {
        let xml = codec::to_string(tree).context(error::MalformedTreeSnafu { id: id.name() })?;
        self.datastores.insert(id.clone(), xml);
        Ok(())
    }

    fn remove(&mut self, id: &DatastoreId) -> Result<()> {
        self.datastores.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<HashSet<DatastoreId>> {
        Ok(self.datastores.keys().cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use super::{DataStore, DatastoreId, MemoryDataStore};
    use crate::tree::{ConfigTree, Node};
    use maplit::hashset;

    #[test]
    fn write_read_remove() {
        let mut m = MemoryDataStore::new();
        let id = DatastoreId::candidate();
        let tree = ConfigTree::from_children(vec![Node::leaf("a", "1")]);

        assert!(!m.exists(&id).unwrap());
        m.write(&id, &tree).unwrap();
        assert!(m.exists(&id).unwrap());
        assert_eq!(m.read(&id).unwrap(), Some(tree));
        assert_eq!(m.list().unwrap(), hashset! { DatastoreId::candidate() });

        m.remove(&id).unwrap();
        assert_eq!(m.read(&id).unwrap(), None);
        m.remove(&id).unwrap();
    }

    #[test]
    fn raw_content_checked_on_read() {
        let mut m = MemoryDataStore::new();
        let id = DatastoreId::startup();
        m.write_raw(&id, "<config><a></config>");
        assert!(m.exists(&id).unwrap());
        assert!(m.read(&id).unwrap_err().is_malformed());
    }
}
