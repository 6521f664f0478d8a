//! This implementation of the DataStore trait relies on the filesystem for storage.
//!
//! Each datastore is one XML file in the base directory, named after the datastore with a suffix,
//! e.g. base/running_db for "running".  Writes go to a temporary file in the same directory that
//! is then renamed over the target, so readers never see a partially written tree.

use log::{debug, trace};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::{OptionExt, ResultExt};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::{codec, error, ConfigTree, DataStore, DatastoreId, Result};

/// Suffix of the file holding each datastore.
const DATASTORE_FILE_SUFFIX: &str = "_db";

// This describes the set of characters we encode when making the filesystem path for a given
// datastore name.  Any non-ASCII characters, plus these ones, will be encoded.
// We start off very strict (anything not alphanumeric) and remove characters we'll allow.
const ENCODE_CHARACTERS: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');

#[derive(Debug)]
pub struct FilesystemDataStore {
    base_path: PathBuf,
}

impl FilesystemDataStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> FilesystemDataStore {
        FilesystemDataStore {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Returns the path on the filesystem for the given datastore.
    fn datastore_path(&self, id: &DatastoreId) -> PathBuf {
        let mut file_name = encode_path_component(id.name());
        file_name.push_str(DATASTORE_FILE_SUFFIX);
        self.base_path.join(file_name)
    }
}

// Filesystem helpers

/// Encodes a string so that it's safe to use as a filesystem path component.
fn encode_path_component<S: AsRef<str>>(segment: S) -> String {
    let encoded = utf8_percent_encode(segment.as_ref(), ENCODE_CHARACTERS);
    encoded.to_string()
}

/// Decodes a path component, removing the encoding that's applied to make it filesystem-safe.
fn decode_path_component<S, P>(segment: S, path: P) -> Result<String>
where
    S: AsRef<str>,
    P: AsRef<Path>,
{
    let segment = segment.as_ref();

    percent_decode_str(segment)
        .decode_utf8()
        // Get back a plain String.
        .map(|cow| cow.into_owned())
        // decode_utf8 will only fail if someone messed with the filesystem contents directly
        // and created a filename that contains percent-encoded bytes that are invalid UTF-8.
        .ok()
        .context(error::CorruptionSnafu {
            path: path.as_ref(),
            msg: format!("invalid UTF-8 in encoded segment '{}'", segment),
        })
}

/// Helper for reading a datastore file.  Returns Ok(None) if the file doesn't exist rather than
/// erroring.
fn read_file_for_datastore(id: &DatastoreId, path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound {
                return Ok(None);
            }

            Err(e).context(error::DatastoreReadSnafu { id: id.name() })
        }
    }
}

impl DataStore for FilesystemDataStore {
    fn exists(&self, id: &DatastoreId) -> Result<bool> {
        let path = self.datastore_path(id);
        match fs::metadata(&path) {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(error::IoSnafu { path }),
        }
    }

    fn read(&self, id: &DatastoreId) -> Result<Option<ConfigTree>> {
        let path = self.datastore_path(id);
        trace!("Reading datastore '{}' from {}", id, path.display());
        let xml = match read_file_for_datastore(id, &path)? {
            Some(xml) => xml,
            None => return Ok(None),
        };
        let tree = codec::parse(&xml).context(error::MalformedTreeSnafu { id: id.name() })?;
        Ok(Some(tree))
    }

    fn write(&mut self, id: &DatastoreId, tree: &ConfigTree) -> Result<()> {
        let path = self.datastore_path(id);
        debug!("Writing datastore '{}' to {}", id, path.display());
        let xml = codec::to_string(tree).context(error::MalformedTreeSnafu { id: id.name() })?;

        fs::create_dir_all(&self.base_path).context(error::IoSnafu {
            path: &self.base_path,
        })?;
        let mut tmpfile = NamedTempFile::new_in(&self.base_path).context(
            error::CreateTempfileSnafu {
                path: &self.base_path,
            },
        )?;
        tmpfile
            .write_all(xml.as_bytes())
            .context(error::IoSnafu {
                path: tmpfile.path(),
            })?;
        tmpfile.as_file().sync_all().context(error::IoSnafu {
            path: tmpfile.path(),
        })?;
        tmpfile.persist(&path).context(error::PersistSnafu {
            id: id.name(),
            path: &path,
        })?;
        Ok(())
    }

    fn remove(&mut self, id: &DatastoreId) -> Result<()> {
        let path = self.datastore_path(id);
        debug!("Removing datastore '{}' at {}", id, path.display());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(error::DeleteDatastoreSnafu { path }),
        }
    }

    /// We store datastores as suffixed files in the base directory, so to list them we list the
    /// names of those files.
    fn list(&self) -> Result<HashSet<DatastoreId>> {
        let walker = WalkDir::new(&self.base_path).min_depth(1).max_depth(1);

        let mut datastores = HashSet::new();
        trace!(
            "Starting walk of filesystem to list datastores under {}",
            self.base_path.display(),
        );

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(io_error) = e.io_error() {
                        // If there's no base directory, that's OK, just return empty set.
                        if io_error.kind() == io::ErrorKind::NotFound {
                            break;
                        }
                    }
                    return Err(e).context(error::ListDatastoresSnafu);
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            // The file name should be valid UTF-8, encoded by encode_path_component, or the
            // datastore directory has been corrupted.
            let file_name = entry.file_name().to_str().context(error::CorruptionSnafu {
                msg: "Non-UTF8 path",
                path: entry.path(),
            })?;
            // Temporary files from in-progress writes, and anything else, aren't datastores.
            let encoded = match file_name.strip_suffix(DATASTORE_FILE_SUFFIX) {
                Some(encoded) if !encoded.is_empty() => encoded,
                _ => continue,
            };
            let name = decode_path_component(encoded, entry.path())?;
            let id = DatastoreId::new(&name).map_err(|e| error::Error::Corruption {
                msg: e.to_string(),
                path: entry.path().to_path_buf(),
            })?;
            datastores.insert(id);
        }

        Ok(datastores)
    }
}
