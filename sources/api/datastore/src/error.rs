use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// Possible errors from datastore operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Datastore '{}' does not exist", id))]
    NotFound { id: String },

    #[snafu(display("Datastore '{}' holds a malformed tree: {}", id, source))]
    MalformedTree {
        id: String,
        #[snafu(source(from(crate::codec::Error, Box::new)))]
        source: Box<crate::codec::Error>,
    },

    #[snafu(display("Reading datastore '{}' failed: {}", id, source))]
    DatastoreRead { id: String, source: io::Error },

    #[snafu(display("Removing datastore at '{}' failed: {}", path.display(), source))]
    DeleteDatastore { path: PathBuf, source: io::Error },

    #[snafu(display("IO error on '{}': {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to create temporary file in '{}': {}", path.display(), source))]
    CreateTempfile { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to publish datastore '{}' at '{}': {}", id, path.display(), source))]
    Persist {
        id: String,
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("Data store integrity violation at {}: {}", path.display(), msg))]
    Corruption { msg: String, path: PathBuf },

    #[snafu(display("Error listing datastores: {}", source))]
    ListDatastores { source: walkdir::Error },

    #[snafu(display("Datastore name '{}' has invalid format: {}", name, msg))]
    InvalidId { name: String, msg: String },

    #[snafu(display("Datastore name beyond maximum length {}: {}", max, name))]
    IdTooLong { name: String, max: usize },
}

impl Error {
    /// Whether the error came from content that could not be parsed as a tree, as opposed to a
    /// failure of the storage itself.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::MalformedTree { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
