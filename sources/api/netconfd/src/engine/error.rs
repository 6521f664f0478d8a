use snafu::Snafu;

use super::SessionId;

/// Possible errors from engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Data store error during {}: {}", op, source))]
    DataStore {
        op: String,
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display("Datastore '{}' does not exist", id))]
    NotFound { id: String },

    #[snafu(display("Datastore '{}' already exists", id))]
    AlreadyExists { id: String },

    #[snafu(display("Datastore '{}' is locked by session {}", id, holder))]
    Locked { id: String, holder: SessionId },

    #[snafu(display("Session {} is closed", session))]
    SessionClosed { session: SessionId },

    #[snafu(display("Session {} does not hold the lock on datastore '{}'", session, id))]
    NotOwner {
        id: String,
        session: SessionId,
        holder: Option<SessionId>,
    },

    #[snafu(display("Unable to edit datastore '{}': {}", id, source))]
    Edit {
        id: String,
        source: datastore::edit::Error,
    },

    #[snafu(display("Validation failed: {}", diagnostics))]
    ValidationRejected { diagnostics: String },

    #[snafu(display("Validator failed: {}", msg))]
    Validator { msg: String },

    #[snafu(display("Unable to restore running from snapshot '{}': {}", snapshot, source))]
    Restore {
        snapshot: String,
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display("Another thread poisoned the data store lock by panicking"))]
    DataStoreLock,

    #[snafu(display("Another thread poisoned the lock table by panicking"))]
    LockTablePoisoned,
}

impl Error {
    /// Whether the error came from a stored tree that could not be parsed.
    pub fn is_malformed(&self) -> bool {
        match self {
            Error::DataStore { source, .. } => source.is_malformed(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
