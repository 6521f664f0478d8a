use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ensure;
use std::fmt;
use std::str::FromStr;

use super::{error, Error, Result};

pub const RUNNING: &str = "running";
pub const CANDIDATE: &str = "candidate";
pub const STARTUP: &str = "startup";
pub const TMP: &str = "tmp";
pub const FAILSAFE: &str = "failsafe";

/// Separates the base name of a scratch datastore from its sequence number, e.g. tmp-3.
pub const SCRATCH_SEPARATOR: char = '-';

/// Datastores are stored as files named after the (encoded) identifier plus a suffix, so we stay
/// under the usual maximum filename length of 255 even after the suffix is added.
const MAX_ID_LENGTH: usize = 250;

/// A DatastoreId names one slot holding a configuration tree.  Names carry no structure; callers
/// decide which names mean "the" running configuration and so on.
///
/// Any non-empty name without control characters is accepted.  Backends that need
/// filesystem-safe names encode them themselves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatastoreId {
    name: String,
}

impl DatastoreId {
    /// Creates a DatastoreId from the given name, checking that it's acceptable.
    pub fn new<S: AsRef<str>>(name: S) -> Result<Self> {
        let name = name.as_ref();
        Self::check_name(name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn running() -> Self {
        Self::well_known(RUNNING)
    }

    pub fn candidate() -> Self {
        Self::well_known(CANDIDATE)
    }

    pub fn startup() -> Self {
        Self::well_known(STARTUP)
    }

    pub fn tmp() -> Self {
        Self::well_known(TMP)
    }

    pub fn failsafe() -> Self {
        Self::well_known(FAILSAFE)
    }

    /// Builds the name of a scratch snapshot, e.g. "tmp-3" for sequence number 3.
    pub fn scratch(sequence: u64) -> Self {
        Self {
            name: format!("{}{}{}", TMP, SCRATCH_SEPARATOR, sequence),
        }
    }

    /// Whether this name looks like one produced by `scratch`.
    pub fn is_scratch(&self) -> bool {
        match self.name.split_once(SCRATCH_SEPARATOR) {
            Some((base, seq)) => {
                base == TMP && !seq.is_empty() && seq.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }

    /// Returns the name of the datastore.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn well_known(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn check_name(name: &str) -> Result<()> {
        ensure!(
            !name.is_empty(),
            error::InvalidIdSnafu {
                name,
                msg: "cannot be empty",
            }
        );
        ensure!(
            name.len() <= MAX_ID_LENGTH,
            error::IdTooLongSnafu {
                name,
                max: MAX_ID_LENGTH,
            }
        );
        if let Some(c) = name.chars().find(|c| c.is_control()) {
            return error::InvalidIdSnafu {
                name,
                msg: format!("invalid character in name: {:?}", c),
            }
            .fail();
        }
        Ok(())
    }
}

impl fmt::Display for DatastoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl FromStr for DatastoreId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for DatastoreId {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl Serialize for DatastoreId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for DatastoreId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Self::new(name).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::{DatastoreId, MAX_ID_LENGTH};

    #[test]
    fn short_name_ok() {
        assert!(DatastoreId::new("a").is_ok());
    }

    #[test]
    fn well_known_names() {
        assert_eq!(DatastoreId::running().name(), "running");
        assert_eq!(DatastoreId::candidate().name(), "candidate");
        assert_eq!(DatastoreId::startup().name(), "startup");
        assert_eq!(DatastoreId::tmp().name(), "tmp");
        assert_eq!(DatastoreId::failsafe().name(), "failsafe");
        assert_eq!(DatastoreId::new("running").unwrap(), DatastoreId::running());
    }

    #[test]
    fn name_with_special_chars_ok() {
        assert!(DatastoreId::new("a b/c.d%e").is_ok());
    }

    #[test]
    fn long_name_ok() {
        assert!(DatastoreId::new("a".repeat(MAX_ID_LENGTH)).is_ok());
    }

    #[test]
    fn name_too_long() {
        assert!(DatastoreId::new("a".repeat(MAX_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn name_bad() {
        assert!(DatastoreId::new("").is_err());
        assert!(DatastoreId::new("a\nb").is_err());
        assert!(DatastoreId::new("\u{7f}").is_err());
    }

    #[test]
    fn scratch_names() {
        let id = DatastoreId::scratch(7);
        assert_eq!(id.name(), "tmp-7");
        assert!(id.is_scratch());
        assert!(!DatastoreId::tmp().is_scratch());
        assert!(!DatastoreId::new("tmp-").unwrap().is_scratch());
        assert!(!DatastoreId::new("tmp-x1").unwrap().is_scratch());
        assert!(!DatastoreId::new("candidate-1").unwrap().is_scratch());
    }

    #[test]
    fn deserialize_checks_name() {
        let id: DatastoreId = serde_json::from_str("\"startup\"").unwrap();
        assert_eq!(id, DatastoreId::startup());
        serde_json::from_str::<DatastoreId>("\"\"").unwrap_err();
    }
}
