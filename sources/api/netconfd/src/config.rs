//! Daemon configuration, read from a TOML file.  Every setting is optional; command-line flags
//! override the file, and built-in defaults fill whatever is left.

use log::LevelFilter;
use serde::Deserialize;
use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::startup::StartupMode;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netconfd/netconfd.toml";
pub const DEFAULT_DATASTORE_PATH: &str = "/var/lib/netconfd/datastore";
pub const DEFAULT_SOCKET_PATH: &str = "/run/netconfd.sock";
const DEFAULT_THREADS: usize = 2;

/// Settings as given by a file or the command line; unset fields fall through to the next source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub datastore_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub socket_gid: Option<u32>,
    pub startup_mode: Option<StartupMode>,
    pub extra_config: Option<PathBuf>,
    pub status_path: Option<PathBuf>,
    pub threads: Option<usize>,
    pub log_level: Option<String>,
    /// If set, only these users may open sessions.
    pub allowed_users: Option<Vec<String>>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub datastore_path: PathBuf,
    pub socket_path: PathBuf,
    pub socket_gid: Option<u32>,
    pub startup_mode: StartupMode,
    pub extra_config: Option<PathBuf>,
    pub status_path: Option<PathBuf>,
    pub threads: usize,
    pub log_level: LevelFilter,
    pub allowed_users: Option<Vec<String>>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).context(error::ReadSnafu { path })?;
        Self::from_toml(&contents).context(error::ParseSnafu { path })
    }

    fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Returns a config where values set in `overrides` replace ours.
    pub fn merge(self, overrides: Config) -> Config {
        Config {
            datastore_path: overrides.datastore_path.or(self.datastore_path),
            socket_path: overrides.socket_path.or(self.socket_path),
            socket_gid: overrides.socket_gid.or(self.socket_gid),
            startup_mode: overrides.startup_mode.or(self.startup_mode),
            extra_config: overrides.extra_config.or(self.extra_config),
            status_path: overrides.status_path.or(self.status_path),
            threads: overrides.threads.or(self.threads),
            log_level: overrides.log_level.or(self.log_level),
            allowed_users: overrides.allowed_users.or(self.allowed_users),
        }
    }

    /// Fills in defaults and checks values.
    pub fn resolve(self) -> Result<Settings> {
        let log_level = match self.log_level {
            Some(level) => {
                LevelFilter::from_str(&level).map_err(|_| error::Error::LogLevel { given: level })?
            }
            None => LevelFilter::Info,
        };
        let threads = self.threads.unwrap_or(DEFAULT_THREADS);
        snafu::ensure!(threads > 0, error::ThreadsSnafu);

        Ok(Settings {
            datastore_path: self
                .datastore_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASTORE_PATH)),
            socket_path: self
                .socket_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            socket_gid: self.socket_gid,
            startup_mode: self.startup_mode.unwrap_or_default(),
            extra_config: self.extra_config,
            status_path: self.status_path,
            threads,
            log_level,
            allowed_users: self.allowed_users,
        })
    }
}

mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to read config file '{}': {}", path.display(), source))]
        Read { path: PathBuf, source: io::Error },

        #[snafu(display("Invalid config file '{}': {}", path.display(), source))]
        Parse {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("Invalid log level '{}'", given))]
        LogLevel { given: String },

        #[snafu(display("Number of threads must be at least 1"))]
        Threads,
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Config::from_toml("").unwrap().resolve().unwrap();
        assert_eq!(settings.datastore_path, PathBuf::from(DEFAULT_DATASTORE_PATH));
        assert_eq!(settings.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(settings.startup_mode, StartupMode::Running);
        assert_eq!(settings.threads, DEFAULT_THREADS);
        assert_eq!(settings.log_level, LevelFilter::Info);
        assert_eq!(settings.socket_gid, None);
        assert_eq!(settings.allowed_users, None);
    }

    #[test]
    fn full_file() {
        let config = Config::from_toml(
            r#"
            datastore-path = "/data"
            socket-path = "/run/x.sock"
            socket-gid = 274
            startup-mode = "startup"
            extra-config = "/etc/extra.xml"
            status-path = "/run/status.json"
            threads = 4
            log-level = "debug"
            allowed-users = ["admin"]
            "#,
        )
        .unwrap();
        let settings = config.resolve().unwrap();
        assert_eq!(settings.datastore_path, PathBuf::from("/data"));
        assert_eq!(settings.socket_gid, Some(274));
        assert_eq!(settings.startup_mode, StartupMode::Startup);
        assert_eq!(settings.extra_config, Some(PathBuf::from("/etc/extra.xml")));
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.log_level, LevelFilter::Debug);
        assert_eq!(settings.allowed_users, Some(vec!["admin".to_string()]));
    }

    #[test]
    fn bad_values() {
        assert!(Config::from_toml("startup-mode = \"sometimes\"").is_err());
        assert!(Config::from_toml("unknown-key = 1").is_err());
        let config = Config {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve().unwrap_err(),
            Error::LogLevel { .. }
        ));
        let config = Config {
            threads: Some(0),
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn overrides_win() {
        let file = Config {
            datastore_path: Some(PathBuf::from("/file")),
            startup_mode: Some(StartupMode::Init),
            threads: Some(3),
            ..Default::default()
        };
        let flags = Config {
            datastore_path: Some(PathBuf::from("/flag")),
            ..Default::default()
        };
        let settings = file.merge(flags).resolve().unwrap();
        assert_eq!(settings.datastore_path, PathBuf::from("/flag"));
        assert_eq!(settings.startup_mode, StartupMode::Init);
        assert_eq!(settings.threads, 3);
    }

    #[test]
    fn read_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netconfd.toml");
        fs::write(&path, "startup-mode = \"none\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.startup_mode, Some(StartupMode::None));

        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")).unwrap_err(),
            Error::Read { .. }
        ));
    }
}
