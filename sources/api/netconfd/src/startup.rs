//! The startup controller decides what `running` holds before the server accepts any request.
//!
//! Depending on the startup mode, `running` is kept, emptied, revalidated, or replaced by the
//! `startup` datastore, always through validate-commit.  Extra configuration from a file may then
//! be merged in.  If any of that is rejected, the `failsafe` datastore is committed instead, and
//! if even that isn't possible, startup fails and the daemon doesn't serve.

use datastore::select::Selector;
use datastore::{codec, DataStore, DatastoreId};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

use crate::engine::{self, Caller, CommitOutcome, CommitSource, Engine};

/// How `running` is established at startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupMode {
    /// Keep `running` as it is.
    None,
    /// Start from an empty `running`.
    Init,
    /// Revalidate and recommit the existing `running`.
    #[default]
    Running,
    /// Commit the `startup` datastore.
    Startup,
}

impl FromStr for StartupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(StartupMode::None),
            "init" => Ok(StartupMode::Init),
            "running" => Ok(StartupMode::Running),
            "startup" => Ok(StartupMode::Startup),
            _ => error::UnknownModeSnafu { given: s }.fail(),
        }
    }
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartupMode::None => "none",
            StartupMode::Init => "init",
            StartupMode::Running => "running",
            StartupMode::Startup => "startup",
        };
        write!(f, "{}", name)
    }
}

/// Overall result of startup.  Anything other than Ok means the failsafe configuration was
/// loaded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupStatus {
    Ok,
    /// A configuration was well-formed but rejected by validation.
    Invalid,
    /// A configuration could not be parsed.
    Error,
}

/// What happened during startup; recorded once and read-only afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StartupReport {
    pub mode: StartupMode,
    pub status: StartupStatus,
    pub failsafe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl StartupReport {
    fn new(mode: StartupMode) -> Self {
        Self {
            mode,
            status: StartupStatus::Ok,
            failsafe: false,
            diagnostics: None,
        }
    }

    fn fail(&mut self, status: StartupStatus, diagnostics: String) {
        self.status = status;
        self.diagnostics = Some(diagnostics);
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub mode: StartupMode,
    /// XML file merged into `running` after the mode step.
    pub extra_config: Option<PathBuf>,
    /// Where to write the report as JSON for other tools.
    pub status_path: Option<PathBuf>,
}

/// Runs the startup sequence and returns its report.  Errors returned here are fatal; the daemon
/// must not serve.
pub fn run_startup<D: DataStore>(
    engine: &Engine<D>,
    options: &StartupOptions,
) -> Result<StartupReport> {
    let running = DatastoreId::running();
    info!("Starting up in mode '{}'", options.mode);

    engine
        .cleanup_scratch()
        .context(error::EngineSnafu { op: "cleanup" })?;
    if !engine
        .exists(&running)
        .context(error::EngineSnafu { op: "exists" })?
    {
        info!("No running datastore, creating an empty one");
        engine
            .create(Caller::Internal, &running)
            .context(error::EngineSnafu { op: "create running" })?;
    }

    let mut report = StartupReport::new(options.mode);
    match options.mode {
        StartupMode::None => {}
        StartupMode::Init => {
            engine
                .reset(Caller::Internal, &running)
                .context(error::EngineSnafu { op: "reset running" })?;
        }
        StartupMode::Running => {
            let outcome = engine.validate_commit(Caller::Internal, CommitSource::Datastore(&running));
            classify(&mut report, outcome)?;
        }
        StartupMode::Startup => {
            let startup = DatastoreId::startup();
            if !engine
                .exists(&startup)
                .context(error::EngineSnafu { op: "exists" })?
            {
                info!("No startup datastore, creating an empty one");
                engine
                    .create(Caller::Internal, &startup)
                    .context(error::EngineSnafu { op: "create startup" })?;
            }
            let outcome = engine.validate_commit(Caller::Internal, CommitSource::Datastore(&startup));
            classify(&mut report, outcome)?;
        }
    }

    if report.status == StartupStatus::Ok && options.mode != StartupMode::None {
        if let Some(path) = &options.extra_config {
            load_extra_config(engine, path, &mut report)?;
        }
    }

    if report.status != StartupStatus::Ok {
        error!(
            "Startup configuration not loaded ({:?}): {}",
            report.status,
            report.diagnostics.as_deref().unwrap_or("no diagnostics")
        );
        load_failsafe(engine)?;
        report.failsafe = true;
    }

    engine
        .copy(Caller::Internal, &running, &DatastoreId::candidate())
        .context(error::EngineSnafu {
            op: "copy running to candidate",
        })?;

    if let Some(path) = &options.status_path {
        write_status(path, &report)?;
    }
    info!("Startup finished with status {:?}", report.status);
    Ok(report)
}

/// Records a validate-commit outcome in the report.  Rejections and unparseable trees are part of
/// normal startup; other errors are fatal.
fn classify(report: &mut StartupReport, outcome: engine::Result<CommitOutcome>) -> Result<()> {
    match outcome {
        Ok(CommitOutcome::Committed) => Ok(()),
        Ok(CommitOutcome::Rejected(diagnostics)) => {
            report.fail(StartupStatus::Invalid, diagnostics);
            Ok(())
        }
        Err(e) if e.is_malformed() => {
            report.fail(StartupStatus::Error, e.to_string());
            Ok(())
        }
        Err(e) => Err(e).context(error::EngineSnafu {
            op: "validate-commit",
        }),
    }
}

/// Merges the XML in `path` into `running`.
fn load_extra_config<D: DataStore>(
    engine: &Engine<D>,
    path: &Path,
    report: &mut StartupReport,
) -> Result<()> {
    debug!("Loading extra configuration from {}", path.display());
    let xml = fs::read_to_string(path).context(error::ExtraConfigReadSnafu { path })?;
    let fragment = match codec::parse(&xml) {
        Ok(fragment) => fragment,
        Err(e) => {
            report.fail(
                StartupStatus::Error,
                format!("Extra configuration {} is malformed: {}", path.display(), e),
            );
            return Ok(());
        }
    };
    if fragment.is_empty() {
        debug!("Extra configuration is empty, skipping");
        return Ok(());
    }
    let outcome = engine.validate_commit(Caller::Internal, CommitSource::Merge(&fragment));
    classify(report, outcome)
}

/// Commits the `failsafe` datastore to `running`.  Fails if there's no failsafe configuration or
/// validation rejects it, in which case `running` is left as it was.
pub fn load_failsafe<D: DataStore>(engine: &Engine<D>) -> Result<()> {
    let running = DatastoreId::running();
    let failsafe = DatastoreId::failsafe();
    ensure!(
        engine
            .exists(&failsafe)
            .context(error::EngineSnafu { op: "exists" })?,
        error::NoFailsafeSnafu
    );

    // A running tree that can't be parsed can't be snapshotted either; it's of no use to restore.
    if let Err(e) = engine.get(&running, &Selector::All) {
        if e.is_malformed() {
            warn!("Discarding malformed running configuration: {}", e);
            engine
                .reset(Caller::Internal, &running)
                .context(error::EngineSnafu { op: "reset running" })?;
        }
    }

    match engine
        .validate_commit(Caller::Internal, CommitSource::Datastore(&failsafe))
        .context(error::EngineSnafu {
            op: "commit failsafe",
        })? {
        CommitOutcome::Committed => {
            warn!("Failsafe configuration loaded, running is now the failsafe configuration");
            Ok(())
        }
        CommitOutcome::Rejected(diagnostics) => error::FailsafeInvalidSnafu { diagnostics }.fail(),
    }
}

/// Writes the report as JSON, replacing any previous report atomically.
fn write_status(path: &Path, report: &StartupReport) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    // Create the status file as a temporary file first and finish writing to it before swapping
    // the old status file out
    let status_tempfile =
        NamedTempFile::new_in(dir).context(error::CreateTempfileSnafu { path: dir })?;
    serde_json::to_writer_pretty(&status_tempfile, report).context(error::StatusWriteSnafu {
        path: status_tempfile.path(),
    })?;
    let tempfile_path = status_tempfile.into_temp_path();
    debug!("Updating status file in '{}'", path.display());
    tempfile_path
        .persist(path)
        .context(error::CreateStatusFileSnafu { path })?;
    Ok(())
}

mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to {} during startup: {}", op, source))]
        Engine {
            op: String,
            #[snafu(source(from(crate::engine::Error, Box::new)))]
            source: Box<crate::engine::Error>,
        },

        #[snafu(display("Unknown startup mode '{}'", given))]
        UnknownMode { given: String },

        #[snafu(display("Unable to read extra configuration '{}': {}", path.display(), source))]
        ExtraConfigRead { path: PathBuf, source: io::Error },

        #[snafu(display("Startup configuration failed and there is no failsafe configuration"))]
        NoFailsafe,

        #[snafu(display("Failsafe configuration is invalid: {}", diagnostics))]
        FailsafeInvalid { diagnostics: String },

        #[snafu(display("Failed to create temporary status file in '{}': {}", path.display(), source))]
        CreateTempfile { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to write startup status to '{}': {}", path.display(), source))]
        StatusWrite {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Failed to create status file '{}': {}", path.display(), source))]
        CreateStatusFile {
            path: PathBuf,
            source: tempfile::PathPersistError,
        },
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
