//! This is the primary binary for the netconfd configuration daemon.

#![deny(rust_2018_idioms)]

#[macro_use]
extern crate log;

use argh::FromArgs;
use datastore::FilesystemDataStore;
use nix::unistd::Gid;
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::process;

use netconfd::config::{Config, DEFAULT_CONFIG_PATH};
use netconfd::engine::Engine;
use netconfd::plugin::{AllowedUsers, PluginRegistry};
use netconfd::serve;
use netconfd::server::session::SessionTable;
use netconfd::server::SharedState;
use netconfd::startup::{self, StartupMode, StartupOptions};
use netconfd::validate::StructuralValidator;

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("{}", source))]
        Config { source: netconfd::config::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Startup failed: {}", source))]
        Startup { source: netconfd::startup::Error },

        #[snafu(display("{}", source))]
        Plugin { source: netconfd::plugin::Error },

        #[snafu(display("{}", source))]
        Server { source: netconfd::server::Error },
    }
}

/// Serves NETCONF-style configuration operations over a Unix socket.
#[derive(FromArgs, PartialEq, Debug)]
struct Args {
    /// TOML configuration file
    #[argh(option, long = "config")]
    config: Option<PathBuf>,
    /// directory holding the datastores
    #[argh(option, long = "datastore-path")]
    datastore_path: Option<PathBuf>,
    /// path of the API socket
    #[argh(option, long = "socket-path")]
    socket_path: Option<PathBuf>,
    /// group to own the API socket
    #[argh(option, long = "socket-gid")]
    socket_gid: Option<u32>,
    /// startup mode: none|init|running|startup
    #[argh(option, long = "startup-mode")]
    startup_mode: Option<StartupMode>,
    /// XML file merged into running at startup
    #[argh(option, long = "extra-config")]
    extra_config: Option<PathBuf>,
    /// where to write the startup status as JSON
    #[argh(option, long = "status-path")]
    status_path: Option<PathBuf>,
    /// log-level trace|debug|info|warn|error
    #[argh(option, long = "log-level")]
    log_level: Option<String>,
    /// run the startup sequence and start plugins, then exit without serving
    #[argh(switch, long = "once")]
    once: bool,
}

impl Args {
    /// Settings given on the command line, which override the config file.
    fn overrides(&self) -> Config {
        Config {
            datastore_path: self.datastore_path.clone(),
            socket_path: self.socket_path.clone(),
            socket_gid: self.socket_gid,
            startup_mode: self.startup_mode,
            extra_config: self.extra_config.clone(),
            status_path: self.status_path.clone(),
            threads: None,
            log_level: self.log_level.clone(),
            allowed_users: None,
        }
    }
}

/// Reads the config file named on the command line, or the default one if it exists.
fn load_config(args: &Args) -> Result<Config> {
    let file_config = match &args.config {
        Some(path) => Config::from_file(path).context(error::ConfigSnafu)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::from_file(DEFAULT_CONFIG_PATH).context(error::ConfigSnafu)?
        }
        None => Config::default(),
    };
    Ok(file_config.merge(args.overrides()))
}

/// Establishes the running configuration, then starts a web server to accept user requests.
async fn run() -> Result<()> {
    let args: Args = argh::from_env();
    let settings = load_config(&args)?
        .resolve()
        .context(error::ConfigSnafu)?;

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        settings.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    let engine = Engine::new(
        FilesystemDataStore::new(&settings.datastore_path),
        StructuralValidator,
    );
    let options = StartupOptions {
        mode: settings.startup_mode,
        extra_config: settings.extra_config.clone(),
        status_path: settings.status_path.clone(),
    };
    let report = startup::run_startup(&engine, &options).context(error::StartupSnafu)?;
    if report.failsafe {
        warn!(
            "Running the failsafe configuration: {}",
            report.diagnostics.as_deref().unwrap_or("no diagnostics")
        );
    }

    let mut plugins = PluginRegistry::new();
    if let Some(users) = &settings.allowed_users {
        plugins.register(AllowedUsers::new(users.iter().cloned()));
    }
    plugins.start_all().context(error::PluginSnafu)?;

    if args.once {
        info!("Startup complete, exiting");
        return Ok(());
    }

    let threads_suffix = match settings.threads {
        n if n > 1 => "s",
        _ => "",
    };
    info!(
        "Starting server at {} with {} thread{} and datastore at {}",
        settings.socket_path.display(),
        settings.threads,
        threads_suffix,
        settings.datastore_path.display(),
    );

    let state = SharedState {
        engine,
        sessions: SessionTable::new(),
        plugins,
        report,
    };
    serve(
        &settings.socket_path,
        state,
        settings.threads,
        settings.socket_gid.map(Gid::from_raw),
    )
    .await
    .context(error::ServerSnafu)
}

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
// https://github.com/shepmaster/snafu/issues/110
#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
