//! Plugins extend the daemon with hooks run at startup and on session creation.
//!
//! The registry is built by the binary and handed to the server; there's no global plugin state.

use log::{debug, info};
use snafu::Snafu;
use std::collections::HashSet;

/// A plugin may implement any of the hooks; the defaults do nothing.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once after the startup sequence, before the server accepts requests.  An error
    /// aborts the daemon.
    fn start(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Decides whether `user` may open a session.  None means the plugin has no opinion.
    fn credentials(&self, _user: Option<&str>) -> Option<bool> {
        None
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register<P: Plugin + 'static>(&mut self, plugin: P) {
        debug!("Registered plugin '{}'", plugin.name());
        self.plugins.push(Box::new(plugin));
    }

    /// Runs the start hook of every plugin in registration order, stopping at the first failure.
    pub fn start_all(&self) -> Result<()> {
        for plugin in &self.plugins {
            info!("Starting plugin '{}'", plugin.name());
            plugin.start().map_err(|msg| Error::PluginStart {
                name: plugin.name().to_string(),
                msg,
            })?;
        }
        Ok(())
    }

    /// Whether `user` may open a session.  Users are allowed unless some plugin has an opinion,
    /// in which case at least one plugin must accept them.
    pub fn authorize(&self, user: Option<&str>) -> bool {
        let mut decided = false;
        for plugin in &self.plugins {
            match plugin.credentials(user) {
                Some(true) => return true,
                Some(false) => decided = true,
                None => {}
            }
        }
        !decided
    }
}

/// Accepts only the listed users.
#[derive(Debug, Clone)]
pub struct AllowedUsers {
    users: HashSet<String>,
}

impl AllowedUsers {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }
}

impl Plugin for AllowedUsers {
    fn name(&self) -> &str {
        "allowed-users"
    }

    fn credentials(&self, user: Option<&str>) -> Option<bool> {
        Some(user.map_or(false, |u| self.users.contains(u)))
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Plugin '{}' failed to start: {}", name, msg))]
    PluginStart { name: String, msg: String },
}

pub type Result<T> = std::result::Result<T, Error>;
