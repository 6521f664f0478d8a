/*!
# Background

netconfd is a configuration daemon.  It keeps configuration trees in named datastores and lets
clients inspect and change them with NETCONF-style operations: get-config, edit-config,
copy-config, delete-config, lock, unlock, commit, discard-changes, validate, close-session and
kill-session.

Clients edit the `candidate` datastore and commit it.  `running`, the active configuration, only
ever changes through the validate-commit protocol: the old tree is snapshotted, the new one is
written and validated, and the snapshot is restored if validation rejects it.

# Startup

Before serving, the startup controller establishes `running` according to the startup mode:

* `none` keeps `running` untouched.
* `init` starts from an empty tree.
* `running` (the default) revalidates the existing `running`.
* `startup` replaces `running` with the `startup` datastore.

An extra configuration file can then be merged in.  If any step is rejected, the `failsafe`
datastore is committed instead; if that fails too, the daemon exits.  The outcome is available
from `GET /startup-status` and, optionally, written to a status file.

# API

The API is HTTP over a Unix socket.  Clients open a session with `POST /session`, send operations
as JSON to `POST /rpc?session=N`, and end the session with `DELETE /session?id=N`.  Ending a
session, by closing or by being killed, releases every lock it holds.

# Design

The `engine` module owns the datastores and the lock table; the `server::controller` module maps
protocol operations onto it.  Plugins are registered explicitly by the binary and passed to the
server.
*/

pub mod config;
pub mod engine;
pub mod plugin;
pub mod server;
pub mod startup;
pub mod validate;

pub use server::serve;
