//! The controller module maps between the protocol operations and the engine.  Every rpc ends
//! in a reply; engine errors become rpc-error replies here and never end the session.

use datastore::codec;
use datastore::edit::{self, DefaultOperation};
use datastore::select::{Path, Selector, FILTER_NAME};
use datastore::tree::ROOT_NAME;
use datastore::{ConfigTree, DataStore, DatastoreId, Node};
use log::{debug, info};
use std::fmt::Display;
use std::str::FromStr;

use super::rpc::{ErrorTag, Filter, Rpc, RpcError, RpcReply};
use super::session::SessionTable;
use crate::engine::{self, Caller, CommitOutcome, CommitSource, Engine, SessionId};
use crate::validate::Validation;

type Reply = std::result::Result<RpcReply, RpcError>;

const TEST_THEN_SET: &str = "test-then-set";
const STOP_ON_ERROR: &str = "stop-on-error";

/// Runs one rpc for `session` and returns the reply to send.
pub fn dispatch<D: DataStore>(
    engine: &Engine<D>,
    sessions: &SessionTable,
    session: SessionId,
    rpc: Rpc,
) -> RpcReply {
    let name = rpc.name();
    debug!("Session {} requested {}", session, name);
    match handle(engine, sessions, session, rpc) {
        Ok(reply) => reply,
        Err(e) => {
            info!(
                "Session {} {} failed with {:?}: {}",
                session,
                name,
                e.error_tag,
                e.error_message.as_deref().unwrap_or_default()
            );
            RpcReply::RpcError(e)
        }
    }
}

fn handle<D: DataStore>(
    engine: &Engine<D>,
    sessions: &SessionTable,
    session: SessionId,
    rpc: Rpc,
) -> Reply {
    let caller = Caller::Session(session);
    match rpc {
        Rpc::GetConfig { source, filter } => {
            let id = datastore_param("source", source)?;
            let selector = selector(filter)?;
            let tree = engine
                .get(&id, &selector)
                .map_err(|e| engine_error(e, "source"))?;
            let text = codec::to_string(&tree)
                .map_err(|e| RpcError::new(ErrorTag::OperationFailed, e.to_string()))?;
            Ok(RpcReply::Data(text))
        }

        Rpc::EditConfig {
            target,
            default_operation,
            test_option,
            error_option,
            config,
            config_text,
            path,
        } => {
            let id = datastore_param("target", target)?;
            if id != DatastoreId::candidate() {
                return Err(RpcError::new(
                    ErrorTag::MissingElement,
                    format!("edit-config target must be '{}'", datastore::id::CANDIDATE),
                )
                .bad_element("target"));
            }
            let operation = match default_operation {
                Some(op) => DefaultOperation::from_str(&op)
                    .map_err(|e| invalid_value("default-operation", e))?,
                None => DefaultOperation::default(),
            };
            check_option(
                "test-option",
                test_option,
                TEST_THEN_SET,
                &["set", "test-only"],
            )?;
            check_option(
                "error-option",
                error_option,
                STOP_ON_ERROR,
                &["continue-on-error", "rollback-on-error"],
            )?;
            let fragment = match (config, config_text) {
                (Some(node), _) => {
                    codec::check_names(&node).map_err(|e| invalid_value("config", e))?;
                    ConfigTree::from_root(node)
                }
                (None, Some(text)) => {
                    codec::parse(&text).map_err(|e| invalid_value("config-text", e))?
                }
                (None, None) => {
                    return Err(RpcError::new(
                        ErrorTag::MissingElement,
                        "edit-config needs 'config' or 'config-text'",
                    )
                    .bad_element("config"))
                }
            };
            let path = match path {
                Some(p) => Some(Path::from_str(&p).map_err(|e| invalid_value("path", e))?),
                None => None,
            };
            engine
                .put(caller, &id, operation, path.as_ref(), fragment)
                .map_err(|e| engine_error(e, "target"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::CopyConfig { source, target } => {
            let source = datastore_param("source", source)?;
            let target = datastore_param("target", target)?;
            if target == DatastoreId::running() {
                // Nothing reaches running without passing validation.
                let outcome = engine
                    .validate_commit(caller, CommitSource::Datastore(&source))
                    .map_err(|e| engine_error(e, "source"))?;
                if let CommitOutcome::Rejected(diagnostics) = outcome {
                    return Err(RpcError::new(ErrorTag::OperationFailed, diagnostics));
                }
            } else {
                engine
                    .copy(caller, &source, &target)
                    .map_err(|e| engine_error(e, "source"))?;
            }
            Ok(RpcReply::Ok)
        }

        Rpc::DeleteConfig { target } => {
            let id = datastore_param("target", target)?;
            if id == DatastoreId::running() {
                return Err(RpcError::new(
                    ErrorTag::MissingElement,
                    "the running datastore can't be deleted",
                )
                .bad_element("target"));
            }
            engine
                .delete(caller, &id)
                .map_err(|e| engine_error(e, "target"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::Lock { target } => {
            let id = datastore_param("target", target)?;
            engine
                .lock(&id, session, |s| sessions.contains(s))
                .map_err(|e| engine_error(e, "target"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::Unlock { target } => {
            let id = datastore_param("target", target)?;
            engine
                .unlock(&id, session)
                .map_err(|e| engine_error(e, "target"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::Commit => {
            engine
                .commit(session)
                .map_err(|e| engine_error(e, "candidate"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::DiscardChanges => {
            engine
                .discard_changes(session)
                .map_err(|e| engine_error(e, "running"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::Validate { source } => {
            let id = datastore_param("source", source)?;
            match engine
                .validate(&id)
                .map_err(|e| engine_error(e, "source"))?
            {
                Validation::Valid => Ok(RpcReply::Ok),
                Validation::Rejected(diagnostics) => {
                    Err(RpcError::new(ErrorTag::OperationFailed, diagnostics))
                }
            }
        }

        Rpc::CloseSession => {
            end_session(engine, sessions, session).map_err(|e| engine_error(e, "session-id"))?;
            Ok(RpcReply::Ok)
        }

        Rpc::KillSession { session_id } => {
            let victim = session_id.ok_or_else(|| {
                RpcError::new(ErrorTag::MissingElement, "kill-session needs 'session-id'")
                    .bad_element("session-id")
            })?;
            if victim == session {
                return Err(RpcError::new(
                    ErrorTag::InvalidValue,
                    "a session can't kill itself; use close-session",
                )
                .bad_element("session-id"));
            }
            if !sessions.contains(victim) {
                return Err(RpcError::new(
                    ErrorTag::InvalidValue,
                    format!("no open session {}", victim),
                )
                .bad_element("session-id"));
            }
            info!("Session {} killing session {}", session, victim);
            end_session(engine, sessions, victim).map_err(|e| engine_error(e, "session-id"))?;
            Ok(RpcReply::Ok)
        }
    }
}

/// Forgets the session, then releases everything it holds.  The session is closed first so that
/// a lock request already in flight for it is refused rather than left behind.
pub fn end_session<D: DataStore>(
    engine: &Engine<D>,
    sessions: &SessionTable,
    session: SessionId,
) -> engine::Result<()> {
    sessions.close(session);
    let released = engine.unlock_all(session)?;
    if !released.is_empty() {
        debug!("Released locks of session {} on {:?}", session, released);
    }
    Ok(())
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Parameter helpers

fn datastore_param(element: &str, value: Option<String>) -> std::result::Result<DatastoreId, RpcError> {
    let name = value.ok_or_else(|| {
        RpcError::new(ErrorTag::MissingElement, format!("missing '{}'", element))
            .bad_element(element)
    })?;
    let id = DatastoreId::new(&name).map_err(|e| {
        RpcError::new(
            ErrorTag::MissingElement,
            format!("unknown datastore '{}': {}", name, e),
        )
        .bad_element(element)
    })?;
    // Scratch names belong to validate-commit snapshots.
    if id.is_scratch() {
        return Err(invalid_value(
            element,
            format!("datastore name '{}' is reserved", name),
        ));
    }
    Ok(id)
}

/// Accepts the option if it's absent or `supported`; known values we don't implement and
/// unknown values get different errors.
fn check_option(
    element: &str,
    value: Option<String>,
    supported: &str,
    known: &[&str],
) -> std::result::Result<(), RpcError> {
    match value.as_deref() {
        None => Ok(()),
        Some(v) if v == supported => Ok(()),
        Some(v) if known.contains(&v) => Err(RpcError::new(
            ErrorTag::OperationNotSupported,
            format!("{} '{}' is not supported", element, v),
        )
        .bad_element(element)),
        Some(v) => Err(invalid_value(element, format!("unknown value '{}'", v))),
    }
}

fn selector(filter: Option<Filter>) -> std::result::Result<Selector, RpcError> {
    let filter = match filter {
        Some(filter) => filter,
        None => return Ok(Selector::All),
    };
    match filter.kind.as_deref() {
        None | Some("xpath") => match filter.select {
            Some(select) => Path::from_str(&select)
                .map(Selector::Path)
                .map_err(|e| invalid_value("select", e)),
            None => Ok(Selector::All),
        },
        Some("subtree") => match filter.select {
            Some(select) => subtree_filter(&select).map(Selector::Subtree),
            None => Ok(Selector::All),
        },
        Some(other) => Err(RpcError::new(
            ErrorTag::OperationFailed,
            format!("filter type '{}' not supported", other),
        )
        .bad_element("type")),
    }
}

/// Parses the XML of a subtree filter.  The text may hold several top-level filter elements, or
/// a single `filter`/`config` wrapper; blank text is the empty filter.
fn subtree_filter(text: &str) -> std::result::Result<Node, RpcError> {
    let wrapped = format!("<{0}>{1}</{0}>", FILTER_NAME, text);
    let mut root = codec::parse(&wrapped)
        .map_err(|e| invalid_value("select", e))?
        .into_root();
    if root.children.len() == 1
        && (root.children[0].name == FILTER_NAME || root.children[0].name == ROOT_NAME)
    {
        root = root.children.remove(0);
    }
    Ok(root)
}

fn invalid_value<E: Display>(element: &str, e: E) -> RpcError {
    RpcError::new(ErrorTag::InvalidValue, e.to_string()).bad_element(element)
}

/// Converts an engine error to a protocol error.  `element` names the parameter a missing
/// datastore was given by.
fn engine_error(e: engine::Error, element: &str) -> RpcError {
    let message = e.to_string();
    match e {
        engine::Error::NotFound { .. } => {
            RpcError::new(ErrorTag::MissingElement, message).bad_element(element)
        }
        engine::Error::AlreadyExists { .. } => RpcError::new(ErrorTag::DataExists, message),
        engine::Error::Locked { holder, .. } => {
            RpcError::new(ErrorTag::LockDenied, message).session_id(holder)
        }
        engine::Error::NotOwner { holder, .. } => {
            let error = RpcError::new(ErrorTag::LockDenied, message);
            match holder {
                Some(holder) => error.session_id(holder),
                None => error,
            }
        }
        engine::Error::Edit { source, .. } => match source {
            edit::Error::DataExists { name } => {
                RpcError::new(ErrorTag::DataExists, message).bad_element(name)
            }
            edit::Error::DataMissing { name } => {
                RpcError::new(ErrorTag::DataMissing, message).bad_element(name)
            }
            edit::Error::InvalidOperation { .. } => {
                RpcError::new(ErrorTag::InvalidValue, message).bad_element("operation")
            }
            edit::Error::PathNotFound { .. } => {
                RpcError::new(ErrorTag::InvalidValue, message).bad_element("path")
            }
        },
        engine::Error::ValidationRejected { diagnostics } => {
            RpcError::new(ErrorTag::OperationFailed, diagnostics)
        }
        _ => RpcError::new(ErrorTag::OperationFailed, message),
    }
}
