//! The protocol operations a session can request, and the replies it gets back.
//!
//! Requests are decoded from JSON once, at the edge of the server, and everything behind that
//! works with the `Rpc` enum.  Parameters are optional at this level so that a missing one can be
//! reported with a protocol error naming it, rather than a generic decoding failure.

use actix_web::http::StatusCode;
use datastore::Node;
use serde::{Deserialize, Serialize};

use crate::engine::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum Rpc {
    #[serde(rename_all = "kebab-case")]
    GetConfig {
        source: Option<String>,
        filter: Option<Filter>,
    },

    #[serde(rename_all = "kebab-case")]
    EditConfig {
        target: Option<String>,
        default_operation: Option<String>,
        test_option: Option<String>,
        error_option: Option<String>,
        /// The edit fragment as a tree.
        config: Option<Node>,
        /// The edit fragment as XML text.
        config_text: Option<String>,
        /// Applies the fragment at this node instead of the root.
        path: Option<String>,
    },

    #[serde(rename_all = "kebab-case")]
    CopyConfig {
        source: Option<String>,
        target: Option<String>,
    },

    #[serde(rename_all = "kebab-case")]
    DeleteConfig { target: Option<String> },

    #[serde(rename_all = "kebab-case")]
    Lock { target: Option<String> },

    #[serde(rename_all = "kebab-case")]
    Unlock { target: Option<String> },

    Commit,

    DiscardChanges,

    #[serde(rename_all = "kebab-case")]
    Validate { source: Option<String> },

    CloseSession,

    #[serde(rename_all = "kebab-case")]
    KillSession { session_id: Option<SessionId> },
}

impl Rpc {
    pub fn name(&self) -> &'static str {
        match self {
            Rpc::GetConfig { .. } => "get-config",
            Rpc::EditConfig { .. } => "edit-config",
            Rpc::CopyConfig { .. } => "copy-config",
            Rpc::DeleteConfig { .. } => "delete-config",
            Rpc::Lock { .. } => "lock",
            Rpc::Unlock { .. } => "unlock",
            Rpc::Commit => "commit",
            Rpc::DiscardChanges => "discard-changes",
            Rpc::Validate { .. } => "validate",
            Rpc::CloseSession => "close-session",
            Rpc::KillSession { .. } => "kill-session",
        }
    }
}

/// Limits the data returned by get-config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Filter {
    /// "xpath" (the default) or "subtree".
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// A path for xpath filters, or the XML text of the filter for subtree filters.
    pub select: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcReply {
    Ok,
    /// XML text of the requested tree.
    Data(String),
    RpcError(RpcError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorTag {
    MissingElement,
    InvalidValue,
    OperationNotSupported,
    OperationFailed,
    LockDenied,
    DataExists,
    DataMissing,
}

impl ErrorTag {
    /// HTTP status for a reply carrying this tag, following the RESTCONF mapping.
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorTag::MissingElement | ErrorTag::InvalidValue => StatusCode::BAD_REQUEST,
            ErrorTag::OperationNotSupported => StatusCode::METHOD_NOT_ALLOWED,
            ErrorTag::LockDenied | ErrorTag::DataExists | ErrorTag::DataMissing => {
                StatusCode::CONFLICT
            }
            ErrorTag::OperationFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The layer the error belongs to.
    fn error_type(self) -> ErrorType {
        match self {
            ErrorTag::MissingElement | ErrorTag::InvalidValue => ErrorType::Protocol,
            _ => ErrorType::Application,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RpcError {
    pub error_tag: ErrorTag,
    pub error_type: ErrorType,
    pub error_severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ErrorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bad_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl RpcError {
    pub fn new<S: Into<String>>(tag: ErrorTag, message: S) -> Self {
        Self {
            error_tag: tag,
            error_type: tag.error_type(),
            error_severity: ErrorSeverity::Error,
            error_message: Some(message.into()),
            error_info: None,
        }
    }

    pub fn bad_element<S: Into<String>>(mut self, element: S) -> Self {
        self.error_info.get_or_insert_with(Default::default).bad_element = Some(element.into());
        self
    }

    pub fn session_id(mut self, session: SessionId) -> Self {
        self.error_info.get_or_insert_with(Default::default).session_id = Some(session);
        self
    }
}

impl From<RpcError> for RpcReply {
    fn from(e: RpcError) -> Self {
        RpcReply::RpcError(e)
    }
}

impl RpcReply {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcReply::Ok | RpcReply::Data(_) => StatusCode::OK,
            RpcReply::RpcError(e) => e.error_tag.status_code(),
        }
    }
}
