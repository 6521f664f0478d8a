use actix_web::{HttpResponse, ResponseError};
use nix::unistd::Gid;
use snafu::Snafu;
use std::io;
use std::path::PathBuf;

use crate::engine::SessionId;

// Errors from the HTTP layer.  Protocol errors in an rpc are not errors here; they're returned
// to the client as rpc-error replies.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    // Systemd Notification errors
    #[snafu(display("Systemd notify error: {}", source))]
    SystemdNotify { source: std::io::Error },

    #[snafu(display("Failed to send systemd status notification"))]
    SystemdNotifyStatus,

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Set file metadata errors
    #[snafu(display(
        "Failed to set file permissions on the API socket to {:o}: {}",
        mode,
        source
    ))]
    SetPermissions { source: std::io::Error, mode: u32 },

    #[snafu(display("Failed to set group owner on the API socket to {}: {}", gid, source))]
    SetGroup { source: nix::Error, gid: Gid },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Server errors
    #[snafu(display("Missing required input '{}'", input))]
    MissingInput { input: String },

    #[snafu(display("Invalid input '{}': '{}'", input, given))]
    InvalidInput { input: String, given: String },

    #[snafu(display("No open session {}", session))]
    UnknownSession { session: SessionId },

    #[snafu(display("User {:?} may not open a session", user))]
    Unauthorized { user: Option<String> },

    #[snafu(display("Another thread poisoned the session table by panicking"))]
    SessionLock,

    #[snafu(display("Unable to release locks of session {}: {}", session, source))]
    ReleaseLocks {
        session: SessionId,
        #[snafu(source(from(crate::engine::Error, Box::new)))]
        source: Box<crate::engine::Error>,
    },

    #[snafu(display("Unable to serialize response: {}", source))]
    ResponseSerialization { source: serde_json::Error },

    #[snafu(display("Unable to bind to {}: {}", path.display(), source))]
    BindSocket { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to start server: {}", source))]
    ServerStart { source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

// Can also override `render_response` if we want to change headers, content type, etc.
impl ResponseError for Error {
    /// Maps our error types to the HTTP error code they should return.
    fn error_response(&self) -> HttpResponse {
        use Error::*;
        match self {
            // 400 Bad Request
            MissingInput { .. } => HttpResponse::BadRequest(),
            InvalidInput { .. } => HttpResponse::BadRequest(),

            // 403 Forbidden
            Unauthorized { .. } => HttpResponse::Forbidden(),

            // 404 Not Found
            UnknownSession { .. } => HttpResponse::NotFound(),

            // 500 Internal Server Error
            SessionLock => HttpResponse::InternalServerError(),
            ReleaseLocks { .. } => HttpResponse::InternalServerError(),
            ResponseSerialization { .. } => HttpResponse::InternalServerError(),
            BindSocket { .. } => HttpResponse::InternalServerError(),
            ServerStart { .. } => HttpResponse::InternalServerError(),
            SystemdNotify { .. } => HttpResponse::InternalServerError(),
            SystemdNotifyStatus => HttpResponse::InternalServerError(),
            SetPermissions { .. } => HttpResponse::InternalServerError(),
            SetGroup { .. } => HttpResponse::InternalServerError(),
        }
        .body(self.to_string())
    }
}
