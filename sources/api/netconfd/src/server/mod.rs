//! The server module owns the API surface.  Clients open a session, send protocol operations as
//! JSON to /rpc, and close the session when they're done.  Operations are handed to the
//! server::controller module, which talks to the engine.

mod controller;
mod error;
pub mod rpc;
pub mod session;
pub use error::Error;

use actix_web::body::BoxBody;
use actix_web::{
    error::InternalError, web, App, HttpRequest, HttpResponse, HttpServer, Responder,
    ResponseError,
};
use datastore::DataStore;
use error::Result;
use log::info;
use nix::unistd::{chown, Gid};
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::env;
use std::fs::{set_permissions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use crate::engine::{Engine, SessionId};
use crate::plugin::PluginRegistry;
use crate::startup::StartupReport;
use rpc::{Rpc, RpcReply};
use session::SessionTable;

/// Header carrying the name of the user opening a session.
pub const REMOTE_USER_HEADER: &str = "X-Remote-User";

/// Everything the handlers share.  The startup report is recorded once, before serving, and only
/// read afterward.
pub struct SharedState<D> {
    pub engine: Engine<D>,
    pub sessions: SessionTable,
    pub plugins: PluginRegistry,
    pub report: StartupReport,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// sd_notify helper
fn notify_unix_socket_ready() -> Result<()> {
    if env::var_os("NOTIFY_SOCKET").is_some() {
        ensure!(
            Command::new("systemd-notify")
                .arg("--ready")
                .arg("--no-block")
                .status()
                .context(error::SystemdNotifySnafu)?
                .success(),
            error::SystemdNotifyStatusSnafu
        );
        env::remove_var("NOTIFY_SOCKET");
    } else {
        info!("NOTIFY_SOCKET not set, not calling systemd-notify");
    }
    Ok(())
}

// Router

/// This is the primary interface of the module.  It defines the server and application that actix
/// spawns for requests, sharing one engine between all workers.
pub async fn serve<P, D>(
    socket_path: P,
    state: SharedState<D>,
    threads: usize,
    socket_gid: Option<Gid>,
) -> Result<()>
where
    P: AsRef<Path>,
    D: DataStore + Send + Sync + 'static,
{
    let shared_state = web::Data::new(state);

    let http_server = HttpServer::new(move || {
        App::new()
            // If actix rejects a request body early because it isn't a valid rpc, it never
            // reaches our own error handling.  This configuration of the Json extractor adds the
            // error message to the response.
            .app_data(json_config())
            .app_data(shared_state.clone())
            .configure(routes::<D>)
    })
    .workers(threads)
    .bind_uds(socket_path.as_ref())
    .context(error::BindSocketSnafu {
        path: socket_path.as_ref(),
    })?;

    // If the socket needs to be chowned to a group to grant further access, that can be passed
    // as a parameter.
    if let Some(gid) = socket_gid {
        chown(socket_path.as_ref(), None, Some(gid)).context(error::SetGroupSnafu { gid })?;
    }

    let mode = 0o0660;
    let perms = Permissions::from_mode(mode);
    set_permissions(socket_path.as_ref(), perms).context(error::SetPermissionsSnafu { mode })?;

    // Notify system manager the UNIX socket has been initialized, so other service units can proceed
    notify_unix_socket_ready()?;

    http_server.run().await.context(error::ServerStartSnafu)
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().body(err.to_string());
        InternalError::from_response(err, response).into()
    })
}

fn routes<D>(cfg: &mut web::ServiceConfig)
where
    D: DataStore + Send + Sync + 'static,
{
    cfg.service(
        web::scope("/session")
            .route("", web::post().to(open_session::<D>))
            .route("", web::delete().to(close_session::<D>)),
    )
    .route("/rpc", web::post().to(handle_rpc::<D>))
    .route("/startup-status", web::get().to(get_startup_status::<D>));
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Handler methods called by the router

/// Opens a session for the user named in the request, if the plugins allow it.
async fn open_session<D: DataStore + 'static>(
    req: HttpRequest,
    data: web::Data<SharedState<D>>,
) -> Result<SessionResponse> {
    let user = req
        .headers()
        .get(REMOTE_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ensure!(
        data.plugins.authorize(user.as_deref()),
        error::UnauthorizedSnafu { user }
    );
    let session_id = data.sessions.open(user).context(error::SessionLockSnafu)?;
    info!("Opened session {}", session_id);
    Ok(SessionResponse { session_id })
}

/// Ends a session, releasing its locks.
async fn close_session<D: DataStore + 'static>(
    query: web::Query<HashMap<String, String>>,
    data: web::Data<SharedState<D>>,
) -> Result<HttpResponse> {
    let session = session_param(&query, "id")?;
    ensure!(
        data.sessions.contains(session),
        error::UnknownSessionSnafu { session }
    );
    controller::end_session(&data.engine, &data.sessions, session)
        .context(error::ReleaseLocksSnafu { session })?;
    info!("Closed session {}", session);
    Ok(HttpResponse::NoContent().finish()) // 204
}

/// Runs one protocol operation in the given session.  Protocol errors are replies, not HTTP
/// errors, but the status code follows the error tag.
async fn handle_rpc<D: DataStore + 'static>(
    query: web::Query<HashMap<String, String>>,
    rpc: web::Json<Rpc>,
    data: web::Data<SharedState<D>>,
) -> Result<RpcResponse> {
    let session = session_param(&query, "session")?;
    ensure!(
        data.sessions.contains(session),
        error::UnknownSessionSnafu { session }
    );
    let reply = controller::dispatch(&data.engine, &data.sessions, session, rpc.into_inner());
    Ok(RpcResponse(reply))
}

async fn get_startup_status<D: DataStore + 'static>(
    data: web::Data<SharedState<D>>,
) -> Result<StartupReportResponse> {
    Ok(StartupReportResponse(data.report.clone()))
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Helpers for handler methods called by the router

fn session_param(query: &web::Query<HashMap<String, String>>, name: &str) -> Result<SessionId> {
    let given = query
        .get(name)
        .context(error::MissingInputSnafu { input: name })?;
    given.parse().ok().context(error::InvalidInputSnafu {
        input: name,
        given: given.as_str(),
    })
}

/// Helper macro for implementing the actix-web Responder trait for a type.
/// $for: the type for which we implement Responder.
/// $self: just pass "self"  (macro hygiene requires this)
/// $serialize_expr: the thing to serialize for a response; this is just "self" again if $for
///    implements Serialize, or is "self.0" for a newtype over something implementing Serialize
macro_rules! impl_responder_for {
    ($for:ident, $self:ident, $serialize_expr:expr) => (
        impl Responder for $for {
            type Body = BoxBody;

            fn respond_to($self, _req: &HttpRequest) -> HttpResponse<Self::Body> {
                match serde_json::to_string(&$serialize_expr)
                    .context(error::ResponseSerializationSnafu)
                {
                    Ok(body) => HttpResponse::Ok()
                        .content_type("application/json")
                        .body(body),
                    Err(e) => e.error_response(),
                }
            }
        }
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct SessionResponse {
    session_id: SessionId,
}
impl_responder_for!(SessionResponse, self, self);

/// This lets us respond from our handler methods with a StartupReport (or Result<StartupReport>)
struct StartupReportResponse(StartupReport);
impl_responder_for!(StartupReportResponse, self, self.0);

/// An rpc reply, sent with the HTTP status matching its error tag.
struct RpcResponse(RpcReply);

impl Responder for RpcResponse {
    type Body = BoxBody;

    fn respond_to(self, _req: &HttpRequest) -> HttpResponse<Self::Body> {
        match serde_json::to_string(&self.0).context(error::ResponseSerializationSnafu) {
            Ok(body) => HttpResponse::build(self.0.status_code())
                .content_type("application/json")
                .body(body),
            Err(e) => e.error_response(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::AllowedUsers;
    use crate::startup::{StartupMode, StartupStatus};
    use crate::validate::StructuralValidator;
    use actix_web::http::StatusCode;
    use actix_web::test::{self, TestRequest};
    use datastore::{DatastoreId, MemoryDataStore};
    use serde_json::{json, Value};

    fn state(plugins: PluginRegistry) -> web::Data<SharedState<MemoryDataStore>> {
        let mut ds = MemoryDataStore::new();
        ds.write_raw(&DatastoreId::running(), "<config/>");
        ds.write_raw(&DatastoreId::candidate(), "<config/>");
        web::Data::new(SharedState {
            engine: Engine::new(ds, StructuralValidator),
            sessions: SessionTable::new(),
            plugins,
            report: StartupReport {
                mode: StartupMode::Running,
                status: StartupStatus::Ok,
                failsafe: false,
                diagnostics: None,
            },
        })
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(json_config())
                    .app_data($state.clone())
                    .configure(routes::<MemoryDataStore>),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn session_lifecycle() {
        let state = state(PluginRegistry::new());
        let app = app!(state);

        let resp = test::call_service(&app, TestRequest::post().uri("/session").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"session-id": 1}));

        let req = TestRequest::post()
            .uri("/rpc?session=1")
            .set_json(json!({"operation": "lock", "target": "candidate"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!("ok"));

        let req = TestRequest::delete().uri("/session?id=1").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::NO_CONTENT
        );
        // Closing the session released its lock.
        assert_eq!(
            state
                .engine
                .locks()
                .holder(&DatastoreId::candidate())
                .unwrap(),
            None
        );

        let req = TestRequest::post()
            .uri("/rpc?session=1")
            .set_json(json!({"operation": "commit"}))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[actix_web::test]
    async fn rpc_errors_set_status() {
        let state = state(PluginRegistry::new());
        let app = app!(state);
        test::call_service(&app, TestRequest::post().uri("/session").to_request()).await;

        let req = TestRequest::post()
            .uri("/rpc?session=1")
            .set_json(json!({"operation": "get-config"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["rpc-error"]["error-tag"], json!("missing-element"));

        let req = TestRequest::post()
            .uri("/rpc?session=1")
            .set_json(json!({"operation": "get-config", "source": "running"}))
            .to_request();
        let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert_eq!(body, json!({"data": "<config/>"}));

        // Not an rpc at all.
        let req = TestRequest::post()
            .uri("/rpc?session=1")
            .set_json(json!({"operation": "reboot"}))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );

        let req = TestRequest::post()
            .uri("/rpc?session=one")
            .set_json(json!({"operation": "commit"}))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[actix_web::test]
    async fn plugins_authorize_sessions() {
        let mut plugins = PluginRegistry::new();
        plugins.register(AllowedUsers::new(vec!["admin"]));
        let state = state(plugins);
        let app = app!(state);

        let req = TestRequest::post().uri("/session").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::FORBIDDEN
        );
        let req = TestRequest::post()
            .uri("/session")
            .insert_header((REMOTE_USER_HEADER, "admin"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn startup_status() {
        let state = state(PluginRegistry::new());
        let app = app!(state);
        let req = TestRequest::get().uri("/startup-status").to_request();
        let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert_eq!(
            body,
            json!({"mode": "running", "status": "ok", "failsafe": false})
        );
    }
}
