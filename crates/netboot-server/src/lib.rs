//! HTTP control plane for netbootd.
//!
//! Requests are served by a blocking `tiny_http` loop; each one is
//! dispatched onto the daemon's tokio runtime. Every response body is JSON,
//! errors are `{"error": "..."}` with a status derived from [`CoreError`].
//!
//! The [`TestServer`] helper starts a server on a random port for
//! integration testing.

use chrono::{DateTime, Utc};
use netboot_core::{CoreError, ImageSpec, Orchestrator};
use netboot_store::{BootStage, ImageId, JobId, MachineId, SessionId, TargetName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An error on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self::new(404, "not found")
    }

    fn method_not_allowed() -> Self {
        Self::new(405, "method not allowed")
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match e {
            CoreError::Validation(_) | CoreError::InvalidTransition { .. } => 400,
            CoreError::NotFound(_) => 404,
            CoreError::ConcurrencyConflict(_) => 409,
            CoreError::TransientProvisioning(_) | CoreError::PermanentProvisioning { .. } => 502,
            CoreError::Timeout(_) => 504,
            _ => 500,
        };
        Self::new(status, e.to_string())
    }
}

/// The routes of the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Health,
    Machines,
    Machine(&'a str),
    MachineConfirm(&'a str),
    Images,
    Image(&'a str),
    ImageUploaded(&'a str),
    ImageResubmit(&'a str),
    Jobs,
    Job(&'a str),
    Sessions,
    Session(&'a str),
    Targets,
    TargetRepair(&'a str),
    BootEvents,
    Events,
}

/// Map a request path (query string already removed) to its route.
pub fn parse_route(path: &str) -> Option<Route<'_>> {
    if path == "/health" {
        return Some(Route::Health);
    }
    let rest = path.strip_prefix("/v1/")?;
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    let route = match segments[..] {
        ["machines"] => Route::Machines,
        ["machines", id] => Route::Machine(id),
        ["machines", id, "confirm"] => Route::MachineConfirm(id),
        ["images"] => Route::Images,
        ["images", id] => Route::Image(id),
        ["images", id, "uploaded"] => Route::ImageUploaded(id),
        ["images", id, "resubmit"] => Route::ImageResubmit(id),
        ["jobs"] => Route::Jobs,
        ["jobs", id] => Route::Job(id),
        ["sessions"] => Route::Sessions,
        ["sessions", id] => Route::Session(id),
        ["targets"] => Route::Targets,
        ["targets", name, "repair"] => Route::TargetRepair(name),
        ["boot-events"] => Route::BootEvents,
        ["events"] => Route::Events,
        _ => return None,
    };
    match route {
        Route::Machine(s)
        | Route::MachineConfirm(s)
        | Route::Image(s)
        | Route::ImageUploaded(s)
        | Route::ImageResubmit(s)
        | Route::Job(s)
        | Route::Session(s)
        | Route::TargetRepair(s)
            if s.is_empty() =>
        {
            None
        }
        _ => Some(route),
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[derive(Debug, Deserialize)]
struct RegisterMachine {
    id: MachineId,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Uploaded {
    #[serde(default)]
    checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartSession {
    machine: MachineId,
    image: ImageId,
}

#[derive(Debug, Deserialize)]
struct BootEvent {
    machine: MachineId,
    stage: BootStage,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::new(400, format!("invalid body: {e}")))
}

fn parse_optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

type Reply = (u16, Value);

fn ok<T: Serialize>(status: u16, value: &T) -> Result<Reply, ApiError> {
    serde_json::to_value(value)
        .map(|v| (status, v))
        .map_err(|e| ApiError::new(500, format!("serialization failed: {e}")))
}

/// Shared state of the request handlers.
pub struct App {
    orch: Orchestrator,
    runtime: Handle,
}

impl App {
    pub fn new(orch: Orchestrator, runtime: Handle) -> Self {
        Self { orch, runtime }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orch
    }

    async fn dispatch(&self, method: &Method, url: &str, body: &[u8]) -> Result<Reply, ApiError> {
        let (path, query) = split_query(url);
        let route = parse_route(path).ok_or_else(ApiError::not_found)?;
        let orch = &self.orch;

        match (route, method) {
            (Route::Health, Method::Get) => Ok((200, json!({"status": "ok"}))),

            (Route::Machines, Method::Get) => ok(200, &orch.registry().list()?),
            (Route::Machines, Method::Post) => {
                let req: RegisterMachine = parse_body(body)?;
                ok(200, &orch.registry().register(&req.id, &req.display_name)?)
            }
            (Route::Machine(id), Method::Get) => {
                ok(200, &orch.registry().get(&MachineId::new(id))?)
            }
            (Route::Machine(id), Method::Delete) => {
                orch.registry().deregister(&MachineId::new(id))?;
                Ok((200, json!({"removed": id})))
            }
            (Route::MachineConfirm(id), Method::Post) => {
                ok(200, &orch.confirm(&MachineId::new(id))?)
            }

            (Route::Images, Method::Get) => ok(200, &orch.catalog().list()?),
            (Route::Images, Method::Post) => {
                let spec: ImageSpec = parse_body(body)?;
                ok(201, &orch.catalog().create(spec)?)
            }
            (Route::Image(id), Method::Get) => ok(200, &orch.catalog().get(&ImageId::new(id))?),
            (Route::Image(id), Method::Delete) => {
                ok(200, &orch.catalog().remove(&ImageId::new(id))?)
            }
            (Route::ImageUploaded(id), Method::Post) => {
                let req: Uploaded = parse_optional_body(body)?;
                let image = orch
                    .catalog()
                    .mark_uploaded(&ImageId::new(id), req.checksum)
                    .await?;
                ok(202, &image)
            }
            (Route::ImageResubmit(id), Method::Post) => {
                ok(202, &orch.catalog().resubmit(&ImageId::new(id)).await?)
            }

            (Route::Jobs, Method::Get) => ok(200, &orch.jobs().list()?),
            (Route::Job(id), Method::Get) => ok(200, &orch.jobs().poll(&JobId::new(id))?),

            (Route::Sessions, Method::Get) => ok(200, &orch.list()?),
            (Route::Sessions, Method::Post) => {
                let req: StartSession = parse_body(body)?;
                ok(202, &orch.start(&req.machine, &req.image)?)
            }
            (Route::Session(id), Method::Get) => ok(200, &orch.get(&SessionId::new(id))?),
            (Route::Session(id), Method::Delete) => ok(202, &orch.stop(&SessionId::new(id))?),

            (Route::Targets, Method::Get) => ok(200, &orch.targets().list()?),
            (Route::TargetRepair(name), Method::Post) => {
                ok(200, &orch.repair_target(&TargetName::new(name)).await?)
            }

            (Route::BootEvents, Method::Post) => {
                let event: BootEvent = parse_body(body)?;
                let machine = orch.report_boot_event(&event.machine, event.stage, event.timestamp)?;
                ok(200, &machine)
            }

            (Route::Events, Method::Get) => {
                let limit = match query_param(query, "limit") {
                    Some(raw) => raw
                        .parse()
                        .map_err(|_| ApiError::new(400, format!("invalid limit {raw:?}")))?,
                    None => DEFAULT_EVENT_LIMIT,
                };
                ok(200, &orch.events().recent(limit))
            }

            _ => Err(ApiError::method_not_allowed()),
        }
    }
}

fn respond_json(req: Request, status: u16, body: &Value) {
    let data = body.to_string().into_bytes();
    let response = Response::from_data(data).with_status_code(StatusCode(status));
    let response = match Header::from_bytes("Content-Type", "application/json") {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    };
    if let Err(e) = req.respond(response) {
        warn!("failed to send response: {e}");
    }
}

fn read_body(req: &mut Request) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader().read_to_end(&mut body)?;
    Ok(body)
}

/// Handle a single HTTP request on the app's runtime.
pub fn handle_request(app: &App, mut req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let body = match read_body(&mut req) {
        Ok(body) => body,
        Err(e) => {
            respond_json(req, 400, &json!({"error": format!("read error: {e}")}));
            return;
        }
    };

    match app.runtime.block_on(app.dispatch(&method, &url, &body)) {
        Ok((status, value)) => respond_json(req, status, &value),
        Err(e) => {
            if e.status >= 500 {
                error!("{method} {url}: {}", e.message);
            } else {
                debug!("{method} {url}: {} {}", e.status, e.message);
            }
            respond_json(req, e.status, &json!({"error": e.message}));
        }
    }
}

pub fn bind(addr: &str) -> Result<Server, ServeError> {
    Server::http(addr).map_err(|e| ServeError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Serve until `stop` returns true; it is checked between requests and at
/// least every `poll` while idle.
pub fn serve(app: &App, server: &Server, poll: Duration, stop: impl Fn() -> bool) {
    while !stop() {
        match server.recv_timeout(poll) {
            Ok(Some(request)) => handle_request(app, request),
            Ok(None) => {}
            Err(e) => {
                error!("accepting request failed: {e}");
                break;
            }
        }
    }
    info!("HTTP server stopped");
}

/// A test helper that serves an [`Orchestrator`] on a random port in a
/// background thread.
///
/// The server listens on `127.0.0.1:{port}`; dropping the `TestServer`
/// unblocks and joins the serving thread.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Bind `127.0.0.1:0` and start serving on `runtime`.
    pub fn start(orch: Orchestrator, runtime: Handle) -> Result<Self, ServeError> {
        let server = Arc::new(bind("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| ServeError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP listener".to_owned(),
            })?;
        let url = format!("http://127.0.0.1:{port}");

        let app = App::new(orch, runtime);
        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&app, request);
            }
        });

        Ok(Self {
            url,
            port,
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_collection_routes() {
        assert_eq!(parse_route("/health"), Some(Route::Health));
        assert_eq!(parse_route("/v1/machines"), Some(Route::Machines));
        assert_eq!(parse_route("/v1/sessions/"), Some(Route::Sessions));
        assert_eq!(parse_route("/v1/boot-events"), Some(Route::BootEvents));
    }

    #[test]
    fn parse_keyed_routes() {
        assert_eq!(
            parse_route("/v1/machines/aa:bb:cc:dd:ee:ff"),
            Some(Route::Machine("aa:bb:cc:dd:ee:ff"))
        );
        assert_eq!(
            parse_route("/v1/machines/M1/confirm"),
            Some(Route::MachineConfirm("M1"))
        );
        assert_eq!(
            parse_route("/v1/images/win11-base/uploaded"),
            Some(Route::ImageUploaded("win11-base"))
        );
        assert_eq!(
            parse_route("/v1/targets/M1-win11-base/repair"),
            Some(Route::TargetRepair("M1-win11-base"))
        );
    }

    #[test]
    fn parse_rejects_unknown_paths() {
        assert_eq!(parse_route("/v2/machines"), None);
        assert_eq!(parse_route("/v1/targets/M1-win11-base"), None);
        assert_eq!(parse_route("/v1/images//uploaded"), None);
        assert_eq!(parse_route("/machines"), None);
    }

    #[test]
    fn query_params() {
        let (path, query) = split_query("/v1/events?limit=5&kind=session");
        assert_eq!(path, "/v1/events");
        assert_eq!(query_param(query, "limit"), Some("5"));
        assert_eq!(query_param(query, "kind"), Some("session"));
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param(None, "limit"), None);
    }

    #[test]
    fn core_errors_map_to_status_codes() {
        let status = |e: CoreError| ApiError::from(e).status;
        assert_eq!(status(CoreError::Validation("x".to_owned())), 400);
        assert_eq!(status(CoreError::NotFound("x".to_owned())), 404);
        assert_eq!(status(CoreError::ConcurrencyConflict("x".to_owned())), 409);
        assert_eq!(
            status(CoreError::PermanentProvisioning {
                attempts: 4,
                last_error: "x".to_owned()
            }),
            502
        );
        assert_eq!(status(CoreError::Config("x".to_owned())), 500);
    }

    #[test]
    fn empty_upload_body_means_no_checksum() {
        let req: Uploaded = parse_optional_body(b"").unwrap();
        assert!(req.checksum.is_none());
        let req: Uploaded = parse_optional_body(br#"{"checksum":"ABC"}"#).unwrap();
        assert_eq!(req.checksum.as_deref(), Some("ABC"));
        assert!(parse_optional_body::<Uploaded>(b"{").is_err());
    }
}
