use crate::auth::AuthGate;
use crate::cli::BackendCli;
use crate::config::{GatewayConfig, ServerConfig};
use crate::control_ui::{inject_bootstrap, is_control_ui_request, is_html};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::onboarding::Onboarding;
use crate::pool::UpstreamPool;
use crate::setup;
use crate::supervisor::Supervisor;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on the gateway's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

const SETTING_UP_PAGE: &str = concat!(
    r#"<!DOCTYPE html><html><head><meta charset="utf-8"><meta http-equiv="refresh" content="5"><title>Setting up...</title></head>"#,
    r#"<body style="background:#050810;color:#fff;font-family:system-ui,sans-serif;display:flex;justify-content:center;align-items:center;height:100vh;margin:0">"#,
    r#"<div style="text-align:center"><h2>Setting up your bot...</h2>"#,
    "<p>Auto-configuration is in progress. This page will refresh automatically.</p>",
    "</div></body></html>"
);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Returned from the service to drop the client connection without a response
#[derive(Debug, thiserror::Error)]
#[error("upgrade rejected: {0}")]
pub struct UpgradeRejected(pub &'static str);

/// Everything a request handler needs
pub struct AppState {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthGate,
    pub supervisor: Arc<Supervisor>,
    pub onboarding: Arc<Onboarding>,
    pub pool: Arc<UpstreamPool>,
    pub cli: BackendCli,
}

/// The public listener: setup API plus the authenticated gateway proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AppState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

pub async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, UpgradeRejected> {
    let path = req.uri().path().to_string();

    if path == "/setup" || path.starts_with("/setup/") {
        return Ok(setup::handle(req, &state, client_addr).await);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append; this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    if request_log_level(&state.server) == Level::INFO {
        info!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");
    } else {
        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &state, request_id).await;
    }

    if let Err(rejection) = state.auth.check(req.headers()) {
        debug!(request_id, reason = %rejection, "Rejected unauthenticated request");
        return Ok(rejection.into_response());
    }

    if !state.supervisor.is_configured() {
        return Ok(if state.onboarding.is_in_progress() {
            html_response(StatusCode::SERVICE_UNAVAILABLE, SETTING_UP_PAGE)
        } else {
            redirect("/setup")
        });
    }

    if let Err(e) = state.supervisor.ensure_running().await {
        error!(request_id, error = %e, "Gateway not ready");
        return Ok(json_error_response(
            ProxyErrorCode::GatewayUnavailable,
            format!("Gateway not ready: {}", e),
        ));
    }

    let rewrite_control_ui = is_control_ui_request(req.method(), &path);
    let headers = req.headers_mut();
    inject_secret(headers, &state);
    if rewrite_control_ui {
        // The body gets rewritten, so it has to arrive uncompressed
        headers.remove(ACCEPT_ENCODING);
    }

    let request_timeout = state.server.request_timeout();
    let result = tokio::time::timeout(request_timeout, state.pool.send_request(req)).await;

    match result {
        Ok(Ok(response)) if rewrite_control_ui => Ok(rewrite_control_ui_response(response).await),
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(gateway = %state.pool.target(), error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to gateway",
            ))
        }
        Err(_) => {
            warn!(
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Per-request logs surface at INFO when debugging is switched on
fn request_log_level(server: &ServerConfig) -> Level {
    if server.debug {
        Level::INFO
    } else {
        Level::DEBUG
    }
}

/// Replace whatever the client sent with the gateway bearer token
fn inject_secret(headers: &mut HeaderMap, state: &AppState) {
    headers.remove(AUTHORIZATION);
    let bearer = format!("Bearer {}", state.supervisor.secret().expose());
    match HeaderValue::from_str(&bearer) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Err(_) => warn!("Gateway token is not a valid header value"),
    }
}

async fn rewrite_control_ui_response(response: Response<ProxyBody>) -> Response<ProxyBody> {
    if !response.status().is_success() || !is_html(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "Failed to read control UI response");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to read gateway response");
        }
    };

    let html = inject_bootstrap(&String::from_utf8_lossy(&bytes));
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(hyper::header::CONTENT_ENCODING);
    parts.headers.remove(hyper::header::TRANSFER_ENCODING);
    debug!("Injected bootstrap script into control UI");
    Response::from_parts(parts, full(html))
}

fn html_response(status: StatusCode, html: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full(html))
        .expect("valid response builder")
}

fn redirect(location: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(empty())
        .expect("valid response builder")
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Forward bytes bidirectionally between client and gateway connections
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, leftover: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    // Frames the gateway sent right behind its 101 response
    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(request_id, error = %e, "Client went away before forwarding started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend,
                backend_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the gateway
fn build_upgrade_request(req: &Request<Incoming>, target: SocketAddr) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", target));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the gateway's response head; returns the status, headers and head length
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, usize)> {
    let head_len = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let response_str = std::str::from_utf8(&data[..head_len]).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers, head_len))
}

async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_UPGRADE_HEAD {
            return Ok(buf);
        }
    }
}

/// Gate, then forward a protocol upgrade to the gateway.
///
/// Every rejection before the gateway answers closes the client transport
/// instead of producing a response.
async fn handle_upgrade(
    mut req: Request<Incoming>,
    state: &Arc<AppState>,
    request_id: String,
) -> Result<Response<ProxyBody>, UpgradeRejected> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());

    if let Err(rejection) = state.auth.check(req.headers()) {
        warn!(request_id, reason = %rejection, "Closing unauthenticated upgrade");
        return Err(UpgradeRejected("operator credentials missing or invalid"));
    }
    if state.supervisor.secret().is_empty() {
        error!(request_id, "Cannot proxy upgrade: gateway token is empty");
        return Err(UpgradeRejected("gateway token is empty"));
    }
    if !state.supervisor.is_configured() {
        return Err(UpgradeRejected("gateway is not configured"));
    }
    if let Err(e) = state.supervisor.ensure_running().await {
        error!(request_id, error = %e, "Gateway not ready for upgrade");
        return Err(UpgradeRejected("gateway is not ready"));
    }

    inject_secret(req.headers_mut(), state);
    let gateway_addr = state.pool.target();
    debug!(request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, gateway_addr);

    let mut backend_stream = match TcpStream::connect(gateway_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(gateway = %gateway_addr, error = %e, "Failed to connect to gateway for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to gateway: {}", e),
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(error = %e, "Failed to send upgrade request to gateway");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let head = match read_response_head(&mut backend_stream).await {
        Ok(head) if !head.is_empty() => head,
        Ok(_) => {
            error!("Gateway closed connection before responding to upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Gateway closed connection",
            ));
        }
        Err(e) => {
            error!(error = %e, "Failed to read upgrade response from gateway");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read gateway response: {}", e),
            ));
        }
    };

    let (status, response_headers, head_len) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!("Failed to parse gateway upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from gateway",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %status, "Gateway rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response.body(empty()).expect("valid response builder"));
    }

    info!(request_id, upgrade_type, "WebSocket upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response.body(empty()).expect("valid response builder");
    let leftover = head[head_len..].to_vec();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, leftover, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
