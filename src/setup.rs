//! Operator-facing setup API under `/setup`.
//!
//! Everything except the health check sits behind the operator password.
//! The Senpi token update skips the password but only answers loopback clients.

use crate::config::{CONFIG_FILE_NAME, MCPORTER_FILE_NAME, TOKEN_FILE_NAME};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::onboarding::{ManualSetup, OnboardingError, PROVIDERS};
use crate::proxy::{full, AppState, ProxyBody};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Largest accepted JSON request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Directory the state and workspace normally live under
const DATA_ROOT: &str = "/data";

/// Helper to create a plain-text response
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

pub async fn handle(req: Request<Incoming>, state: &Arc<AppState>, client_addr: SocketAddr) -> Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();

    debug!(%method, %path, "Setup request");

    if method == Method::GET && path == "/setup/healthz" {
        return json_response(StatusCode::OK, &json!({ "ok": true }));
    }
    if method == Method::POST && path == "/setup/api/senpi-token" {
        return senpi_token(req, state, client_addr).await;
    }

    if let Err(rejection) = state.auth.check(req.headers()) {
        debug!(%path, reason = %rejection, "Rejected setup request");
        return rejection.into_response();
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/setup") => status_page(state),
        (&Method::GET, "/setup/api/status") => status(state).await,
        (&Method::GET, "/setup/api/gateway-token") => gateway_token(state),
        (&Method::POST, "/setup/api/run") => run(req, state).await,
        (&Method::POST, "/setup/api/reset") => reset(state),
        (&Method::POST, "/setup/api/pairing/approve") => approve_pairing(req, state).await,
        (&Method::GET, "/setup/export") => export(state).await,
        (&Method::GET, "/setup/api/debug") => debug_info(state).await,
        _ => json_error_response(ProxyErrorCode::NotFound, "Not Found"),
    }
}

async fn read_json<T>(req: Request<Incoming>) -> Result<T, Response<ProxyBody>>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let bytes = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| json_error_response(ProxyErrorCode::BadRequest, format!("Failed to read body: {}", e)))?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| json_error_response(ProxyErrorCode::BadRequest, format!("Invalid JSON body: {}", e)))
}

fn providers() -> Value {
    Value::Array(
        PROVIDERS
            .iter()
            .map(|(provider, choice)| json!({ "provider": provider, "authChoice": choice }))
            .collect(),
    )
}

fn status_page(state: &AppState) -> Response<ProxyBody> {
    let configured = state.supervisor.is_configured();
    let onboarding = serde_json::to_value(state.onboarding.assess()).unwrap_or(Value::Null);
    let gateway = serde_json::to_value(state.supervisor.state()).unwrap_or(Value::Null);

    let html = format!(
        concat!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Openclaw Setup</title></head>",
            "<body style=\"font-family:system-ui,sans-serif;max-width:40rem;margin:3rem auto\">",
            "<h1>Openclaw Setup</h1>",
            "<ul><li>Configured: {configured}</li><li>Onboarding: {onboarding}</li><li>Gateway: {gateway}</li></ul>",
            "<p>POST a JSON payload to <code>/setup/api/run</code> to onboard manually. ",
            "<a href=\"/setup/api/status\">Status</a> | <a href=\"/setup/export\">Download backup</a></p>",
            "</body></html>"
        ),
        configured = if configured { "yes" } else { "no" },
        onboarding = onboarding.as_str().unwrap_or("unknown"),
        gateway = gateway.as_str().unwrap_or("unknown"),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full(html))
        .expect("valid response with StatusCode enum and static header")
}

async fn status(state: &AppState) -> Response<ProxyBody> {
    let version = state.cli.run(["--version"]).await;
    let channels_help = state.cli.run(["channels", "add", "--help"]).await;

    json_response(
        StatusCode::OK,
        &json!({
            "configured": state.supervisor.is_configured(),
            "gatewayTarget": state.gateway.target(),
            "openclawVersion": version.output.trim(),
            "channelsAddHelp": channels_help.output,
            "onboarding": state.onboarding.assess(),
            "gateway": state.supervisor.state(),
            "providers": providers(),
            "senpiConfigured": state.onboarding.workspace().registry().senpi_token().is_some(),
        }),
    )
}

fn gateway_token(state: &AppState) -> Response<ProxyBody> {
    let mut response = json_response(
        StatusCode::OK,
        &json!({ "token": state.supervisor.secret().expose() }),
    );
    response
        .headers_mut()
        .insert(CACHE_CONTROL, hyper::header::HeaderValue::from_static("no-store"));
    response
}

async fn run(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let payload: ManualSetup = match read_json(req).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    match state.onboarding.run_manual(payload).await {
        Ok(outcome) => {
            let status = if outcome.ok {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            json_response(status, &json!(outcome))
        }
        Err(OnboardingError::AlreadyInProgress) => json_response(
            StatusCode::CONFLICT,
            &json!({ "ok": false, "output": "Onboarding is already in progress. Please wait." }),
        ),
        Err(e) => {
            error!(error = %e, "Manual onboarding failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "ok": false, "output": format!("Internal error: {}", e) }),
            )
        }
    }
}

fn reset(state: &AppState) -> Response<ProxyBody> {
    match state.supervisor.config_file().remove() {
        Ok(_) => {
            info!("Configuration reset via setup API");
            response(StatusCode::OK, "OK - deleted config file. You can rerun setup now.")
        }
        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// 127.0.0.1, ::1 and the IPv4-mapped form of 127.0.0.1
pub fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip == Ipv4Addr::LOCALHOST,
        IpAddr::V6(ip) => ip == Ipv6Addr::LOCALHOST || ip.to_ipv4_mapped() == Some(Ipv4Addr::LOCALHOST),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SenpiTokenUpdate {
    token: Option<Value>,
}

async fn senpi_token(req: Request<Incoming>, state: &AppState, client_addr: SocketAddr) -> Response<ProxyBody> {
    if !is_local(client_addr.ip()) {
        warn!(client = %client_addr, "Rejected Senpi token update from a remote client");
        return json_response(
            StatusCode::FORBIDDEN,
            &json!({ "ok": false, "error": "Localhost only" }),
        );
    }

    let body: SenpiTokenUpdate = match read_json(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(token) = body
        .token
        .as_ref()
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({ "ok": false, "error": "Missing or empty token" }),
        );
    };

    if let Err(e) = state.onboarding.workspace().set_senpi_token(token) {
        error!(error = %e, "Senpi token update failed");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "ok": false, "error": e.to_string() }),
        );
    }

    // Running bridges hold the old token; the next MCP call spawns a fresh one
    let kill = state.cli.run_program("pkill", &["-f", "mcp-remote"]).await;
    info!(code = kill.code, "pkill mcp-remote finished");

    json_response(
        StatusCode::OK,
        &json!({
            "ok": true,
            "message": "Token updated. mcp-remote processes killed; the next MCP call will use the new token.",
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PairingApproval {
    channel: Option<Value>,
    code: Option<Value>,
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn approve_pairing(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let body: PairingApproval = match read_json(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let (Some(channel), Some(code)) = (scalar_string(body.channel.as_ref()), scalar_string(body.code.as_ref())) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({ "ok": false, "error": "Missing channel or code" }),
        );
    };

    let result = state
        .cli
        .run(["pairing".to_string(), "approve".to_string(), channel.clone(), code])
        .await;
    info!(channel = %channel, code = result.code, "Pairing approval requested");

    let status = if result.success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    json_response(status, &json!({ "ok": result.success(), "output": result.output }))
}

/// Working directory and member paths for the backup archive
pub fn export_layout(state_dir: &Path, workspace_dir: &Path) -> (PathBuf, Vec<String>) {
    let root = Path::new(DATA_ROOT);
    match (state_dir.strip_prefix(root), workspace_dir.strip_prefix(root)) {
        (Ok(state), Ok(workspace)) => {
            let member = |p: &Path| {
                if p.as_os_str().is_empty() {
                    ".".to_string()
                } else {
                    p.to_string_lossy().into_owned()
                }
            };
            (root.to_path_buf(), vec![member(state), member(workspace)])
        }
        _ => {
            let member = |p: &Path| p.to_string_lossy().trim_start_matches('/').to_string();
            (PathBuf::from("/"), vec![member(state_dir), member(workspace_dir)])
        }
    }
}

/// Archive member patterns that never leave the machine
pub fn export_exclusions() -> Vec<String> {
    vec![
        "--exclude=*.token".to_string(),
        format!("--exclude={}", TOKEN_FILE_NAME),
        format!("--exclude={}", CONFIG_FILE_NAME),
        format!("--exclude={}.tmp", CONFIG_FILE_NAME),
        format!("--exclude={}", MCPORTER_FILE_NAME),
    ]
}

async fn export(state: &AppState) -> Response<ProxyBody> {
    warn!("Backup export requested (auth passed, sensitive files excluded)");

    for dir in [&state.gateway.state_dir, &state.gateway.workspace_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(path = %dir.display(), error = %e, "Failed to create directory for export");
        }
    }

    let archive = std::env::temp_dir().join(format!("gatewarden-export-{}.tar.gz", uuid::Uuid::new_v4()));
    let archive_arg = archive.to_string_lossy().into_owned();
    let (cwd, members) = export_layout(&state.gateway.state_dir, &state.gateway.workspace_dir);
    let cwd_arg = cwd.to_string_lossy().into_owned();

    let mut args: Vec<String> = vec!["-czf".to_string(), archive_arg];
    args.extend(export_exclusions());
    args.push("-C".to_string());
    args.push(cwd_arg);
    args.extend(members);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let result = state.cli.run_program("tar", &arg_refs).await;
    let bytes = std::fs::read(&archive);
    let _ = std::fs::remove_file(&archive);

    let bytes = match (result.success(), bytes) {
        (true, Ok(bytes)) => bytes,
        (_, Err(e)) => {
            error!(code = result.code, error = %e, output = %result.output.trim(), "Export failed");
            return response(StatusCode::INTERNAL_SERVER_ERROR, format!("Export failed: {}", e));
        }
        (false, Ok(_)) => {
            error!(code = result.code, output = %result.output.trim(), "Export failed");
            return response(StatusCode::INTERNAL_SERVER_ERROR, result.output);
        }
    };

    let filename = format!(
        "openclaw-backup-{}.tar.gz",
        chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ")
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/gzip")
        .header(CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename))
        .body(full(bytes))
        .expect("valid response with StatusCode enum and formatted header")
}

async fn debug_info(state: &AppState) -> Response<ProxyBody> {
    if !state.server.debug {
        return json_error_response(ProxyErrorCode::NotFound, "Not Found");
    }

    let version = state.cli.run(["--version"]).await;
    let help = state.cli.run(["channels", "add", "--help"]).await;
    let stats = state.supervisor.stats();
    let pool_stats = state.pool.stats();

    json_response(
        StatusCode::OK,
        &json!({
            "wrapper": {
                "version": env!("CARGO_PKG_VERSION"),
                "port": state.server.port,
                "stateDir": state.gateway.state_dir,
                "workspaceDir": state.gateway.workspace_dir,
                "configPath": state.gateway.config_path(),
                "gatewayTokenFromEnv": state.gateway.token.is_some(),
                "gatewayTokenPersisted": state.gateway.token_path().exists(),
                "gatewayTokenFingerprint": state.supervisor.secret().fingerprint(),
            },
            "openclaw": {
                "entry": state.gateway.entry,
                "node": state.gateway.node,
                "version": version.output.trim(),
                "channelsAddHelpIncludesTelegram": help.output.contains("telegram"),
            },
            "gateway": {
                "state": state.supervisor.state(),
                "pid": state.supervisor.pid(),
                "spawns": stats.get_spawns(),
                "readinessSequences": stats.get_readiness_sequences(),
                "restarts": stats.get_restarts(),
                "proxiedRequests": pool_stats.get_total_requests(),
            },
            "onboarding": {
                "state": state.onboarding.assess(),
                "lastOutcome": state.onboarding.last_outcome(),
                "fingerprintStored": state.onboarding.stored_fingerprint().is_some(),
            },
        }),
    )
}
