//! Shared fixtures: a scripted stand-in for the gateway tool and a raw TCP
//! backend that plays the gateway's HTTP side.

#![allow(dead_code)]

use gatewarden::config::GatewayConfig;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const CONTROL_UI_HTML: &str = "<html><head><title>Control</title></head><body><input placeholder=\"Gateway token\"></body></html>";

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Temp directory holding the state layout, the fake tool and its call log
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub gateway: GatewayConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("openclaw.sh");
        std::fs::write(&entry, fake_tool_script(dir.path())).unwrap();

        let gateway = GatewayConfig {
            state_dir: dir.path().join("state"),
            workspace_dir: dir.path().join("workspace"),
            port: free_port(),
            node: "/bin/sh".to_string(),
            entry,
            process_name: format!("gatewarden-it-{}", uuid::Uuid::new_v4()),
            ready_timeout_ms: 3000,
            ready_interval_ms: 20,
            restart_settle_ms: 10,
            shutdown_grace_period_secs: 1,
            command_timeout_secs: 10,
            workspace_defaults_dir: dir.path().join("defaults"),
            ..Default::default()
        };
        std::fs::create_dir_all(&gateway.state_dir).unwrap();
        std::fs::create_dir_all(&gateway.workspace_dir).unwrap();

        Self { dir, gateway }
    }

    pub fn calls_path(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    /// Tool invocations whose first argument is `subcommand`
    pub fn calls(&self, subcommand: &str) -> usize {
        std::fs::read_to_string(self.calls_path())
            .unwrap_or_default()
            .lines()
            .filter(|line| line.split_whitespace().next() == Some(subcommand))
            .count()
    }

    /// Drop a marker file the fake tool checks for
    pub fn set_marker(&self, name: &str) {
        std::fs::write(self.dir.path().join(name), "").unwrap();
    }

    pub fn mark_configured(&self) {
        std::fs::write(self.gateway.config_path(), "{}").unwrap();
    }
}

/// Shell stand-in for the gateway tool. `onboard` writes a configuration,
/// `gateway run` idles until signalled. Marker files in the harness
/// directory bend `onboard`: `onboard-slow` delays it, `onboard-no-config`
/// exits cleanly without writing, `onboard-fail` writes then exits 3.
fn fake_tool_script(dir: &Path) -> String {
    let log = dir.join("calls.log");
    format!(
        r#"#!/bin/sh
echo "$*" >> '{log}'
case "$1" in
  onboard)
    if [ -f '{dir}/onboard-slow' ]; then sleep 2; fi
    if [ -f '{dir}/onboard-no-config' ]; then
      echo "onboard skipped"
      exit 0
    fi
    token=""
    while [ $# -gt 0 ]; do
      if [ "$1" = "--gateway-token" ]; then token="$2"; fi
      shift
    done
    mkdir -p "$(dirname "$OPENCLAW_CONFIG_PATH")"
    printf '{{"gateway":{{"auth":{{"mode":"token","token":"%s"}}}}}}' "$token" > "$OPENCLAW_CONFIG_PATH"
    if [ -f '{dir}/onboard-fail' ]; then
      echo "onboard crashed" >&2
      exit 3
    fi
    echo "onboard complete"
    ;;
  gateway)
    exec sleep 30
    ;;
  channels)
    echo "Usage: openclaw channels add --channel <telegram|discord|slack>"
    ;;
  devices)
    echo '[]'
    ;;
  --version)
    echo "2026.1.0"
    ;;
  *)
    echo "ok"
    ;;
esac
"#,
        log = log.display(),
        dir = dir.display()
    )
}

/// Minimal HTTP/1.1 server on the gateway port recording every request head
pub struct MockGateway {
    pub requests: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockGateway {
    pub async fn start(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve_one(stream, recorded).await;
                });
            }
        });

        Self { requests, task }
    }

    /// Recorded request heads for `path`, excluding readiness checks
    pub fn heads_for(&self, path: &str) -> Vec<String> {
        let prefix = format!("GET {} ", path);
        self.requests
            .lock()
            .iter()
            .filter(|head| head.starts_with(&prefix) && head.to_ascii_lowercase().contains("x-request-id"))
            .cloned()
            .collect()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(mut stream: TcpStream, recorded: Arc<Mutex<Vec<String>>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf).to_string();
    recorded.lock().push(head.clone());

    if head.to_ascii_lowercase().contains("upgrade: websocket") {
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await?;
        // Echo until the peer hangs up
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&chunk[..n]).await?;
        }
    }

    let path = head.split_whitespace().nth(1).unwrap_or("/");
    let (content_type, body) = if path == "/" {
        ("text/html; charset=utf-8", CONTROL_UI_HTML)
    } else {
        ("application/json", "{\"ok\":true}")
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Send a raw HTTP/1.1 request and return the whole response text
pub async fn http_request(port: u16, method: &str, path: &str, headers: &[(&str, &str)]) -> String {
    http_request_with_body(port, method, path, headers, "").await
}

pub async fn http_request_with_body(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = format!("{} {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n", method, path, port);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), stream.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    String::from_utf8_lossy(&response).to_string()
}

pub fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}
