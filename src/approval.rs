//! Auto-approval of loopback operator pairing requests.
//!
//! Internal clients of the gateway connect from loopback and identify as
//! operator devices. Nobody is around to approve them in a headless
//! deployment, so this loop does. Requests from anywhere else are left for a
//! human.

use crate::cli::BackendCli;
use crate::config::ApprovalConfig;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LOOPBACK_ADDRS: [&str; 3] = ["127.0.0.1", "::1", "::ffff:127.0.0.1"];

/// Output fragment the tool prints while the gateway is still starting
const NOT_READY_MARKER: &str = "gateway connect failed";

/// Ascending burst delays, then a steady cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalSchedule {
    burst: Vec<Duration>,
    steady: Duration,
}

impl ApprovalSchedule {
    pub fn new(burst: Vec<Duration>, steady: Duration) -> Self {
        Self { burst, steady }
    }

    /// Delay before poll number `tick + 1`; poll 0 runs immediately
    pub fn delay_after(&self, tick: usize) -> Duration {
        self.burst.get(tick).copied().unwrap_or(self.steady)
    }
}

impl From<&ApprovalConfig> for ApprovalSchedule {
    fn from(config: &ApprovalConfig) -> Self {
        Self::new(
            config
                .burst_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            Duration::from_millis(config.steady_interval_ms),
        )
    }
}

fn is_str(value: Option<&str>, expected: &str) -> bool {
    value.map(|v| v.trim().eq_ignore_ascii_case(expected)).unwrap_or(false)
}

/// Request ids that are pending, operator-role and from a loopback address
pub fn select_approvable(listing: &Value) -> Vec<String> {
    let Some(requests) = listing.as_array() else {
        return Vec::new();
    };

    requests
        .iter()
        .filter(|r| is_str(first_str(r, &["status", "state"]), "pending"))
        .filter(|r| is_str(first_str(r, &["role"]), "operator"))
        .filter(|r| {
            first_str(r, &["remote", "remoteAddr", "ip"])
                .map(|addr| LOOPBACK_ADDRS.contains(&addr))
                .unwrap_or(false)
        })
        .filter_map(|r| request_id(r))
        .collect()
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn request_id(value: &Value) -> Option<String> {
    ["requestId", "request_id", "id", "deviceId", "device_id"]
        .iter()
        .find_map(|k| match value.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

struct LoopHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct DeviceApprover {
    cli: BackendCli,
    schedule: ApprovalSchedule,
    running: Mutex<Option<LoopHandle>>,
    /// Listing failures are expected while the gateway boots; log once
    listing_failure_logged: AtomicBool,
}

impl DeviceApprover {
    pub fn new(cli: BackendCli, schedule: ApprovalSchedule) -> Arc<Self> {
        Arc::new(Self {
            cli,
            schedule,
            running: Mutex::new(None),
            listing_failure_logged: AtomicBool::new(false),
        })
    }

    /// List pending requests and approve the eligible ones. Returns the approved ids.
    pub async fn poll_once(&self) -> Vec<String> {
        let listing = self.cli.run(["devices", "list", "--json"]).await;
        if !listing.success() {
            if !listing.output.contains(NOT_READY_MARKER)
                && !self.listing_failure_logged.swap(true, Ordering::Relaxed)
            {
                warn!(code = listing.code, output = %listing.output.trim(), "Listing devices failed");
            }
            return Vec::new();
        }

        let parsed: Value = match serde_json::from_str(listing.output.trim()) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Device listing was not JSON");
                return Vec::new();
            }
        };

        let mut approved = Vec::new();
        for id in select_approvable(&parsed) {
            let result = self.cli.run(["devices", "approve", id.as_str()]).await;
            if result.success() {
                info!(request_id = %id, "Approved loopback operator device");
                approved.push(id);
            } else {
                warn!(request_id = %id, code = result.code, output = %result.output.trim(), "Device approval failed");
            }
        }
        approved
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Start the loop; a no-op while it already runs
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.as_ref().map(|h| !h.task.is_finished()).unwrap_or(false) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run(shutdown_rx).await });
        *running = Some(LoopHandle { shutdown_tx, task });
        debug!("Device approval loop started");
    }

    /// Stop the loop; a no-op when it is not running
    pub fn stop(&self) {
        if let Some(handle) = self.running.lock().take() {
            let _ = handle.shutdown_tx.send(true);
            handle.task.abort();
            debug!("Device approval loop stopped");
        }
    }

    /// Restart so a fresh gateway gets a full burst phase
    pub fn restart(self: &Arc<Self>) {
        self.stop();
        self.start();
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tick = 0usize;
        loop {
            self.poll_once().await;

            let delay = self.schedule.delay_after(tick);
            tick = tick.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for DeviceApprover {
    fn drop(&mut self) {
        if let Some(handle) = self.running.get_mut().take() {
            handle.task.abort();
        }
    }
}
