//! Lifecycle of the single gateway child process.
//!
//! # Usage
//!
//! `Supervisor` lives behind an `Arc`; [`new`](Supervisor::new) returns
//! `Arc<Self>` because start attempts and exit monitors run as spawned tasks.
//!
//! At most one child exists at a time. Concurrent [`ensure_running`]
//! calls share one in-flight start attempt, so N callers produce one spawn
//! and one readiness check sequence.
//!
//! [`ensure_running`]: Supervisor::ensure_running

use crate::backend_config::{BackendConfigFile, GatewaySettings};
use crate::cli::{gateway_env, BackendCli};
use crate::config::GatewayConfig;
use crate::pool::UpstreamPool;
use crate::token::SharedSecret;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bytes of gateway stderr retained for failure logs
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// No process has been started
    Absent,
    /// Spawned, waiting for the readiness check
    Starting,
    /// Answered the readiness check
    Running,
    /// Terminated; a later `ensure_running` spawns a fresh one
    Exited,
}

/// Outcome of a start attempt, shared by every caller awaiting it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("gateway is not configured")]
    NotConfigured,
    #[error("failed to sync gateway configuration: {0}")]
    ConfigSync(String),
    #[error("{0}")]
    TokenMismatch(String),
    #[error("failed to spawn gateway: {0}")]
    Spawn(String),
    #[error("gateway exited during startup: {0}")]
    ExitedDuringStartup(String),
    #[error("gateway did not become ready within {0}ms")]
    ReadyTimeout(u64),
    #[error("start attempt aborted: {0}")]
    Aborted(String),
}

type StartAttempt = Shared<BoxFuture<'static, Result<(), SupervisorError>>>;

#[derive(Debug, Default)]
pub struct SupervisorStats {
    pub spawns: AtomicU64,
    pub readiness_sequences: AtomicU64,
    pub restarts: AtomicU64,
}

impl SupervisorStats {
    pub fn get_spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn get_readiness_sequences(&self) -> u64 {
        self.readiness_sequences.load(Ordering::Relaxed)
    }

    pub fn get_restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

/// Bounded tail of a child's output stream
#[derive(Debug, Clone)]
pub struct OutputTail {
    buf: Arc<Mutex<String>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(String::new())),
            capacity,
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock();
        buf.push_str(line);
        buf.push('\n');
        if buf.len() > self.capacity {
            let mut cut = buf.len() - self.capacity;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.buf.lock().clone()
    }
}

struct ProcessSlot {
    pid: u32,
    generation: u64,
    stop_tx: watch::Sender<bool>,
}

struct Inner {
    state: BackendState,
    process: Option<ProcessSlot>,
    attempt: Option<StartAttempt>,
    next_generation: u64,
}

pub struct Supervisor {
    config: GatewayConfig,
    secret: SharedSecret,
    cli: BackendCli,
    config_file: BackendConfigFile,
    pool: Arc<UpstreamPool>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<BackendState>,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(config: GatewayConfig, secret: SharedSecret, pool: Arc<UpstreamPool>) -> Arc<Self> {
        let cli = BackendCli::new(&config).with_redacted(secret.expose());
        let config_file = BackendConfigFile::new(config.config_path());
        let (state_tx, _) = watch::channel(BackendState::Absent);

        Arc::new(Self {
            config,
            secret,
            cli,
            config_file,
            pool,
            inner: Mutex::new(Inner {
                state: BackendState::Absent,
                process: None,
                attempt: None,
                next_generation: 1,
            }),
            state_tx,
            stats: SupervisorStats::default(),
        })
    }

    pub fn state(&self) -> BackendState {
        self.inner.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().process.as_ref().map(|p| p.pid)
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    pub fn config_file(&self) -> &BackendConfigFile {
        &self.config_file
    }

    pub fn is_configured(&self) -> bool {
        self.config_file.exists()
    }

    /// Return once the gateway answers, starting it if needed.
    ///
    /// Joins the in-flight attempt when one exists. Failures are not retried
    /// here; the next call makes a fresh attempt.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if !self.is_configured() {
            return Err(SupervisorError::NotConfigured);
        }

        let attempt = {
            let mut inner = self.inner.lock();
            if let Some(ref attempt) = inner.attempt {
                debug!("Joining in-flight gateway start");
                attempt.clone()
            } else if inner.state == BackendState::Running {
                return Ok(());
            } else {
                self.begin_attempt(&mut inner, false)
            }
        };

        attempt.await
    }

    /// With `teardown`, the attempt first stops the current gateway, so callers
    /// arriving mid-restart join the fresh start instead of racing it.
    fn begin_attempt(self: &Arc<Self>, inner: &mut Inner, teardown: bool) -> StartAttempt {
        self.set_state(inner, BackendState::Starting);

        // Runs to completion even if every waiter goes away
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = if teardown {
                this.teardown_and_start().await
            } else {
                this.start_and_wait().await
            };
            let mut inner = this.inner.lock();
            inner.attempt = None;
            if result.is_err() && inner.process.is_none() && inner.state == BackendState::Starting {
                this.set_state(&mut inner, BackendState::Absent);
            }
            result
        });

        let attempt = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SupervisorError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        inner.attempt = Some(attempt.clone());
        attempt
    }

    async fn start_and_wait(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let removed = clear_stale_locks(&self.config.state_dir);
        if removed > 0 {
            info!(removed, "Cleared stale session locks");
        }

        self.sync_config()?;

        let (generation, tail) = self.spawn_gateway()?;

        match self.wait_ready(generation, &tail).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                if inner.process.as_ref().map(|p| p.generation) == Some(generation) {
                    self.set_state(&mut inner, BackendState::Running);
                    Ok(())
                } else {
                    Err(SupervisorError::ExitedDuringStartup(tail.snapshot()))
                }
            }
            Err(e) => {
                warn!(error = %e, "Gateway failed to become ready");
                // Kill the unready child so the next attempt starts clean
                self.terminate_generation(generation).await;
                Err(e)
            }
        }
    }

    /// Write the managed keys and verify the token landed
    fn sync_config(&self) -> Result<(), SupervisorError> {
        let settings = GatewaySettings {
            port: self.config.port,
            token: &self.secret,
            workspace: &self.config.workspace_dir,
        };
        self.config_file
            .apply_gateway_settings(&settings)
            .map_err(|e| SupervisorError::ConfigSync(e.to_string()))?;

        self.verify_synced()?;

        match self.config_file.device_auth_disabled() {
            Ok(true) => {}
            Ok(false) => warn!("dangerouslyDisableDeviceAuth did not take effect; internal clients may need pairing"),
            Err(e) => warn!(error = %e, "Could not verify device auth bypass"),
        }

        info!(fingerprint = %self.secret.fingerprint(), "Gateway token synced");
        Ok(())
    }

    /// The persisted token must equal the active secret byte for byte
    fn verify_synced(&self) -> Result<(), SupervisorError> {
        self.config_file.verify_token(&self.secret).map_err(|e| {
            error!(error = %e, "Gateway token verification failed");
            SupervisorError::TokenMismatch(e.to_string())
        })
    }

    fn gateway_args(&self) -> Vec<String> {
        vec![
            self.config.entry.to_string_lossy().into_owned(),
            "gateway".to_string(),
            "run".to_string(),
            "--bind".to_string(),
            "loopback".to_string(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--auth".to_string(),
            "token".to_string(),
            "--token".to_string(),
            self.secret.expose().to_string(),
        ]
    }

    fn spawn_gateway(self: &Arc<Self>) -> Result<(u64, OutputTail), SupervisorError> {
        let args = self.gateway_args();
        info!(command = %self.cli.redact(&self.config.node, &args, &[]), "Starting gateway");

        let mut cmd = Command::new(&self.config.node);
        cmd.args(&args);
        cmd.envs(gateway_env(&self.config));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!(node = %self.config.node, error = %e, "Failed to spawn gateway");
            SupervisorError::Spawn(e.to_string())
        })?;
        let pid = child.id().unwrap_or(0);

        let tail = OutputTail::new(STDERR_TAIL_BYTES);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, None));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Some(tail.clone())));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let generation = {
            let mut inner = self.inner.lock();
            let generation = inner.next_generation;
            inner.next_generation += 1;
            inner.process = Some(ProcessSlot {
                pid,
                generation,
                stop_tx,
            });
            generation
        };
        self.stats.spawns.fetch_add(1, Ordering::Relaxed);
        info!(pid, port = self.config.port, generation, "Gateway process spawned");

        tokio::spawn(Arc::clone(self).monitor(child, generation, stop_rx, tail.clone()));

        Ok((generation, tail))
    }

    /// Try the ready paths in order until one answers or the timeout passes
    async fn wait_ready(&self, generation: u64, tail: &OutputTail) -> Result<(), SupervisorError> {
        self.stats.readiness_sequences.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.ready_timeout();
        let started = Instant::now();

        loop {
            for path in &self.config.ready_paths {
                if !self.is_current(generation) {
                    return Err(SupervisorError::ExitedDuringStartup(tail.snapshot()));
                }
                if self.pool.check_ready(path).await {
                    info!(path = %path, elapsed_ms = started.elapsed().as_millis() as u64, "Gateway ready");
                    return Ok(());
                }
            }
            if started.elapsed() >= timeout {
                return Err(SupervisorError::ReadyTimeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.config.ready_interval()).await;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().process.as_ref().map(|p| p.generation) == Some(generation)
    }

    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        generation: u64,
        mut stop_rx: watch::Receiver<bool>,
        tail: OutputTail,
    ) {
        let (status, requested) = tokio::select! {
            status = child.wait() => (status, false),
            _ = stop_rx.changed() => (self.stop_child(&mut child).await, true),
        };

        match status {
            Ok(status) if status.success() || requested => {
                info!(generation, %status, "Gateway process exited");
            }
            Ok(status) => {
                error!(generation, %status, stderr_tail = %tail.snapshot(), "Gateway process exited unexpectedly");
            }
            Err(e) => {
                error!(generation, error = %e, "Failed to wait for gateway process");
            }
        }

        let mut inner = self.inner.lock();
        if inner.process.as_ref().map(|p| p.generation) == Some(generation) {
            inner.process = None;
            self.set_state(&mut inner, BackendState::Exited);
        }
    }

    async fn stop_child(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to gateway");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                child.kill().await?;
                child.wait().await
            }
        }
    }

    /// Stop the owned child, if any, and wait for it to be reaped
    pub async fn terminate(&self) {
        let slot = {
            let mut inner = self.inner.lock();
            let slot = inner.process.take();
            if slot.is_some() {
                self.set_state(&mut inner, BackendState::Exited);
            }
            slot
        };
        if let Some(slot) = slot {
            self.stop_slot(slot).await;
        }
    }

    async fn terminate_generation(&self, generation: u64) {
        let slot = {
            let mut inner = self.inner.lock();
            if inner.process.as_ref().map(|p| p.generation) != Some(generation) {
                return;
            }
            let slot = inner.process.take();
            self.set_state(&mut inner, BackendState::Exited);
            slot
        };
        if let Some(slot) = slot {
            self.stop_slot(slot).await;
        }
    }

    async fn stop_slot(&self, slot: ProcessSlot) {
        debug!(pid = slot.pid, generation = slot.generation, "Stopping gateway process");
        let _ = slot.stop_tx.send(true);
        let bound = self.config.shutdown_grace_period() + Duration::from_secs(1);
        if tokio::time::timeout(bound, slot.stop_tx.closed()).await.is_err() {
            warn!(pid = slot.pid, "Gateway process did not exit in time");
        }
    }

    /// Stop whatever gateway is running, then start a fresh one.
    ///
    /// Termination problems are logged only; the fresh start decides the
    /// outcome. `ensure_running` calls made meanwhile join that start.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let attempt = loop {
            let pending = {
                let mut inner = self.inner.lock();
                match inner.attempt.clone() {
                    Some(pending) => pending,
                    None => break self.begin_attempt(&mut inner, true),
                }
            };
            debug!("Waiting for in-flight start before restart");
            let _ = pending.await;
        };

        attempt.await
    }

    async fn teardown_and_start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        info!("Restarting gateway");
        self.terminate().await;

        // Gateways left behind by an earlier incarnation of this supervisor
        let pattern = self.config.process_name.as_str();
        let result = self.cli.run_program("pkill", &["-f", pattern]).await;
        match result.code {
            0 => info!(pattern, "Terminated stray gateway processes"),
            1 => debug!(pattern, "No stray gateway processes"),
            code => warn!(pattern, code, output = %result.output.trim(), "pkill failed"),
        }

        tokio::time::sleep(self.config.restart_settle()).await;

        if !self.is_configured() {
            return Err(SupervisorError::NotConfigured);
        }
        {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, BackendState::Starting);
        }
        self.start_and_wait().await
    }

    pub async fn shutdown(&self) {
        info!("Stopping gateway");
        self.terminate().await;
    }

    fn set_state(&self, inner: &mut Inner, state: BackendState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "Gateway state change");
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }
}

async fn forward_lines<R>(reader: R, tail: Option<OutputTail>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match tail {
                Some(ref tail) => {
                    warn!(target: "gateway", "{}", line);
                    tail.push_line(&line);
                }
                None => info!(target: "gateway", "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Gateway output stream closed");
                break;
            }
        }
    }
}

/// Remove `agents/*/sessions/*.lock` under the state directory.
///
/// Best effort: failures are logged and skipped.
pub fn clear_stale_locks(state_dir: &Path) -> usize {
    let agents = match std::fs::read_dir(state_dir.join("agents")) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for agent in agents.flatten() {
        let sessions = match std::fs::read_dir(agent.path().join("sessions")) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in sessions.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale lock"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::path::PathBuf;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(dir: &Path, script: &str) -> GatewayConfig {
        let entry = dir.join("gateway.sh");
        std::fs::write(&entry, script).unwrap();
        GatewayConfig {
            state_dir: dir.join("state"),
            workspace_dir: dir.join("workspace"),
            port: free_port(),
            node: "/bin/sh".to_string(),
            entry,
            process_name: format!("gatewarden-unit-{}", uuid::Uuid::new_v4()),
            ready_timeout_ms: 300,
            ready_interval_ms: 20,
            restart_settle_ms: 10,
            shutdown_grace_period_secs: 1,
            ..Default::default()
        }
    }

    fn supervisor(config: GatewayConfig) -> Arc<Supervisor> {
        let addr = config.socket_addr().unwrap();
        let pool = Arc::new(UpstreamPool::new(addr, PoolConfig::default()));
        Supervisor::new(config, SharedSecret::new("unit-secret"), pool)
    }

    fn mark_configured(config: &GatewayConfig) {
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(config.config_path(), "{}").unwrap();
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let tail = OutputTail::new(16);
        tail.push_line("first line here");
        tail.push_line("second");
        tail.push_line("third");
        let snapshot = tail.snapshot();
        assert!(snapshot.len() <= 16);
        assert!(snapshot.ends_with("third\n"));
        assert!(!snapshot.contains("first"));
    }

    #[test]
    fn test_output_tail_respects_char_boundaries() {
        let tail = OutputTail::new(5);
        tail.push_line("ééééé");
        assert!(tail.snapshot().len() <= 5);
    }

    #[test]
    fn test_clear_stale_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = tmp.path().join("agents/main/sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::write(sessions.join("a.lock"), "").unwrap();
        std::fs::write(sessions.join("b.lock"), "").unwrap();
        std::fs::write(sessions.join("keep.jsonl"), "").unwrap();

        assert_eq!(clear_stale_locks(tmp.path()), 2);
        assert!(sessions.join("keep.jsonl").exists());
        assert_eq!(clear_stale_locks(tmp.path()), 0);
        assert_eq!(clear_stale_locks(&PathBuf::from("/nonexistent/state")), 0);
    }

    #[test]
    fn test_gateway_args_bind_loopback_with_token() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "exit 0\n");
        let port = config.port;
        let sup = supervisor(config);
        let args = sup.gateway_args();
        assert_eq!(&args[1..5], &["gateway", "run", "--bind", "loopback"]);
        assert!(args.contains(&port.to_string()));
        assert_eq!(args.last().map(String::as_str), Some("unit-secret"));
    }

    #[tokio::test]
    async fn test_ensure_running_requires_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(test_config(tmp.path(), "exec sleep 30\n"));
        assert_eq!(sup.ensure_running().await, Err(SupervisorError::NotConfigured));
        assert_eq!(sup.stats().get_spawns(), 0);
        assert_eq!(sup.state(), BackendState::Absent);
    }

    #[tokio::test]
    async fn test_ready_timeout_kills_child() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "exec sleep 30\n");
        mark_configured(&config);
        let sup = supervisor(config.clone());

        let result = sup.ensure_running().await;
        assert_eq!(result, Err(SupervisorError::ReadyTimeout(300)));
        assert_eq!(sup.state(), BackendState::Exited);
        assert_eq!(sup.pid(), None);
        assert_eq!(sup.stats().get_spawns(), 1);

        // Token was synced before the spawn
        let token = BackendConfigFile::new(config.config_path()).gateway_token().unwrap();
        assert_eq!(token.as_deref(), Some("unit-secret"));
    }

    #[tokio::test]
    async fn test_exit_during_startup_reports_stderr_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "echo boom-from-gateway >&2\nexit 2\n");
        mark_configured(&config);
        let sup = supervisor(config);

        match sup.ensure_running().await {
            Err(SupervisorError::ExitedDuringStartup(tail)) => {
                assert!(tail.contains("boom-from-gateway") || tail.is_empty());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(sup.state(), BackendState::Exited);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_state_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path(), "exit 0\n");
        config.node = "/nonexistent/node-binary".to_string();
        mark_configured(&config);
        let sup = supervisor(config);

        assert!(matches!(sup.ensure_running().await, Err(SupervisorError::Spawn(_))));
        assert_eq!(sup.state(), BackendState::Absent);

        // Cleared attempt means the next call retries
        assert!(matches!(sup.ensure_running().await, Err(SupervisorError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_config_sync_failure_aborts_before_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "exec sleep 30\n");
        mark_configured(&config);
        // A directory where the temp file would go makes the write fail
        let sup = supervisor(config.clone());
        std::fs::create_dir_all(config.config_path().with_extension("json.tmp")).unwrap();

        let result = sup.ensure_running().await;
        assert!(matches!(result, Err(SupervisorError::ConfigSync(_))));
        assert_eq!(sup.stats().get_spawns(), 0);
    }

    #[test]
    fn test_foreign_token_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "exec sleep 30\n");
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(
            config.config_path(),
            r#"{"gateway":{"auth":{"mode":"token","token":"someone-else"}}}"#,
        )
        .unwrap();
        let sup = supervisor(config);

        assert!(matches!(sup.verify_synced(), Err(SupervisorError::TokenMismatch(_))));

        // A sync overwrites the foreign token and then verifies
        sup.sync_config().unwrap();
        assert!(sup.verify_synced().is_ok());
    }

    async fn serve_any_http(port: u16) -> tokio::task::JoinHandle<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        })
    }

    #[tokio::test]
    async fn test_callers_during_restart_join_the_fresh_start() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path(), "exec sleep 30\n");
        config.ready_timeout_ms = 3000;
        config.restart_settle_ms = 100;
        mark_configured(&config);
        let server = serve_any_http(config.port).await;
        let sup = supervisor(config);

        sup.ensure_running().await.unwrap();
        assert_eq!(sup.stats().get_spawns(), 1);

        let restart = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.restart().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ne!(sup.state(), BackendState::Running);

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let sup = Arc::clone(&sup);
                tokio::spawn(async move { sup.ensure_running().await })
            })
            .collect();
        for caller in futures::future::join_all(callers).await {
            assert_eq!(caller.unwrap(), Ok(()));
        }
        assert_eq!(restart.await.unwrap(), Ok(()));

        assert_eq!(sup.stats().get_spawns(), 2);
        assert_eq!(sup.stats().get_restarts(), 1);
        assert_eq!(sup.state(), BackendState::Running);

        sup.shutdown().await;
        server.abort();
    }
}
