//! Runs the gateway's own command-line tool and auxiliary system programs

use crate::config::GatewayConfig;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported when the program could not be spawned
pub const SPAWN_FAILED: i32 = 127;
/// Exit code reported when the program exceeded its time budget
pub const TIMED_OUT: i32 = 124;

const REDACTED: &str = "<redacted>";

/// Exit code plus combined stdout and stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Invokes `<node> <entry> <args...>` with the state layout exported.
///
/// Failures never surface as `Err`: a spawn failure is exit code 127 and a
/// timeout is 124, each with the reason appended to the output.
#[derive(Clone)]
pub struct BackendCli {
    node: String,
    entry: PathBuf,
    env: Vec<(String, OsString)>,
    timeout: Duration,
    redactions: Vec<String>,
}

impl BackendCli {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            node: config.node.clone(),
            entry: config.entry.clone(),
            env: gateway_env(config),
            timeout: config.command_timeout(),
            redactions: Vec::new(),
        }
    }

    /// Register a value that must never appear in logged command lines
    pub fn with_redacted(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.redactions.push(secret);
        }
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn entry(&self) -> &PathBuf {
        &self.entry
    }

    /// Run a subcommand of the gateway's tool
    pub async fn run<I, S>(&self, args: I) -> CommandOutput
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_redacting(args, &[]).await
    }

    /// Like [`run`](Self::run), with extra per-call secrets redacted from logs
    pub async fn run_redacting<I, S>(&self, args: I, extra_secrets: &[&str]) -> CommandOutput
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full_args = vec![self.entry.to_string_lossy().into_owned()];
        full_args.extend(args.into_iter().map(Into::into));

        debug!(command = %self.redact(&self.node, &full_args, extra_secrets), "Running gateway command");

        let mut cmd = Command::new(&self.node);
        cmd.args(&full_args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        execute(cmd, self.timeout).await
    }

    /// Run an unrelated program such as `pkill` or `tar`
    pub async fn run_program(&self, program: &str, args: &[&str]) -> CommandOutput {
        debug!(command = %shell_words::join(std::iter::once(program).chain(args.iter().copied())), "Running program");
        let mut cmd = Command::new(program);
        cmd.args(args);
        execute(cmd, self.timeout).await
    }

    /// Shell-quoted command line with every registered secret replaced
    pub fn redact(&self, program: &str, args: &[String], extra_secrets: &[&str]) -> String {
        let line = shell_words::join(
            std::iter::once(program).chain(args.iter().map(String::as_str)),
        );
        self.redactions
            .iter()
            .map(String::as_str)
            .chain(extra_secrets.iter().copied())
            .filter(|s| !s.is_empty())
            .fold(line, |acc, secret| acc.replace(secret, REDACTED))
    }
}

/// Variables every gateway-tool invocation and the gateway itself receive
pub fn gateway_env(config: &GatewayConfig) -> Vec<(String, OsString)> {
    vec![
        ("OPENCLAW_STATE_DIR".to_string(), config.state_dir.clone().into_os_string()),
        ("OPENCLAW_WORKSPACE_DIR".to_string(), config.workspace_dir.clone().into_os_string()),
        ("OPENCLAW_CONFIG_PATH".to_string(), config.config_path().into_os_string()),
    ]
}

async fn execute(mut cmd: Command, timeout: Duration) -> CommandOutput {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to spawn command");
            return CommandOutput {
                code: SPAWN_FAILED,
                output: format!("[spawn error] {}\n", e),
            };
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandOutput {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            }
        }
        Ok(Err(e)) => CommandOutput {
            code: SPAWN_FAILED,
            output: format!("[wait error] {}\n", e),
        },
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Command timed out");
            CommandOutput {
                code: TIMED_OUT,
                output: format!("[timeout] command exceeded {}s\n", timeout.as_secs()),
            }
        }
    }
}
