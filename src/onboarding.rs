//! One-shot onboarding of the gateway from environment inputs.
//!
//! # States
//!
//! [`Onboarding::assess`] classifies the current situation:
//!
//! - `NotNeeded`: configured, and the inputs match the last automatic run
//! - `ConfiguredButDrifted`: configured, but the inputs changed since then
//! - `Eligible`: not configured, and the inputs name a supported provider
//! - `InProgress`: a run is executing
//! - `Failed`: the last run failed; manual setup is still available
//! - `AwaitingManualSetup`: not configured and nothing to onboard from
//!
//! A run that succeeds reports `Done`; afterwards the system assesses as
//! `NotNeeded`. Only one run may execute at a time, a second trigger is
//! rejected with [`OnboardingError::AlreadyInProgress`].

use crate::backend_config::{
    BackendConfigError, DiscordChannel, GatewaySettings, SlackChannel, TelegramChannel,
};
use crate::cli::{BackendCli, CommandOutput};
use crate::config::{GatewayConfig, OnboardingConfig};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::telegram::TelegramResolver;
use crate::workspace::{Workspace, WorkspaceError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Provider name to the setup tool's auth choice
pub const PROVIDERS: &[(&str, &str)] = &[
    ("anthropic", "apiKey"),
    ("openai", "openai-api-key"),
    ("openrouter", "openrouter-api-key"),
    ("gemini", "gemini-api-key"),
    ("google", "gemini-api-key"),
    ("ai-gateway", "ai-gateway-api-key"),
    ("moonshot", "moonshot-api-key"),
    ("kimi-code", "kimi-code-api-key"),
    ("zai", "zai-api-key"),
    ("minimax", "minimax-api"),
    ("synthetic", "synthetic-api-key"),
    ("opencode-zen", "opencode-zen"),
];

pub fn auth_choice_for(provider: &str) -> Option<&'static str> {
    PROVIDERS
        .iter()
        .find(|(name, _)| *name == provider)
        .map(|(_, choice)| *choice)
}

fn secret_flag(auth_choice: &str) -> Option<&'static str> {
    Some(match auth_choice {
        "openai-api-key" => "--openai-api-key",
        "apiKey" => "--anthropic-api-key",
        "openrouter-api-key" => "--openrouter-api-key",
        "ai-gateway-api-key" => "--ai-gateway-api-key",
        "moonshot-api-key" => "--moonshot-api-key",
        "kimi-code-api-key" => "--kimi-code-api-key",
        "gemini-api-key" => "--gemini-api-key",
        "zai-api-key" => "--zai-api-key",
        "minimax-api" | "minimax-api-lightning" => "--minimax-api-key",
        "synthetic-api-key" => "--synthetic-api-key",
        "opencode-zen" => "--opencode-zen-api-key",
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingState {
    NotNeeded,
    Eligible,
    InProgress,
    Done,
    Failed,
    ConfiguredButDrifted,
    AwaitingManualSetup,
}

#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("onboarding is already in progress")]
    AlreadyInProgress,
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("setup tool exited with code {0}")]
    SetupFailed(i32),
    #[error("setup tool exited successfully but wrote no configuration")]
    NoConfiguration,
    #[error(transparent)]
    Config(#[from] BackendConfigError),
    #[error("gateway restart failed: {0}")]
    Gateway(#[from] SupervisorError),
    #[error("workspace bootstrap failed: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Arguments for one non-interactive setup invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnboardRequest {
    pub flow: Option<String>,
    pub auth_choice: Option<String>,
    pub auth_secret: Option<String>,
}

/// Body of a manual setup request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManualSetup {
    pub flow: Option<String>,
    pub auth_choice: Option<String>,
    pub auth_secret: Option<String>,
    pub telegram_token: Option<String>,
    pub discord_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub ok: bool,
    pub output: String,
}

pub fn build_onboard_args(request: &OnboardRequest, workspace: &Path, port: u16, token: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "onboard",
        "--non-interactive",
        "--accept-risk",
        "--json",
        "--no-install-daemon",
        "--skip-health",
        "--workspace",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(workspace.to_string_lossy().into_owned());
    args.extend(["--gateway-bind", "loopback", "--gateway-port"].map(String::from));
    args.push(port.to_string());
    args.extend(["--gateway-auth", "token", "--gateway-token"].map(String::from));
    args.push(token.to_string());
    args.push("--flow".to_string());
    args.push(
        request
            .flow
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or("quickstart")
            .to_string(),
    );

    if let Some(choice) = request.auth_choice.as_deref().filter(|c| !c.is_empty()) {
        args.push("--auth-choice".to_string());
        args.push(choice.to_string());

        let secret = request.auth_secret.as_deref().map(str::trim).unwrap_or("");
        if !secret.is_empty() {
            if let Some(flag) = secret_flag(choice) {
                args.push(flag.to_string());
                args.push(secret.to_string());
            }
            if choice == "token" {
                args.extend(["--token-provider", "anthropic", "--token"].map(String::from));
                args.push(secret.to_string());
            }
        }
    }

    args
}

/// Field order is part of the persisted format
#[derive(Serialize)]
struct FingerprintInputs<'a> {
    #[serde(rename = "AI_PROVIDER")]
    ai_provider: &'a str,
    #[serde(rename = "AI_API_KEY")]
    ai_api_key: &'a str,
    #[serde(rename = "TELEGRAM_BOT_TOKEN")]
    telegram_bot_token: &'a str,
    #[serde(rename = "TELEGRAM_USERNAME")]
    telegram_username: &'a str,
    #[serde(rename = "SENPI_AUTH_TOKEN")]
    senpi_auth_token: &'a str,
}

/// SHA-256 over the onboarding-relevant inputs, hex encoded
pub fn env_fingerprint(inputs: &OnboardingConfig) -> String {
    let payload = FingerprintInputs {
        ai_provider: inputs.ai_provider.as_deref().unwrap_or(""),
        ai_api_key: inputs.ai_api_key.as_deref().unwrap_or(""),
        telegram_bot_token: inputs.telegram_bot_token.as_deref().unwrap_or(""),
        telegram_username: inputs.telegram_username.as_deref().unwrap_or(""),
        senpi_auth_token: inputs.senpi_auth_token.as_deref().unwrap_or(""),
    };
    let json = serde_json::to_string(&payload).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

/// Channels to configure after a successful setup run
#[derive(Debug, Default)]
struct ChannelPlan {
    telegram: Option<TelegramChannel>,
    discord: Option<DiscordChannel>,
    slack: Option<SlackChannel>,
}

impl ChannelPlan {
    fn is_empty(&self) -> bool {
        self.telegram.is_none() && self.discord.is_none() && self.slack.is_none()
    }
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Clears the in-progress flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Onboarding {
    gateway: GatewayConfig,
    inputs: OnboardingConfig,
    supervisor: Arc<Supervisor>,
    cli: BackendCli,
    workspace: Workspace,
    in_progress: AtomicBool,
    last_outcome: Mutex<Option<OnboardingState>>,
}

impl Onboarding {
    pub fn new(gateway: GatewayConfig, inputs: OnboardingConfig, supervisor: Arc<Supervisor>) -> Arc<Self> {
        let mut cli = BackendCli::new(&gateway).with_redacted(supervisor.secret().expose());
        if let Some(key) = inputs.ai_api_key.as_deref() {
            cli = cli.with_redacted(key);
        }
        let workspace = Workspace::new(&gateway, inputs.senpi_auth_token.clone());

        Arc::new(Self {
            gateway,
            inputs,
            supervisor,
            cli,
            workspace,
            in_progress: AtomicBool::new(false),
            last_outcome: Mutex::new(None),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn last_outcome(&self) -> Option<OnboardingState> {
        *self.last_outcome.lock()
    }

    pub fn fingerprint(&self) -> String {
        env_fingerprint(&self.inputs)
    }

    pub fn stored_fingerprint(&self) -> Option<String> {
        std::fs::read_to_string(self.gateway.fingerprint_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn has_drifted(&self) -> bool {
        self.stored_fingerprint()
            .map(|stored| stored != self.fingerprint())
            .unwrap_or(false)
    }

    /// Auth choice for unattended onboarding, when the inputs allow one
    pub fn auto_auth_choice(&self) -> Option<&'static str> {
        let provider = trimmed(&self.inputs.ai_provider)?;
        trimmed(&self.inputs.ai_api_key)?;
        auth_choice_for(provider)
    }

    pub fn assess(&self) -> OnboardingState {
        if self.is_in_progress() {
            return OnboardingState::InProgress;
        }
        if self.supervisor.is_configured() {
            return if self.has_drifted() {
                OnboardingState::ConfiguredButDrifted
            } else {
                OnboardingState::NotNeeded
            };
        }
        // Failed runs are not retried automatically
        if self.last_outcome() == Some(OnboardingState::Failed) {
            OnboardingState::Failed
        } else if self.auto_auth_choice().is_some() {
            OnboardingState::Eligible
        } else {
            OnboardingState::AwaitingManualSetup
        }
    }

    fn begin(&self) -> Result<RunGuard<'_>, OnboardingError> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| RunGuard(&self.in_progress))
            .map_err(|_| OnboardingError::AlreadyInProgress)
    }

    /// Remove the gateway configuration and the stored fingerprint
    pub fn discard_configuration(&self) -> Result<(), OnboardingError> {
        self.supervisor.config_file().remove()?;
        let path = self.gateway.fingerprint_path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(OnboardingError::Io { path, source }),
        }
    }

    /// Onboard from the environment inputs.
    ///
    /// Drifted configuration is discarded first. Failures come back as
    /// `Ok(Failed)` after being logged.
    pub async fn run_auto(&self) -> Result<OnboardingState, OnboardingError> {
        let _guard = self.begin()?;

        if self.supervisor.is_configured() {
            if !self.has_drifted() {
                return Ok(OnboardingState::NotNeeded);
            }
            info!("Onboarding inputs changed since the last run, re-onboarding");
            if let Err(e) = self.discard_configuration() {
                error!(error = %e, "Failed to discard drifted configuration");
                return Ok(self.record(OnboardingState::Failed));
            }
        }

        let Some(choice) = self.auto_auth_choice() else {
            if self.inputs.ai_provider.is_some() || self.inputs.ai_api_key.is_some() {
                warn!(
                    provider = self.inputs.ai_provider.as_deref().unwrap_or(""),
                    "Cannot auto-onboard: provider or API key missing or unsupported"
                );
            }
            return Ok(OnboardingState::AwaitingManualSetup);
        };

        info!(
            provider = self.inputs.ai_provider.as_deref().unwrap_or(""),
            telegram = self.inputs.telegram_bot_token.is_some(),
            "Auto-onboarding started"
        );

        let request = OnboardRequest {
            flow: None,
            auth_choice: Some(choice.to_string()),
            auth_secret: self.inputs.ai_api_key.clone(),
        };
        let plan = ChannelPlan {
            telegram: trimmed(&self.inputs.telegram_bot_token).map(|token| {
                TelegramChannel::allowlist(token, trimmed(&self.inputs.telegram_user_id))
            }),
            ..Default::default()
        };
        let resolve_user = self.inputs.telegram_bot_token.is_some() && self.inputs.telegram_username.is_some();

        let outcome = self.execute(&request, &plan, resolve_user).await;
        if !outcome.ok {
            error!("Auto-onboarding failed; visit /setup to configure manually");
            return Ok(self.record(OnboardingState::Failed));
        }

        self.persist_fingerprint();
        info!("Auto-onboarding complete");
        Ok(self.record(OnboardingState::Done))
    }

    /// Onboard from a setup request body
    pub async fn run_manual(&self, payload: ManualSetup) -> Result<RunOutcome, OnboardingError> {
        let _guard = self.begin()?;

        if self.supervisor.is_configured() {
            return Ok(match self.supervisor.ensure_running().await {
                Ok(()) => RunOutcome {
                    ok: true,
                    output: "Already configured.\nUse Reset setup if you want to rerun onboarding.\n".to_string(),
                },
                Err(e) => RunOutcome {
                    ok: false,
                    output: format!("Already configured, but the gateway did not start: {e}\n"),
                },
            });
        }

        let request = OnboardRequest {
            flow: trimmed(&payload.flow).map(str::to_string),
            auth_choice: trimmed(&payload.auth_choice).map(str::to_string),
            auth_secret: trimmed(&payload.auth_secret).map(str::to_string),
        };
        let slack_bot = trimmed(&payload.slack_bot_token).map(str::to_string);
        let slack_app = trimmed(&payload.slack_app_token).map(str::to_string);
        let plan = ChannelPlan {
            telegram: trimmed(&payload.telegram_token).map(TelegramChannel::pairing),
            discord: trimmed(&payload.discord_token).map(DiscordChannel::pairing),
            slack: (slack_bot.is_some() || slack_app.is_some()).then(|| SlackChannel {
                enabled: true,
                bot_token: slack_bot,
                app_token: slack_app,
            }),
        };
        let resolve_user = self.inputs.telegram_bot_token.is_some();

        let outcome = self.execute(&request, &plan, resolve_user).await;
        self.record(if outcome.ok {
            OnboardingState::Done
        } else {
            OnboardingState::Failed
        });
        Ok(outcome)
    }

    /// Decide what to do with the persisted state at process start
    pub async fn reconcile_on_startup(&self) -> OnboardingState {
        match self.assess() {
            OnboardingState::ConfiguredButDrifted | OnboardingState::Eligible => {
                match self.run_auto().await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(error = %e, "Startup onboarding skipped");
                        OnboardingState::InProgress
                    }
                }
            }
            OnboardingState::NotNeeded => {
                info!("Already configured, starting gateway");
                if let Err(e) = self.workspace.bootstrap() {
                    warn!(error = %e, "Workspace bootstrap failed (non-fatal)");
                }
                if let Err(e) = self.supervisor.restart().await {
                    error!(error = %e, "Gateway startup failed");
                }
                OnboardingState::NotNeeded
            }
            state => {
                info!("Not configured; waiting for manual setup at /setup");
                state
            }
        }
    }

    fn record(&self, state: OnboardingState) -> OnboardingState {
        *self.last_outcome.lock() = Some(state);
        state
    }

    fn persist_fingerprint(&self) {
        let path = self.gateway.fingerprint_path();
        match std::fs::write(&path, self.fingerprint()) {
            Ok(()) => info!(path = %path.display(), "Stored onboarding fingerprint"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not write onboarding fingerprint"),
        }
    }

    /// Run the setup tool and finish the configuration. A failed run leaves no
    /// configuration behind.
    async fn execute(&self, request: &OnboardRequest, plan: &ChannelPlan, resolve_user: bool) -> RunOutcome {
        let mut output = String::new();
        let result = self.try_execute(request, plan, resolve_user, &mut output).await;

        match result {
            Ok(()) => RunOutcome { ok: true, output },
            Err(e) => {
                error!(error = %e, "Onboarding failed");
                output.push_str(&format!("\n[error] {e}\n"));
                if let Err(cleanup) = self.supervisor.config_file().remove() {
                    warn!(error = %cleanup, "Failed to remove partial configuration");
                }
                RunOutcome { ok: false, output }
            }
        }
    }

    async fn try_execute(
        &self,
        request: &OnboardRequest,
        plan: &ChannelPlan,
        resolve_user: bool,
        output: &mut String,
    ) -> Result<(), OnboardingError> {
        for dir in [&self.gateway.state_dir, &self.gateway.workspace_dir] {
            std::fs::create_dir_all(dir).map_err(|source| OnboardingError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let secret = self.supervisor.secret();
        let args = build_onboard_args(request, &self.gateway.workspace_dir, self.gateway.port, secret.expose());
        let extra = request.auth_secret.as_deref().unwrap_or("");
        info!(
            flow = request.flow.as_deref().unwrap_or("quickstart"),
            auth_choice = request.auth_choice.as_deref().unwrap_or("none"),
            fingerprint = %secret.fingerprint(),
            "Running onboarding"
        );

        let onboard = self.cli.run_redacting(args, &[extra]).await;
        output.push_str(&onboard.output);
        self.check_onboard_result(&onboard)?;

        let config_file = self.supervisor.config_file();
        if config_file.gateway_token()?.as_deref() != Some(secret.expose()) {
            warn!("Setup tool wrote a different gateway token; overriding");
        }
        config_file.apply_gateway_settings(&GatewaySettings {
            port: self.gateway.port,
            token: secret,
            workspace: &self.gateway.workspace_dir,
        })?;
        config_file.verify_token(secret)?;
        output.push_str("\n[onboard] gateway token synced\n");

        self.configure_channels(plan, output).await?;

        let doctor = self.cli.run(["doctor", "--fix"]).await;
        info!(code = doctor.code, "doctor --fix finished");
        output.push_str(&format!("\n[doctor] exit={}\n", doctor.code));

        if resolve_user {
            if let Some(token) = trimmed(&self.inputs.telegram_bot_token) {
                TelegramResolver::new(
                    token,
                    trimmed(&self.inputs.telegram_username),
                    &self.gateway.workspace_dir,
                )
                .resolve_and_write()
                .await;
            }
        }

        self.workspace.bootstrap()?;
        output.push_str("\n[bootstrap] workspace ready\n");

        self.supervisor.restart().await?;
        output.push_str("\n[gateway] started\n");
        Ok(())
    }

    fn check_onboard_result(&self, onboard: &CommandOutput) -> Result<(), OnboardingError> {
        let configured = self.supervisor.is_configured();
        match (onboard.success(), configured) {
            (true, true) => Ok(()),
            (true, false) => Err(OnboardingError::NoConfiguration),
            (false, _) => {
                if configured {
                    warn!(code = onboard.code, "Setup tool failed but left a configuration; discarding it");
                }
                Err(OnboardingError::SetupFailed(onboard.code))
            }
        }
    }

    async fn configure_channels(&self, plan: &ChannelPlan, output: &mut String) -> Result<(), OnboardingError> {
        if plan.is_empty() {
            return Ok(());
        }

        let help = self.cli.run(["channels", "add", "--help"]).await.output;
        let config_file = self.supervisor.config_file();

        if let Some(ref channel) = plan.telegram {
            if help.contains("telegram") {
                config_file.set_telegram(channel)?;
                info!(dm_policy = %channel.dm_policy, "Telegram channel configured");
                output.push_str("\n[telegram] configured\n");
            } else {
                info!("Telegram not supported by this gateway build, skipping");
                output.push_str("\n[telegram] skipped (not listed in `channels add --help`)\n");
            }
        }
        if let Some(ref channel) = plan.discord {
            if help.contains("discord") {
                config_file.set_discord(channel)?;
                output.push_str("\n[discord] configured\n");
            } else {
                output.push_str("\n[discord] skipped (not listed in `channels add --help`)\n");
            }
        }
        if let Some(ref channel) = plan.slack {
            if help.contains("slack") {
                config_file.set_slack(channel)?;
                output.push_str("\n[slack] configured\n");
            } else {
                output.push_str("\n[slack] skipped (not listed in `channels add --help`)\n");
            }
        }
        Ok(())
    }
}
