use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names inside the state directory
pub const CONFIG_FILE_NAME: &str = "openclaw.json";
pub const TOKEN_FILE_NAME: &str = "gateway.token";
pub const FINGERPRINT_FILE_NAME: &str = ".auto-onboard-env.fingerprint";
pub const MCPORTER_FILE_NAME: &str = "mcporter.json";

/// Top-level configuration.
///
/// Loaded from an optional TOML file and then overridden from the
/// environment, which is the primary interface in container deployments.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub onboarding: OnboardingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public listen port (env: PORT)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Operator password for the setup and proxy surfaces (env: SETUP_PASSWORD).
    /// When unset every gated request is answered with a 500.
    pub setup_password: Option<String>,

    /// Verbose request logging and the debug endpoint (env: OPENCLAW_TEMPLATE_DEBUG)
    #[serde(default)]
    pub debug: bool,

    /// Upper bound for a single proxied HTTP exchange
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            setup_password: None,
            debug: false,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Settings for the supervised gateway process and its command-line tool
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Defaults to `<state_dir>/openclaw.json`
    pub config_path: Option<PathBuf>,

    #[serde(default = "default_gateway_host")]
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Script passed as the first argument to `node`
    #[serde(default = "default_entry")]
    pub entry: PathBuf,

    #[serde(default = "default_node")]
    pub node: String,

    /// Pattern used with `pkill -f` to reap gateways left by an earlier incarnation
    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Explicit shared secret (env: OPENCLAW_GATEWAY_TOKEN)
    pub token: Option<String>,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,

    /// Tried in order on every readiness tick
    #[serde(default = "default_ready_paths")]
    pub ready_paths: Vec<String>,

    /// Pause between terminating old gateways and starting a new one
    #[serde(default = "default_restart_settle")]
    pub restart_settle_ms: u64,

    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Upper bound for one invocation of the gateway's command-line tool
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// MCP server registry read by the gateway (env: MCPORTER_CONFIG).
    /// Defaults to `<state_dir>/config/mcporter.json`
    pub mcporter_path: Option<PathBuf>,

    /// Remote MCP endpoint for the Senpi server (env: SENPI_MCP_URL)
    #[serde(default = "default_senpi_mcp_url")]
    pub senpi_mcp_url: String,

    /// Image-provided files copied into the workspace on startup
    #[serde(default = "default_workspace_defaults_dir")]
    pub workspace_defaults_dir: PathBuf,

    /// Home of the user the agent runs as (env: HOME); holds `.config/senpi`
    pub home_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workspace_dir: default_workspace_dir(),
            config_path: None,
            host: default_gateway_host(),
            port: default_gateway_port(),
            entry: default_entry(),
            node: default_node(),
            process_name: default_process_name(),
            token: None,
            ready_timeout_ms: default_ready_timeout(),
            ready_interval_ms: default_ready_interval(),
            ready_paths: default_ready_paths(),
            restart_settle_ms: default_restart_settle(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            command_timeout_secs: default_command_timeout(),
            mcporter_path: None,
            senpi_mcp_url: default_senpi_mcp_url(),
            workspace_defaults_dir: default_workspace_defaults_dir(),
            home_dir: None,
        }
    }
}

impl GatewayConfig {
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join(CONFIG_FILE_NAME))
    }

    pub fn token_path(&self) -> PathBuf {
        self.state_dir.join(TOKEN_FILE_NAME)
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.state_dir.join(FINGERPRINT_FILE_NAME)
    }

    pub fn mcporter_path(&self) -> PathBuf {
        self.mcporter_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("config").join(MCPORTER_FILE_NAME))
    }

    /// Address the proxy and readiness check connect to
    pub fn target(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid gateway host '{}': {}", self.host, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Delay table for the device approval loop
#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    #[serde(default = "default_burst_delays")]
    pub burst_delays_ms: Vec<u64>,

    #[serde(default = "default_steady_interval")]
    pub steady_interval_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            burst_delays_ms: default_burst_delays(),
            steady_interval_ms: default_steady_interval(),
        }
    }
}

/// Inputs that drive unattended onboarding. All of them feed the drift fingerprint.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct OnboardingConfig {
    /// Lowercased provider name (env: AI_PROVIDER)
    pub ai_provider: Option<String>,
    /// Provider credential with any `Bearer ` prefix removed (env: AI_API_KEY)
    pub ai_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_username: Option<String>,
    /// Numeric Telegram user id for the DM allow-list
    pub telegram_user_id: Option<String>,
    pub senpi_auth_token: Option<String>,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/data/.openclaw")
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/data/workspace")
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_entry() -> PathBuf {
    PathBuf::from("/openclaw/dist/entry.js")
}

fn default_node() -> String {
    "node".to_string()
}

fn default_process_name() -> String {
    "openclaw-gateway".to_string()
}

fn default_ready_timeout() -> u64 {
    20_000
}

fn default_ready_interval() -> u64 {
    250
}

fn default_ready_paths() -> Vec<String> {
    vec!["/openclaw".to_string(), "/".to_string(), "/health".to_string()]
}

fn default_restart_settle() -> u64 {
    1500
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    300
}

fn default_senpi_mcp_url() -> String {
    "https://mcp.dev.senpi.ai/mcp".to_string()
}

fn default_workspace_defaults_dir() -> PathBuf {
    PathBuf::from("/opt/workspace-defaults")
}

fn default_burst_delays() -> Vec<u64> {
    vec![3000, 3000, 4000, 5000, 5000, 10_000, 15_000, 15_000]
}

fn default_steady_interval() -> u64 {
    60_000
}

/// Trimmed, non-empty value or nothing
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Remove a leading `Bearer ` some users paste along with API keys
pub fn strip_bearer(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(port) = get("PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        if let Some(password) = get("SETUP_PASSWORD") {
            self.server.setup_password = Some(password);
        }
        if let Some(debug) = get("OPENCLAW_TEMPLATE_DEBUG") {
            self.server.debug = parse_bool(&debug);
        }

        if let Some(dir) = get("OPENCLAW_STATE_DIR") {
            self.gateway.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("OPENCLAW_WORKSPACE_DIR") {
            self.gateway.workspace_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("OPENCLAW_CONFIG_PATH") {
            self.gateway.config_path = Some(PathBuf::from(path));
        }
        if let Some(host) = get("INTERNAL_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("INTERNAL_GATEWAY_PORT") {
            self.gateway.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid INTERNAL_GATEWAY_PORT '{}': {}", port, e))?;
        }
        if let Some(timeout) = get("GATEWAY_READY_TIMEOUT_MS") {
            self.gateway.ready_timeout_ms = timeout.parse().map_err(|e| {
                anyhow::anyhow!("Invalid GATEWAY_READY_TIMEOUT_MS '{}': {}", timeout, e)
            })?;
        }
        if let Some(entry) = get("OPENCLAW_ENTRY") {
            self.gateway.entry = PathBuf::from(entry);
        }
        if let Some(node) = get("OPENCLAW_NODE") {
            self.gateway.node = node;
        }
        if let Some(token) = get("OPENCLAW_GATEWAY_TOKEN") {
            self.gateway.token = Some(token);
        }

        if let Some(provider) = get("AI_PROVIDER") {
            self.onboarding.ai_provider = Some(provider.to_ascii_lowercase());
        }
        if let Some(key) = get("AI_API_KEY") {
            self.onboarding.ai_api_key = non_empty(Some(strip_bearer(&key)));
        }
        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.onboarding.telegram_bot_token = Some(token);
        }
        if let Some(username) = get("TELEGRAM_USERNAME") {
            self.onboarding.telegram_username = Some(username);
        }
        if let Some(id) = get("TELEGRAM_USER_ID") {
            self.onboarding.telegram_user_id = Some(id);
        }
        if let Some(token) = get("SENPI_AUTH_TOKEN") {
            self.onboarding.senpi_auth_token = Some(token);
        }
        if let Some(path) = get("MCPORTER_CONFIG") {
            self.gateway.mcporter_path = Some(PathBuf::from(path));
        }
        if let Some(url) = get("SENPI_MCP_URL") {
            self.gateway.senpi_mcp_url = url;
        }
        if let Some(home) = get("HOME") {
            self.gateway.home_dir = Some(PathBuf::from(home));
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match self.gateway.host.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => {}
            Ok(_) => errors.push(format!(
                "gateway.host '{}' must be a loopback address",
                self.gateway.host
            )),
            Err(_) => errors.push(format!(
                "gateway.host '{}' is not an IP address",
                self.gateway.host
            )),
        }
        if self.gateway.port == 0 {
            errors.push("gateway.port must be non-zero".to_string());
        }
        if self.gateway.ready_paths.is_empty() {
            errors.push("gateway.ready_paths must not be empty".to_string());
        }
        if self.gateway.ready_interval_ms == 0 {
            errors.push("gateway.ready_interval_ms must be non-zero".to_string());
        }
        if self.approval.steady_interval_ms == 0 {
            errors.push("approval.steady_interval_ms must be non-zero".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Create the state and workspace directories and prove they accept writes
    pub fn ensure_writable_dirs(&self) -> anyhow::Result<()> {
        for (label, dir) in [
            ("state", &self.gateway.state_dir),
            ("workspace", &self.gateway.workspace_dir),
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                anyhow::anyhow!("Cannot create {} directory '{}': {}", label, dir.display(), e)
            })?;
            let marker = dir.join(".write-test");
            std::fs::write(&marker, b"ok")
                .and_then(|_| std::fs::remove_file(&marker))
                .map_err(|e| {
                    anyhow::anyhow!(
                        "{} directory '{}' is not writable (check volume permissions): {}",
                        label,
                        dir.display(),
                        e
                    )
                })?;
        }
        Ok(())
    }
}
