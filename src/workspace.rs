//! Files the gateway's agent reads besides its own configuration.
//!
//! `mcporter.json` is the MCP server registry shared by every process in the
//! container. Only the `senpi` server entry is owned here; servers the agent
//! added itself survive every rewrite. The workspace gets a memory file and
//! the prompt files shipped with the image.

use crate::backend_config::{get_path, set_path, BackendConfigError, BackendConfigFile};
use crate::config::GatewayConfig;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SENPI_SERVER: &str = "senpi";
const SENPI_TOKEN_VAR: &str = "SENPI_AUTH_TOKEN";

const MEMORY_FILE: &str = "MEMORY.md";
const MEMORY_DIR: &str = "memory";
const MEMORY_SEED: &str = "# Memory\n\nLong-term context across sessions.\n";

/// Refreshed from the image on every bootstrap; other defaults are copied once
const MANAGED_FILES: [&str; 4] = ["AGENTS.md", "SOUL.md", "BOOT.md", "TOOLS.md"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Registry(#[from] BackendConfigError),
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What a registry sync did to the `senpi` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenpiChange {
    Configured,
    Removed,
}

/// The MCP server registry
pub struct McpRegistry {
    file: BackendConfigFile,
    url: String,
}

impl McpRegistry {
    pub fn new(path: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            file: BackendConfigFile::new(path),
            url: url.into(),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Current registry. A missing or unreadable file starts over empty.
    fn load(&self) -> Value {
        if !self.file.exists() {
            return json!({ "mcpServers": {}, "imports": [] });
        }
        let mut doc = match self.file.read() {
            Ok(doc) if doc.is_object() => doc,
            Ok(_) => json!({ "mcpServers": {}, "imports": [] }),
            Err(e) => {
                warn!(error = %e, "Unreadable MCP registry, rewriting it");
                json!({ "mcpServers": {}, "imports": [] })
            }
        };
        if !doc.get("mcpServers").is_some_and(Value::is_object) {
            set_path(&mut doc, &["mcpServers"], json!({}));
        }
        doc
    }

    /// Server entry that bridges to the remote Senpi endpoint
    pub fn senpi_entry(&self, token: &str) -> Value {
        json!({
            "command": "npx",
            "args": [
                "mcp-remote",
                self.url,
                "--header",
                "Authorization: Bearer ${SENPI_AUTH_TOKEN}",
            ],
            "env": { SENPI_TOKEN_VAR: token },
        })
    }

    /// Upsert the `senpi` server when a token is set, drop it otherwise
    pub fn sync_senpi(&self, token: Option<&str>) -> Result<SenpiChange, BackendConfigError> {
        let mut doc = self.load();
        let change = match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => {
                set_path(&mut doc, &["mcpServers", SENPI_SERVER], self.senpi_entry(token));
                SenpiChange::Configured
            }
            None => {
                if let Some(servers) = doc.get_mut("mcpServers").and_then(Value::as_object_mut) {
                    servers.remove(SENPI_SERVER);
                }
                SenpiChange::Removed
            }
        };
        self.file.write(&doc)?;
        Ok(change)
    }

    /// Swap the token of an existing `senpi` entry, keeping the rest of it.
    /// Creates the full entry when there is none.
    pub fn set_senpi_token(&self, token: &str) -> Result<(), BackendConfigError> {
        let mut doc = self.load();
        if get_path(&doc, &["mcpServers", SENPI_SERVER]).is_some_and(Value::is_object) {
            set_path(
                &mut doc,
                &["mcpServers", SENPI_SERVER, "env", SENPI_TOKEN_VAR],
                Value::from(token),
            );
        } else {
            set_path(&mut doc, &["mcpServers", SENPI_SERVER], self.senpi_entry(token));
        }
        self.file.write(&doc)
    }

    pub fn senpi_token(&self) -> Option<String> {
        let doc = self.file.read().ok()?;
        get_path(&doc, &["mcpServers", SENPI_SERVER, "env", SENPI_TOKEN_VAR])
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Workspace and registry preparation run before every gateway (re)start
pub struct Workspace {
    dir: PathBuf,
    defaults_dir: PathBuf,
    home_dir: Option<PathBuf>,
    registry: McpRegistry,
    /// Starts as the environment value; replaced when the token is rotated at runtime
    senpi_token: Mutex<Option<String>>,
}

impl Workspace {
    pub fn new(gateway: &GatewayConfig, senpi_token: Option<String>) -> Self {
        Self {
            dir: gateway.workspace_dir.clone(),
            defaults_dir: gateway.workspace_defaults_dir.clone(),
            home_dir: gateway.home_dir.clone(),
            registry: McpRegistry::new(gateway.mcporter_path(), gateway.senpi_mcp_url.clone()),
            senpi_token: Mutex::new(senpi_token),
        }
    }

    pub fn registry(&self) -> &McpRegistry {
        &self.registry
    }

    pub fn senpi_token(&self) -> Option<String> {
        self.senpi_token.lock().clone()
    }

    /// Seed the workspace and bring the registry in line with the current token
    pub fn bootstrap(&self) -> Result<(), WorkspaceError> {
        std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let memory_file = self.dir.join(MEMORY_FILE);
        if !memory_file.exists() {
            std::fs::write(&memory_file, MEMORY_SEED).map_err(io_error(&memory_file))?;
        }
        let memory_dir = self.dir.join(MEMORY_DIR);
        std::fs::create_dir_all(&memory_dir).map_err(io_error(&memory_dir))?;

        if let Some(ref home) = self.home_dir {
            ensure_senpi_state(home)?;
        }

        let token = self.senpi_token();
        match self.registry.sync_senpi(token.as_deref())? {
            SenpiChange::Configured => info!(path = %self.registry.path().display(), "Senpi MCP server configured"),
            SenpiChange::Removed => {
                info!("SENPI_AUTH_TOKEN is blank; Senpi MCP server not configured")
            }
        }

        let copied = seed_defaults(&self.defaults_dir, &self.dir)?;
        debug!(copied, defaults = %self.defaults_dir.display(), "Workspace defaults seeded");
        Ok(())
    }

    /// Rotate the Senpi token; later bootstraps keep the new value
    pub fn set_senpi_token(&self, token: &str) -> Result<(), WorkspaceError> {
        self.registry.set_senpi_token(token)?;
        *self.senpi_token.lock() = Some(token.to_string());
        info!(path = %self.registry.path().display(), "Senpi token updated");
        Ok(())
    }
}

/// Copy image defaults into the workspace. Returns how many entries were written.
pub fn seed_defaults(defaults_dir: &Path, workspace_dir: &Path) -> Result<usize, WorkspaceError> {
    if !defaults_dir.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in std::fs::read_dir(defaults_dir).map_err(io_error(defaults_dir))? {
        let entry = entry.map_err(io_error(defaults_dir))?;
        let name = entry.file_name();
        let src = entry.path();
        let dest = workspace_dir.join(&name);

        let managed = name.to_str().is_some_and(|n| MANAGED_FILES.contains(&n));
        if !managed && dest.exists() {
            continue;
        }
        copy_recursive(&src, &dest)?;
        copied += 1;
    }
    Ok(copied)
}

fn copy_recursive(src: &Path, dest: &Path) -> Result<(), WorkspaceError> {
    if src.is_dir() {
        std::fs::create_dir_all(dest).map_err(io_error(dest))?;
        for entry in std::fs::read_dir(src).map_err(io_error(src))? {
            let entry = entry.map_err(io_error(src))?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(src, dest).map(|_| ()).map_err(io_error(dest))
    }
}

/// `~/.config/senpi/state.json`, created as `FRESH` so the agent's first read succeeds.
/// An existing file is never touched.
pub fn ensure_senpi_state(home: &Path) -> Result<bool, WorkspaceError> {
    let dir = home.join(".config").join("senpi");
    std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
    let path = dir.join("state.json");
    if path.exists() {
        return Ok(false);
    }
    let content = serde_json::to_string_pretty(&json!({ "state": "FRESH" })).unwrap_or_default();
    std::fs::write(&path, content).map_err(io_error(&path))?;
    Ok(true)
}
