//! The gateway's persisted JSON configuration.
//!
//! Only an enumerated set of keys is owned here. Every mutation re-reads the
//! file, replaces just those keys and writes the result back atomically, so
//! anything the gateway or its setup tool wrote stays intact.

use crate::token::{fingerprint, SharedSecret};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BackendConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("gateway token mismatch after sync: expected {expected}, config has {actual}")]
    TokenMismatch { expected: String, actual: String },
}

/// Keys the supervisor keeps in sync on every start
pub struct GatewaySettings<'a> {
    pub port: u16,
    pub token: &'a SharedSecret,
    pub workspace: &'a Path,
}

/// `channels.telegram`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannel {
    pub enabled: bool,
    pub dm_policy: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_from: Vec<String>,
    pub bot_token: String,
    pub group_policy: String,
    pub stream_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_streaming: Option<bool>,
}

impl TelegramChannel {
    /// DMs restricted to one numeric user id, or open to everyone when none is known
    pub fn allowlist(bot_token: &str, user_id: Option<&str>) -> Self {
        let allow_from = match user_id {
            Some(id) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => vec![id.to_string()],
            _ => vec!["*".to_string()],
        };
        Self {
            enabled: true,
            dm_policy: "allowlist".to_string(),
            allow_from,
            bot_token: bot_token.to_string(),
            group_policy: "allowlist".to_string(),
            stream_mode: "partial".to_string(),
            block_streaming: Some(true),
        }
    }

    /// DMs require an explicit pairing approval
    pub fn pairing(bot_token: &str) -> Self {
        Self {
            enabled: true,
            dm_policy: "pairing".to_string(),
            allow_from: Vec::new(),
            bot_token: bot_token.to_string(),
            group_policy: "allowlist".to_string(),
            stream_mode: "partial".to_string(),
            block_streaming: None,
        }
    }
}

/// `channels.discord`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordChannel {
    pub enabled: bool,
    pub token: String,
    pub group_policy: String,
    pub dm: DmPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct DmPolicy {
    pub policy: String,
}

impl DiscordChannel {
    pub fn pairing(token: &str) -> Self {
        Self {
            enabled: true,
            token: token.to_string(),
            group_policy: "allowlist".to_string(),
            dm: DmPolicy {
                policy: "pairing".to_string(),
            },
        }
    }
}

/// `channels.slack`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackChannel {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_token: Option<String>,
}

/// Handle to the gateway's configuration file
#[derive(Debug, Clone)]
pub struct BackendConfigFile {
    path: PathBuf,
}

impl BackendConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The gateway counts as configured once this file exists
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Returns whether a file was removed
    pub fn remove(&self) -> Result<bool, BackendConfigError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed gateway configuration");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Current document, or an empty object when the file does not exist
    pub fn read(&self) -> Result<Value, BackendConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Value::Object(Map::new())),
            Ok(content) => serde_json::from_str(&content).map_err(|source| BackendConfigError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Read, mutate and write back in one step
    pub fn update<F>(&self, mutate: F) -> Result<(), BackendConfigError>
    where
        F: FnOnce(&mut Value),
    {
        let mut doc = self.read()?;
        if !doc.is_object() {
            doc = Value::Object(Map::new());
        }
        mutate(&mut doc);
        self.write(&doc)
    }

    /// Apply the gateway keys the headless deployment depends on
    pub fn apply_gateway_settings(&self, settings: &GatewaySettings<'_>) -> Result<(), BackendConfigError> {
        self.update(|doc| {
            set_path(doc, &["gateway", "mode"], Value::from("local"));
            set_path(doc, &["gateway", "bind"], Value::from("loopback"));
            set_path(doc, &["gateway", "port"], Value::from(settings.port));
            set_path(doc, &["gateway", "auth", "mode"], Value::from("token"));
            set_path(doc, &["gateway", "auth", "token"], Value::from(settings.token.expose()));
            set_path(doc, &["gateway", "controlUi", "allowInsecureAuth"], Value::Bool(true));
            set_path(
                doc,
                &["gateway", "controlUi", "dangerouslyDisableDeviceAuth"],
                Value::Bool(true),
            );
            set_path(
                doc,
                &["gateway", "trustedProxies"],
                Value::from(vec!["127.0.0.1", "::1"]),
            );
            set_path(
                doc,
                &["agents", "defaults", "workspace"],
                Value::from(settings.workspace.to_string_lossy().into_owned()),
            );
        })?;
        debug!(path = %self.path.display(), fingerprint = %settings.token.fingerprint(), "Gateway settings written");
        Ok(())
    }

    pub fn set_telegram(&self, channel: &TelegramChannel) -> Result<(), BackendConfigError> {
        let value = to_value(channel);
        self.update(|doc| {
            set_path(doc, &["channels", "telegram"], value);
            set_path(doc, &["plugins", "entries", "telegram"], serde_json::json!({ "enabled": true }));
        })
    }

    pub fn set_discord(&self, channel: &DiscordChannel) -> Result<(), BackendConfigError> {
        let value = to_value(channel);
        self.update(|doc| set_path(doc, &["channels", "discord"], value))
    }

    pub fn set_slack(&self, channel: &SlackChannel) -> Result<(), BackendConfigError> {
        let value = to_value(channel);
        self.update(|doc| set_path(doc, &["channels", "slack"], value))
    }

    pub fn gateway_token(&self) -> Result<Option<String>, BackendConfigError> {
        let doc = self.read()?;
        Ok(get_path(&doc, &["gateway", "auth", "token"])
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Byte-for-byte comparison of the persisted token against the active one
    pub fn verify_token(&self, secret: &SharedSecret) -> Result<(), BackendConfigError> {
        let actual = self.gateway_token()?;
        if actual.as_deref() == Some(secret.expose()) {
            return Ok(());
        }
        Err(BackendConfigError::TokenMismatch {
            expected: secret.fingerprint(),
            actual: actual.as_deref().map(fingerprint).unwrap_or_else(|| "none".to_string()),
        })
    }

    pub fn device_auth_disabled(&self) -> Result<bool, BackendConfigError> {
        let doc = self.read()?;
        Ok(get_path(&doc, &["gateway", "controlUi", "dangerouslyDisableDeviceAuth"])
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Replace the whole document atomically
    pub fn write(&self, doc: &Value) -> Result<(), BackendConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let content = serde_json::to_string_pretty(doc).map_err(|source| BackendConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> BackendConfigError {
        BackendConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    // Plain structs of strings and bools always serialize
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Set a nested key, replacing any non-object along the way
pub fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = doc;
    for key in parents {
        current = ensure_object(current)
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.to_string(), value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().expect("value was just made an object")
}

pub fn get_path<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |current, key| current.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings<'a>(token: &'a SharedSecret, workspace: &'a Path) -> GatewaySettings<'a> {
        GatewaySettings {
            port: 18789,
            token,
            workspace,
        }
    }

    #[test]
    fn test_missing_file_reads_as_empty_object() {
        let tmp = tempfile::tempdir().unwrap();
        let file = BackendConfigFile::new(tmp.path().join("openclaw.json"));
        assert!(!file.exists());
        assert_eq!(file.read().unwrap(), json!({}));
        assert_eq!(file.gateway_token().unwrap(), None);
        assert!(!file.remove().unwrap());
    }

    #[test]
    fn test_apply_gateway_settings_preserves_unowned_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("openclaw.json");
        std::fs::write(
            &path,
            r#"{"models":{"default":"x"},"gateway":{"auth":{"token":"old"},"extra":1}}"#,
        )
        .unwrap();

        let file = BackendConfigFile::new(&path);
        let token = SharedSecret::new("new-token");
        file.apply_gateway_settings(&settings(&token, Path::new("/data/workspace")))
            .unwrap();

        let doc = file.read().unwrap();
        assert_eq!(doc["models"]["default"], "x");
        assert_eq!(doc["gateway"]["extra"], 1);
        assert_eq!(doc["gateway"]["auth"]["token"], "new-token");
        assert_eq!(doc["gateway"]["auth"]["mode"], "token");
        assert_eq!(doc["gateway"]["bind"], "loopback");
        assert_eq!(doc["gateway"]["port"], 18789);
        assert_eq!(doc["gateway"]["trustedProxies"], json!(["127.0.0.1", "::1"]));
        assert_eq!(doc["agents"]["defaults"]["workspace"], "/data/workspace");
        assert!(file.device_auth_disabled().unwrap());
        file.verify_token(&token).unwrap();

        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys[0], "models");
    }

    #[test]
    fn test_verify_token_detects_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("openclaw.json");
        std::fs::write(&path, r#"{"gateway":{"auth":{"token":"someone-else"}}}"#).unwrap();

        let file = BackendConfigFile::new(&path);
        let err = file.verify_token(&SharedSecret::new("ours")).unwrap_err();
        match err {
            BackendConfigError::TokenMismatch { expected, actual } => {
                assert_eq!(expected, fingerprint("ours"));
                assert_eq!(actual, fingerprint("someone-else"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("openclaw.json");
        std::fs::write(&path, "{not json").unwrap();

        let file = BackendConfigFile::new(&path);
        assert!(matches!(file.read(), Err(BackendConfigError::Parse { .. })));
        let token = SharedSecret::new("t");
        assert!(file
            .apply_gateway_settings(&settings(&token, Path::new("/w")))
            .is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_set_telegram_enables_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let file = BackendConfigFile::new(tmp.path().join("openclaw.json"));
        file.set_telegram(&TelegramChannel::allowlist("bot:123", Some("42")))
            .unwrap();

        let doc = file.read().unwrap();
        assert_eq!(doc["channels"]["telegram"]["dmPolicy"], "allowlist");
        assert_eq!(doc["channels"]["telegram"]["allowFrom"], json!(["42"]));
        assert_eq!(doc["channels"]["telegram"]["blockStreaming"], true);
        assert_eq!(doc["plugins"]["entries"]["telegram"]["enabled"], true);
    }

    #[test]
    fn test_telegram_allowlist_falls_back_to_wildcard() {
        let channel = TelegramChannel::allowlist("bot", Some("@someone"));
        assert_eq!(channel.allow_from, vec!["*"]);
        let channel = TelegramChannel::allowlist("bot", None);
        assert_eq!(channel.allow_from, vec!["*"]);
    }

    #[test]
    fn test_set_path_replaces_scalars() {
        let mut doc = json!({"gateway": "oops"});
        set_path(&mut doc, &["gateway", "auth", "token"], json!("t"));
        assert_eq!(doc, json!({"gateway": {"auth": {"token": "t"}}}));
        assert_eq!(get_path(&doc, &["gateway", "auth", "token"]), Some(&json!("t")));
        assert_eq!(get_path(&doc, &["gateway", "missing"]), None);
    }
}
