//! Telegram user resolution for the agent workspace.
//!
//! The agent addresses its owner by numeric chat id, which Telegram only
//! reveals once the user has messaged the bot. This resolves the configured
//! username to a chat id through the Bot API and records it in
//! `USER.md`, keeping any other sections the user added below it.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const USER_MD: &str = "USER.md";

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Value,
}

/// What survives from a previous `USER.md`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExistingUserMd {
    pub chat_id: Option<String>,
    /// Everything from the first non-Telegram `## ` heading onward
    pub extra: String,
}

impl ExistingUserMd {
    pub fn parse(content: &str) -> Self {
        let chat_id = content.lines().find_map(|line| {
            let id = line.strip_prefix("- Chat ID:")?.trim();
            let digits: String = id.chars().take_while(char::is_ascii_digit).collect();
            (!digits.is_empty()).then_some(digits)
        });

        let extra = content
            .match_indices("\n## ")
            .map(|(i, _)| i)
            .find(|&i| !is_telegram_heading(&content[i + 4..]))
            .map(|i| content[i..].to_string())
            .unwrap_or_default();

        Self { chat_id, extra }
    }
}

fn is_telegram_heading(rest: &str) -> bool {
    match rest.strip_prefix("Telegram") {
        Some(after) => !after
            .chars()
            .next()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false),
        None => false,
    }
}

fn normalize_username(username: &str) -> String {
    username.trim_start_matches('@').to_lowercase()
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Chat id of the first update sent by or addressed to `username`
pub fn chat_for_username(updates: &[Value], username: &str) -> Option<String> {
    let wanted = normalize_username(username);
    let matches = |v: Option<&Value>| {
        v.and_then(|u| u.get("username"))
            .and_then(Value::as_str)
            .map(|u| u.to_lowercase() == wanted)
            .unwrap_or(false)
    };

    updates.iter().find_map(|update| {
        let chat = update
            .pointer("/message/chat")
            .or_else(|| update.pointer("/my_chat_member/chat"));
        let from = update
            .pointer("/message/from")
            .or_else(|| update.pointer("/my_chat_member/from"));

        if matches(chat) {
            return chat.and_then(|c| c.get("id")).and_then(id_string);
        }
        if matches(from) {
            return chat
                .and_then(|c| c.get("id"))
                .or_else(|| from.and_then(|f| f.get("id")))
                .and_then(id_string);
        }
        None
    })
}

/// Chat id and sender username of the most recent update carrying a chat
pub fn latest_chat(updates: &[Value]) -> Option<(String, Option<String>)> {
    updates.iter().rev().find_map(|update| {
        let chat = ["/message/chat", "/edited_message/chat", "/my_chat_member/chat", "/chat_member/chat"]
            .iter()
            .find_map(|p| update.pointer(p))?;
        let id = chat.get("id").and_then(id_string)?;
        let username = ["/message/from", "/edited_message/from", "/my_chat_member/from"]
            .iter()
            .find_map(|p| update.pointer(p))
            .and_then(|f| f.get("username"))
            .and_then(Value::as_str)
            .map(normalize_username);
        Some((id, username))
    })
}

pub fn render_user_md(chat_id: Option<&str>, username: Option<&str>, extra: &str) -> String {
    let mut lines: Vec<String> = vec!["# User".into(), String::new(), "## Telegram".into()];

    match (chat_id, username) {
        (Some(id), username) => {
            lines.push(format!("- Chat ID: {id}"));
            if let Some(name) = username {
                lines.push(format!("- Username: @{name}"));
            }
            lines.push(String::new());
            lines.push(format!(
                "When sending Telegram messages to this user, use target `telegram:{id}` (numeric chat ID, not @username)."
            ));
        }
        (None, Some(name)) => {
            lines.push(format!("- Username: @{name}"));
            lines.push("- No chat ID yet. The user must message the bot first (e.g. send /start).".into());
            lines.push(String::new());
            lines.push(
                "Do not send Telegram messages until a chat ID is set. Do not use telegram:unknown or @unknown as a target."
                    .into(),
            );
        }
        (None, None) => {
            lines.push(
                "- No chat ID or username. Set TELEGRAM_USERNAME and message the bot, or send /start before deploy."
                    .into(),
            );
            lines.push(String::new());
            lines.push(
                "Do not send Telegram messages until USER.md has a numeric Chat ID. Do not use telegram:unknown as a target."
                    .into(),
            );
        }
    }

    lines.push(extra.to_string());
    lines.join("\n")
}

pub struct TelegramResolver {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    username: Option<String>,
    workspace_dir: PathBuf,
}

impl TelegramResolver {
    pub fn new(bot_token: &str, username: Option<&str>, workspace_dir: &Path) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: bot_token.to_string(),
            username: username.filter(|u| !u.is_empty()).map(str::to_string),
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn user_md_path(&self) -> PathBuf {
        self.workspace_dir.join(USER_MD)
    }

    /// Resolve and write `USER.md`. Errors are logged, never returned.
    pub async fn resolve_and_write(&self) {
        if let Err(e) = self.try_resolve_and_write().await {
            warn!(error = %e, "Telegram user resolution failed");
        }
    }

    async fn try_resolve_and_write(&self) -> Result<()> {
        let path = self.user_md_path();
        let existing = std::fs::read_to_string(&path)
            .map(|content| ExistingUserMd::parse(&content))
            .unwrap_or_default();

        let (mut chat_id, mut username) = match self.resolve(&existing).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "Error resolving Telegram user");
                (None, self.username.as_deref().map(normalize_username))
            }
        };

        if chat_id.is_none() {
            if let Some(ref id) = existing.chat_id {
                info!(chat_id = %id, "Falling back to previously resolved chat ID");
                chat_id = Some(id.clone());
            }
        }
        if username.as_deref() == Some("") {
            username = None;
        }

        let content = render_user_md(chat_id.as_deref(), username.as_deref(), &existing.extra);
        std::fs::create_dir_all(&self.workspace_dir)
            .with_context(|| format!("failed to create {}", self.workspace_dir.display()))?;
        std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Wrote Telegram user profile");
        Ok(())
    }

    async fn resolve(&self, existing: &ExistingUserMd) -> Result<(Option<String>, Option<String>)> {
        let me = self.call("getMe").await?;
        let bot = me.get("username").and_then(Value::as_str).unwrap_or("unknown");
        info!(bot = %bot, "Telegram bot verified");

        let mut chat_id = None;
        let mut username = None;
        let mut updates: Option<Vec<Value>> = None;

        if let Some(ref configured) = self.username {
            if configured.chars().all(|c| c.is_ascii_digit()) {
                chat_id = Some(configured.clone());
            } else {
                let name = normalize_username(configured);
                let list = self.updates(100).await?;
                chat_id = chat_for_username(&list, &name);
                match (&chat_id, &existing.chat_id) {
                    (Some(id), _) => info!(username = %name, chat_id = %id, "Resolved Telegram username"),
                    (None, Some(id)) => {
                        info!(username = %name, chat_id = %id, "No matching updates, reusing previous chat ID");
                        chat_id = Some(id.clone());
                    }
                    (None, None) => warn!(
                        username = %name,
                        "Could not resolve Telegram username; the user must message the bot first"
                    ),
                }
                username = Some(name);
                updates = Some(list);
            }
        }

        if chat_id.is_none() {
            let list = match updates {
                Some(list) if !list.is_empty() => list,
                _ => self.updates(50).await?,
            };
            if let Some((id, from)) = latest_chat(&list) {
                info!(chat_id = %id, "Using chat ID from most recent update");
                chat_id = Some(id);
                if from.is_some() {
                    username = from;
                }
            } else if !list.is_empty() {
                warn!("Telegram updates contained no chat id");
            }
        }

        Ok((chat_id, username))
    }

    async fn updates(&self, limit: u32) -> Result<Vec<Value>> {
        let result = self.call(&format!("getUpdates?limit={limit}")).await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    async fn call(&self, method: &str) -> Result<Value> {
        let url = format!("{}/bot{}/{}", self.api_base, self.bot_token, method);
        let response: ApiResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("request to Telegram failed: {}", e.without_url()))?
            .json()
            .await
            .map_err(|e| anyhow!("invalid Telegram response: {}", e.without_url()))?;

        if !response.ok {
            return Err(anyhow!(
                "Telegram rejected {}: {}",
                method.split('?').next().unwrap_or(method),
                response.description.unwrap_or_default()
            ));
        }
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_existing_keeps_following_sections() {
        let content = "# User\n\n## Telegram\n- Chat ID: 12345\n- Username: @alice\n\n## Trading Profile\nrisk: low\n";
        let existing = ExistingUserMd::parse(content);
        assert_eq!(existing.chat_id.as_deref(), Some("12345"));
        assert_eq!(existing.extra, "\n## Trading Profile\nrisk: low\n");
    }

    #[test]
    fn test_parse_existing_skips_telegram_prefixed_only_when_exact() {
        let content = "# User\n\n## Telegram\n- Username: @bob\n\n## TelegramExtras\nkeep\n";
        let existing = ExistingUserMd::parse(content);
        assert_eq!(existing.chat_id, None);
        assert_eq!(existing.extra, "\n## TelegramExtras\nkeep\n");
    }

    #[test]
    fn test_chat_for_username_matches_chat_or_sender() {
        let updates = vec![
            json!({"message": {"chat": {"id": 1, "username": "someone"}, "from": {"id": 1, "username": "someone"}}}),
            json!({"message": {"chat": {"id": -77}, "from": {"id": 9, "username": "Alice"}}}),
        ];
        assert_eq!(chat_for_username(&updates, "@alice").as_deref(), Some("-77"));
        assert_eq!(chat_for_username(&updates, "SOMEONE").as_deref(), Some("1"));
        assert_eq!(chat_for_username(&updates, "carol"), None);
    }

    #[test]
    fn test_latest_chat_prefers_newest_update() {
        let updates = vec![
            json!({"message": {"chat": {"id": 1}, "from": {"username": "old"}}}),
            json!({"edited_message": {"chat": {"id": 2}, "from": {"username": "@New"}}}),
            json!({"poll": {"id": "x"}}),
        ];
        assert_eq!(latest_chat(&updates), Some(("2".to_string(), Some("new".to_string()))));
        assert_eq!(latest_chat(&[]), None);
    }

    #[test]
    fn test_render_user_md_variants() {
        let with_id = render_user_md(Some("42"), Some("alice"), "");
        assert!(with_id.starts_with("# User\n\n## Telegram\n- Chat ID: 42\n- Username: @alice"));
        assert!(with_id.contains("`telegram:42`"));
        assert!(with_id.ends_with('\n'));

        let pending = render_user_md(None, Some("alice"), "");
        assert!(pending.contains("No chat ID yet"));

        let preserved = render_user_md(Some("42"), None, "\n## Notes\nhello\n");
        assert!(preserved.ends_with("\n\n## Notes\nhello\n"));
        assert_eq!(ExistingUserMd::parse(&preserved).extra, "\n## Notes\nhello\n");
    }

    #[tokio::test]
    async fn test_unreachable_api_still_writes_profile() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(USER_MD),
            "# User\n\n## Telegram\n- Chat ID: 555\n\n## Notes\nkeep me\n",
        )
        .unwrap();

        let resolver = TelegramResolver::new("bot-token", Some("alice"), tmp.path())
            .with_api_base("http://127.0.0.1:1");
        resolver.resolve_and_write().await;

        let written = std::fs::read_to_string(tmp.path().join(USER_MD)).unwrap();
        assert!(written.contains("- Chat ID: 555"));
        assert!(written.contains("- Username: @alice"));
        assert!(written.ends_with("## Notes\nkeep me\n"));
    }
}
