//! Shared secret between the proxy and the gateway
//!
//! The secret is resolved once at startup and never changes for the lifetime
//! of the process. Only its fingerprint is ever logged.

use anyhow::Context;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Bearer credential for internal traffic to the gateway
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Arc<str>);

impl SharedSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// The raw secret. Callers must not log this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First 8 hex characters of the SHA-256 digest
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret({})", self.fingerprint())
    }
}

/// Short, non-reversible correlation id for a secret value
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..4])
}

/// Where the active secret came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
    File,
    Generated,
}

/// Resolves the shared secret: environment, then persisted file, then a fresh random value
pub struct TokenStore {
    path: PathBuf,
    env_value: Option<String>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, env_value: Option<String>) -> Self {
        Self {
            path: path.into(),
            env_value: env_value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolve(&self) -> anyhow::Result<(SharedSecret, TokenSource)> {
        let persisted = self.read_persisted();

        if let Some(ref value) = self.env_value {
            let secret = SharedSecret::new(value.clone());
            if persisted.as_deref() != Some(value.as_str()) {
                // The environment stays authoritative even if persisting fails
                if let Err(e) = write_secret_file(&self.path, value) {
                    warn!(path = %self.path.display(), error = %e, "Failed to persist gateway token");
                }
            }
            info!(fingerprint = %secret.fingerprint(), "Using gateway token from environment");
            return Ok((secret, TokenSource::Environment));
        }

        if let Some(value) = persisted {
            let secret = SharedSecret::new(value);
            info!(
                path = %self.path.display(),
                fingerprint = %secret.fingerprint(),
                "Using persisted gateway token"
            );
            return Ok((secret, TokenSource::File));
        }

        let generated = generate_secret();
        write_secret_file(&self.path, &generated)
            .with_context(|| format!("Failed to persist generated token to {}", self.path.display()))?;
        let secret = SharedSecret::new(generated);
        info!(
            path = %self.path.display(),
            fingerprint = %secret.fingerprint(),
            "Generated new gateway token"
        );
        Ok((secret, TokenSource::Generated))
    }

    fn read_persisted(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// 32 random bytes, hex encoded
pub fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Write atomically with owner-only permissions
fn write_secret_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_is_persisted_and_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/gateway.token");
        let store = TokenStore::new(&path, None);

        let (first, source) = store.resolve().unwrap();
        assert_eq!(source, TokenSource::Generated);
        assert_eq!(first.expose().len(), 64);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first.expose());

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let (second, source) = store.resolve().unwrap();
        assert_eq!(source, TokenSource::File);
        assert_eq!(first, second);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn test_environment_wins_and_is_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.token");
        std::fs::write(&path, "old-value").unwrap();

        let store = TokenStore::new(&path, Some("  from-env \n".to_string()));
        let (secret, source) = store.resolve().unwrap();
        assert_eq!(source, TokenSource::Environment);
        assert_eq!(secret.expose(), "from-env");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "from-env");
    }

    #[test]
    fn test_blank_environment_value_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.token");
        std::fs::write(&path, "persisted\n").unwrap();

        let store = TokenStore::new(&path, Some("   ".to_string()));
        let (secret, source) = store.resolve().unwrap();
        assert_eq!(source, TokenSource::File);
        assert_eq!(secret.expose(), "persisted");
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.token");
        TokenStore::new(&path, None).resolve().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let secret = SharedSecret::new("super-secret-value");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains(&secret.fingerprint()));
        assert_eq!(secret.fingerprint().len(), 8);
    }
}
