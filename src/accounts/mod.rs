//! [MODULE C5] Account Store — named profiles of credential files the
//! executor reads on spawn, with atomic switching of the "active" mirror.
//!
//! Grounded in `original_source/src/cuti/services/claude_account_manager.py`
//! (`ClaudeAccountManager`), translated into this crate's typed-error,
//! atomic-write idiom (see `store.rs`).

pub mod profile;

pub use profile::{
    env_bindings, sanitize_name, AccountMeta, AccountsIndex, AnthropicApiKey, ApiKeys,
    BedrockApiKey, ALL_ENV_VARS,
};

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::error::AccountError;
use crate::store::StateStore;

/// Credential/session files cleared by `new_profile()` (spec.md §4.5;
/// original Python list in `claude_account_manager.py::new_account`).
const SESSION_FILES: &[&str] = &[
    ".credentials.json",
    ".claude.json",
    "session.json",
    ".session",
];

/// Session-related directories recreated empty by `new_profile()`.
const SESSION_DIRS: &[&str] = &["sessions", "shell-snapshots", "statsig"];

pub struct AccountsStore {
    root: PathBuf,
    store: StateStore,
    /// Reader/writer lock over the active directory: `use`/`save`/`new`/
    /// `delete` take the write side so no spawn can begin mid-switch;
    /// spawns take the read side via `read_active()` so concurrent reads
    /// don't serialize against each other, only against a switch
    /// (spec.md §5, Testable Property #7).
    write_lock: RwLock<()>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSummary {
    pub name: String,
    pub account_type: String,
    pub created: chrono::DateTime<Utc>,
    pub last_used: chrono::DateTime<Utc>,
    pub has_credentials: bool,
    pub is_active: bool,
    pub is_backup: bool,
}

impl AccountsStore {
    pub fn new(root: PathBuf) -> Self {
        let store = StateStore::new(root.clone());
        Self {
            root,
            store,
            write_lock: RwLock::new(()),
        }
    }

    /// Hold across a spawn so it can never observe a half-switched active
    /// directory: `use_profile` takes the write side of the same lock for
    /// its whole clear+copy, so this read only resolves once any
    /// in-progress switch has fully committed (spec.md §5).
    pub async fn read_active(&self) -> RwLockReadGuard<'_, ()> {
        self.write_lock.read().await
    }

    fn accounts_dir(&self) -> PathBuf {
        self.root.join("accounts")
    }

    fn profile_dir(&self, name: &str) -> PathBuf {
        self.accounts_dir().join(name)
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    /// List all profiles, hiding `backup_*` entries unless requested
    /// (spec.md §4.5).
    pub async fn list(&self, include_backups: bool) -> Result<Vec<AccountSummary>, AccountError> {
        let index = self.store.load_accounts_index().await;
        let mut out = Vec::new();
        for (name, meta) in &index.accounts {
            if !include_backups && name.starts_with("backup_") {
                continue;
            }
            let profile_dir = self.profile_dir(name);
            let has_credentials = profile_dir.join(".credentials.json").exists()
                || profile_dir.join(".api_keys.json").exists();
            out.push(AccountSummary {
                name: name.clone(),
                account_type: meta.account_type.clone(),
                created: meta.created,
                last_used: meta.last_used,
                has_credentials,
                is_active: index.active.as_deref() == Some(name.as_str()),
                is_backup: name.starts_with("backup_"),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn get_info(&self, name: &str) -> Result<AccountSummary, AccountError> {
        let index = self.store.load_accounts_index().await;
        let meta = index
            .accounts
            .get(name)
            .ok_or_else(|| AccountError::NotFound(name.to_string()))?;
        let profile_dir = self.profile_dir(name);
        Ok(AccountSummary {
            name: name.to_string(),
            account_type: meta.account_type.clone(),
            created: meta.created,
            last_used: meta.last_used,
            has_credentials: profile_dir.join(".credentials.json").exists()
                || profile_dir.join(".api_keys.json").exists(),
            is_active: index.active.as_deref() == Some(name),
            is_backup: name.starts_with("backup_"),
        })
    }

    /// Copy every file under the active directory into the named profile
    /// directory, creating it if new. Refuses if the active directory has
    /// no primary credentials file (spec.md §4.5).
    pub async fn save(&self, name: &str) -> Result<(), AccountError> {
        let _guard = self.write_lock.write().await;
        let safe_name =
            sanitize_name(name).ok_or_else(|| AccountError::InvalidName(name.to_string()))?;

        let creds_file = self.active_dir().join(".credentials.json");
        if !creds_file.exists() {
            return Err(AccountError::NoActiveCredentials);
        }

        let profile_dir = self.profile_dir(&safe_name);
        tokio::fs::create_dir_all(&profile_dir).await?;
        copy_dir_contents(&self.active_dir(), &profile_dir).await?;

        let account_type = detect_account_type(&creds_file).await;

        let mut index = self.store.load_accounts_index().await;
        let now = Utc::now();
        let created = index
            .accounts
            .get(&safe_name)
            .map(|m| m.created)
            .unwrap_or(now);
        index.accounts.insert(
            safe_name.clone(),
            AccountMeta {
                created,
                last_used: now,
                account_type,
                email: None,
            },
        );
        index.active = Some(safe_name);
        index.last_updated = Some(now);
        self.store.save_accounts_index(&index).await?;
        Ok(())
    }

    /// Atomic switch: clear the active directory (recreating session
    /// subdirectories empty), copy the named profile's files in, update
    /// the index. Held under the write lock for the whole operation so a
    /// concurrent spawn observes either fully-old or fully-new credentials
    /// (spec.md Testable Property #7).
    pub async fn use_profile(&self, name: &str) -> Result<(), AccountError> {
        let _guard = self.write_lock.write().await;
        let profile_dir = self.profile_dir(name);
        if !profile_dir.exists() {
            return Err(AccountError::NotFound(name.to_string()));
        }

        clear_dir_preserving_structure(&self.active_dir(), SESSION_DIRS).await?;
        copy_dir_contents(&profile_dir, &self.active_dir()).await?;

        let mut index = self.store.load_accounts_index().await;
        index.active = Some(name.to_string());
        if let Some(meta) = index.accounts.get_mut(name) {
            meta.last_used = Utc::now();
        }
        index.last_updated = Some(Utc::now());
        self.store.save_accounts_index(&index).await?;
        Ok(())
    }

    /// Snapshot current active credentials under a unique `backup_<ts>`
    /// name (if any exist), then clear all credential/session files and
    /// directories. Does not set a new active profile (spec.md §4.5).
    /// Returns true if a backup was taken.
    pub async fn new_profile(&self) -> Result<bool, AccountError> {
        let _guard = self.write_lock.write().await;
        let creds_file = self.active_dir().join(".credentials.json");
        let backup_needed = creds_file.exists();

        if backup_needed {
            let ts = Utc::now().format("%Y%m%d_%H%M%S");
            let mut backup_name = format!("backup_{ts}");
            let mut counter = 1;
            while self.profile_dir(&backup_name).exists() {
                backup_name = format!("backup_{ts}_{counter}");
                counter += 1;
            }
            // Inline save (avoid re-acquiring the write lock).
            let profile_dir = self.profile_dir(&backup_name);
            tokio::fs::create_dir_all(&profile_dir).await?;
            copy_dir_contents(&self.active_dir(), &profile_dir).await?;
            let account_type = detect_account_type(&creds_file).await;
            let mut index = self.store.load_accounts_index().await;
            let now = Utc::now();
            index.accounts.insert(
                backup_name,
                AccountMeta {
                    created: now,
                    last_used: now,
                    account_type,
                    email: None,
                },
            );
            self.store.save_accounts_index(&index).await?;
        }

        for filename in SESSION_FILES {
            let path = self.active_dir().join(filename);
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
        }
        for dirname in SESSION_DIRS {
            let path = self.active_dir().join(dirname);
            if path.exists() {
                tokio::fs::remove_dir_all(&path).await?;
            }
            tokio::fs::create_dir_all(&path).await?;
        }

        let mut index = self.store.load_accounts_index().await;
        index.active = None;
        index.last_updated = Some(Utc::now());
        self.store.save_accounts_index(&index).await?;

        Ok(backup_needed)
    }

    /// Remove a profile directory; if it was active, clear the active
    /// pointer (spec.md §4.5).
    pub async fn delete(&self, name: &str) -> Result<(), AccountError> {
        let _guard = self.write_lock.write().await;
        let profile_dir = self.profile_dir(name);
        if !profile_dir.exists() {
            return Err(AccountError::NotFound(name.to_string()));
        }
        tokio::fs::remove_dir_all(&profile_dir).await?;

        let mut index = self.store.load_accounts_index().await;
        index.accounts.remove(name);
        if index.active.as_deref() == Some(name) {
            index.active = None;
        }
        index.last_updated = Some(Utc::now());
        self.store.save_accounts_index(&index).await?;
        Ok(())
    }

    /// Store an API-key credential blob for a profile with owner-only
    /// permissions, creating the profile if it doesn't exist.
    pub async fn save_api_key(&self, name: &str, keys: &ApiKeys) -> Result<(), AccountError> {
        let _guard = self.write_lock.write().await;
        let profile_dir = self.profile_dir(name);
        tokio::fs::create_dir_all(&profile_dir).await?;
        let path = profile_dir.join(".api_keys.json");
        let json = serde_json::to_vec_pretty(keys)?;
        tokio::fs::write(&path, &json).await?;
        restrict_to_owner(&path).await?;

        let mut index = self.store.load_accounts_index().await;
        let now = Utc::now();
        let created = index.accounts.get(name).map(|m| m.created).unwrap_or(now);
        let account_type = match (&keys.anthropic, &keys.bedrock) {
            (Some(_), _) => "API (Anthropic)".to_string(),
            (None, Some(_)) => "API (Bedrock)".to_string(),
            (None, None) => "API".to_string(),
        };
        index.accounts.insert(
            name.to_string(),
            AccountMeta {
                created,
                last_used: now,
                account_type,
                email: None,
            },
        );
        index.last_updated = Some(now);
        self.store.save_accounts_index(&index).await?;
        Ok(())
    }

    pub async fn load_api_keys(&self, name: &str) -> Result<Option<ApiKeys>, AccountError> {
        let path = self.profile_dir(name).join(".api_keys.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Environment bindings for the currently-active profile's API keys,
    /// if any, plus the full unset list. The caller applies unset-then-set
    /// so the executor's environment is never partially updated.
    pub async fn active_env_bindings(&self) -> Result<(Vec<&'static str>, Vec<(String, String)>), AccountError> {
        let index = self.store.load_accounts_index().await;
        let set = match &index.active {
            Some(name) => match self.load_api_keys(name).await? {
                Some(keys) => env_bindings(&keys),
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        Ok((ALL_ENV_VARS.to_vec(), set))
    }
}

async fn detect_account_type(creds_file: &Path) -> String {
    match tokio::fs::read(creds_file).await {
        Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(v) => v
                .get("claudeAiOauth")
                .and_then(|o| o.get("subscriptionType"))
                .and_then(|s| s.as_str())
                .map(|s| {
                    let mut c = s.chars();
                    match c.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                        None => s.to_string(),
                    }
                })
                .unwrap_or_else(|| "Pro".to_string()),
            Err(_) => "Pro".to_string(),
        },
        Err(_) => "Pro".to_string(),
    }
}

#[cfg(unix)]
async fn restrict_to_owner(path: &Path) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn restrict_to_owner(_path: &Path) -> Result<(), std::io::Error> {
    Ok(())
}

/// Recursively copy every entry from `src` into `dst` (both assumed to
/// exist). Mirrors the teacher's file-by-file copy loop translated from
/// `claude_account_manager.py`'s `shutil.copy2`/`shutil.copytree` pairing.
async fn copy_dir_contents(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            if dest_path.exists() {
                tokio::fs::remove_dir_all(&dest_path).await?;
            }
            tokio::fs::create_dir_all(&dest_path).await?;
            Box::pin(copy_dir_contents(&entry.path(), &dest_path)).await?;
        } else if file_type.is_file() {
            tokio::fs::copy(entry.path(), &dest_path).await?;
        }
    }
    Ok(())
}

/// Clear every entry in `dir`, recreating the named subdirectories empty
/// afterward so the layout the executor expects survives a switch.
async fn clear_dir_preserving_structure(
    dir: &Path,
    preserve_dirs: &[&str],
) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    for name in preserve_dirs {
        tokio::fs::create_dir_all(dir.join(name)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_active_credentials(root: &Path, body: &str) {
        let active = root.join("active");
        tokio::fs::create_dir_all(&active).await.unwrap();
        tokio::fs::write(active.join(".credentials.json"), body)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_then_use_round_trips_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountsStore::new(dir.path().to_path_buf());
        write_active_credentials(
            dir.path(),
            r#"{"claudeAiOauth":{"subscriptionType":"pro","email":"a@example.com"}}"#,
        )
        .await;

        store.save("work").await.unwrap();
        let accounts = store.list(false).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "work");
        assert!(accounts[0].is_active);

        // Simulate switching to a different account, then back.
        write_active_credentials(dir.path(), r#"{"other":true}"#).await;
        store.save("personal").await.unwrap();
        store.use_profile("work").await.unwrap();

        let active_creds = tokio::fs::read_to_string(store.active_dir().join(".credentials.json"))
            .await
            .unwrap();
        assert!(active_creds.contains("example.com"));
    }

    #[tokio::test]
    async fn save_without_credentials_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountsStore::new(dir.path().to_path_buf());
        tokio::fs::create_dir_all(store.active_dir()).await.unwrap();
        assert!(matches!(
            store.save("x").await,
            Err(AccountError::NoActiveCredentials)
        ));
    }

    #[tokio::test]
    async fn backup_accounts_hidden_unless_requested() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountsStore::new(dir.path().to_path_buf());
        write_active_credentials(dir.path(), r#"{"claudeAiOauth":{}}"#).await;
        store.save("backup_20260101_000000").await.unwrap();

        assert!(store.list(false).await.unwrap().is_empty());
        assert_eq!(store.list(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_profile_backs_up_and_clears_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountsStore::new(dir.path().to_path_buf());
        write_active_credentials(dir.path(), r#"{"claudeAiOauth":{}}"#).await;
        tokio::fs::write(store.active_dir().join("session.json"), "{}")
            .await
            .unwrap();

        let backed_up = store.new_profile().await.unwrap();
        assert!(backed_up);
        assert!(!store.active_dir().join(".credentials.json").exists());
        assert!(!store.active_dir().join("session.json").exists());
        assert!(store.active_dir().join("sessions").is_dir());

        let accounts = store.list(true).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].name.starts_with("backup_"));
    }

    #[tokio::test]
    async fn delete_clears_active_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountsStore::new(dir.path().to_path_buf());
        write_active_credentials(dir.path(), r#"{"claudeAiOauth":{}}"#).await;
        store.save("work").await.unwrap();
        store.delete("work").await.unwrap();

        let index = store.store.load_accounts_index().await;
        assert!(index.active.is_none());
        assert!(!index.accounts.contains_key("work"));
    }

    #[tokio::test]
    async fn api_key_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountsStore::new(dir.path().to_path_buf());
        let keys = ApiKeys {
            anthropic: Some(AnthropicApiKey {
                api_key: "sk-ant-xxx".to_string(),
                created: Utc::now(),
            }),
            bedrock: None,
        };
        store.save_api_key("apiprofile", &keys).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(
                store
                    .profile_dir("apiprofile")
                    .join(".api_keys.json"),
            )
            .unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }
}
