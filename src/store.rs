//! [MODULE C1] Persistent Store — atomic load/save of queue state and
//! account metadata. Readers never observe a half-written file; a crash
//! mid-save loses at most the most recent unsaved mutation.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::accounts::AccountsIndex;
use crate::error::StoreError;
use crate::queue::QueueState;

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn queue_state_path(&self) -> PathBuf {
        self.root.join("queue_state.json")
    }

    fn accounts_index_path(&self) -> PathBuf {
        self.root.join("accounts").join("accounts.json")
    }

    /// Load the on-disk queue state, or an empty state if absent. Corrupt
    /// files are renamed aside with a `.corrupt.<unix_ms>` suffix and an
    /// empty state is returned — startup must never block on corruption.
    pub async fn load_queue_state(&self) -> QueueState {
        let path = self.queue_state_path();
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<QueueState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(error = %e, path = %path.display(), "corrupt queue state, quarantining");
                    self.quarantine(&path).await;
                    QueueState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueState::default(),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to read queue state, starting empty");
                QueueState::default()
            }
        }
    }

    /// Write the queue state atomically: serialize, write to a temp file
    /// in the same directory, fsync, rename over the target.
    pub async fn save_queue_state(&self, state: &QueueState) -> Result<(), StoreError> {
        let path = self.queue_state_path();
        let json = serde_json::to_vec_pretty(state)?;
        atomic_write(&path, &json).await
    }

    pub async fn load_accounts_index(&self) -> AccountsIndex {
        let path = self.accounts_index_path();
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<AccountsIndex>(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    tracing::error!(error = %e, path = %path.display(), "corrupt accounts index, quarantining");
                    self.quarantine(&path).await;
                    AccountsIndex::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AccountsIndex::default(),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to read accounts index, starting empty");
                AccountsIndex::default()
            }
        }
    }

    pub async fn save_accounts_index(&self, index: &AccountsIndex) -> Result<(), StoreError> {
        let path = self.accounts_index_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(index)?;
        atomic_write(&path, &json).await
    }

    async fn quarantine(&self, path: &Path) {
        let ts = chrono::Utc::now().timestamp_millis();
        let corrupt_path = path.with_extension(format!("corrupt.{ts}"));
        if let Err(e) = fs::rename(path, &corrupt_path).await {
            tracing::error!(error = %e, "failed to quarantine corrupt file");
        }
    }
}

/// Write to a pid-qualified temp file in the same directory, fsync, then
/// rename over the target. Follows the teacher's `atomic_write` pattern
/// (src/memory/local.rs) but adds an explicit fsync since this data is
/// crash-critical rather than best-effort.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let file = fs::File::create(&tmp_path).await?;
    {
        use tokio::io::AsyncWriteExt;
        let mut file = file;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Prompt;

    #[tokio::test]
    async fn round_trip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_path_buf());

        let mut state = QueueState::default();
        state.prompts.push(Prompt::new(
            "p1".to_string(),
            "hello".to_string(),
            0,
            ".".to_string(),
            vec![],
            3,
            None,
            chrono::Utc::now(),
        ));
        state.total_processed = 4;

        store.save_queue_state(&state).await.unwrap();
        let loaded = store.load_queue_state().await;

        assert_eq!(loaded.prompts.len(), 1);
        assert_eq!(loaded.prompts[0].id, "p1");
        assert_eq!(loaded.total_processed, 4);
    }

    #[tokio::test]
    async fn missing_state_file_returns_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_path_buf());
        let state = store.load_queue_state().await;
        assert!(state.prompts.is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_file_is_quarantined_and_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_path_buf());
        tokio::fs::write(dir.path().join("queue_state.json"), b"not json")
            .await
            .unwrap();

        let state = store.load_queue_state().await;
        assert!(state.prompts.is_empty());

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut found_corrupt = false;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains(".corrupt.") {
                found_corrupt = true;
            }
        }
        assert!(found_corrupt);
    }
}
