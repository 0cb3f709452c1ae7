use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::RelayError;
use crate::message::{GLOBAL_CHANNEL, clip};
use crate::protocol::BODY_MAX;
use crate::types::validate_channel_name;

/// Named channels, persisted as one descriptor file per channel. The file
/// name is the channel name and its content the description.
///
/// Membership is not stored here; it lives on each session. Any change
/// that must keep descriptors and memberships in agreement runs under
/// [`ChannelStore::lock_changes`].
pub struct ChannelStore {
    dir: PathBuf,
    changes: Mutex<()>,
}

impl ChannelStore {
    /// Open the store, creating its directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            changes: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize directory changes. Taken before the registry lock, never
    /// while holding it.
    pub async fn lock_changes(&self) -> MutexGuard<'_, ()> {
        self.changes.lock().await
    }

    fn descriptor(&self, name: &str) -> Result<PathBuf, RelayError> {
        validate_channel_name(name)?;
        if name == GLOBAL_CHANNEL {
            return Err(RelayError::InvalidName(format!(
                "'{GLOBAL_CHANNEL}' is built in"
            )));
        }
        Ok(self.dir.join(name))
    }

    /// Channel names, sorted.
    pub async fn names(&self) -> Result<Vec<String>, RelayError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn exists(&self, name: &str) -> bool {
        match self.descriptor(name) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Write the descriptor for `name`, replacing any existing description.
    pub async fn create(&self, name: &str, description: &str) -> Result<(), RelayError> {
        let path = self.descriptor(name)?;
        fs::write(&path, description).await?;
        Ok(())
    }

    /// Remove the descriptor. Returns `false` if there was none.
    pub async fn delete(&self, name: &str) -> Result<bool, RelayError> {
        let path = self.descriptor(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn description(&self, name: &str) -> Result<Option<String>, RelayError> {
        let path = self.descriptor(name)?;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The directory listing sent to clients: `/name1/*name2/`, where `*`
    /// marks channels in `joined`. Entries that would overflow a message
    /// body are left out.
    pub async fn listing(&self, joined: &BTreeSet<String>) -> Result<String, RelayError> {
        let mut listing = String::from("/");
        for name in self.names().await? {
            let marker = if joined.contains(&name) { "*" } else { "" };
            let entry = format!("{marker}{name}/");
            if listing.len() + entry.len() > BODY_MAX {
                break;
            }
            listing.push_str(&entry);
        }
        Ok(clip(&listing, BODY_MAX).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, ChannelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::open(dir.path().join("channels")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_persists_description() {
        let (_dir, store) = store().await;
        store.create("dev", "backend work").await.unwrap();

        assert!(store.exists("dev").await);
        assert_eq!(
            store.description("dev").await.unwrap().as_deref(),
            Some("backend work")
        );
        assert_eq!(store.names().await.unwrap(), vec!["dev"]);
    }

    #[tokio::test]
    async fn delete_removes_descriptor() {
        let (_dir, store) = store().await;
        store.create("dev", "").await.unwrap();
        assert!(store.delete("dev").await.unwrap());
        assert!(!store.delete("dev").await.unwrap());
        assert!(!store.exists("dev").await);
    }

    #[tokio::test]
    async fn listing_marks_joined_channels() {
        let (_dir, store) = store().await;
        store.create("dev", "").await.unwrap();
        store.create("ops", "").await.unwrap();

        let joined = BTreeSet::from(["global".to_string(), "ops".to_string()]);
        assert_eq!(store.listing(&joined).await.unwrap(), "/dev/*ops/");
        assert_eq!(store.listing(&BTreeSet::new()).await.unwrap(), "/dev/ops/");
    }

    #[tokio::test]
    async fn empty_store_lists_a_single_separator() {
        let (_dir, store) = store().await;
        assert_eq!(store.listing(&BTreeSet::new()).await.unwrap(), "/");
    }

    #[tokio::test]
    async fn global_and_bad_names_are_refused() {
        let (_dir, store) = store().await;
        assert!(store.create(GLOBAL_CHANNEL, "").await.is_err());
        assert!(store.create("../escape", "").await.is_err());
        assert!(store.delete("much-too-long").await.is_err());
        assert!(store.names().await.unwrap().is_empty());
    }
}
