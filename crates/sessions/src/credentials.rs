//! Durable per-session credential material.
//!
//! This is the only state that survives a restart: the set of stored ids is
//! the set of sessions restored at startup.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::debug,
    wagate_protocol::Credentials,
};

use crate::model::now_ms;

const CREDENTIALS_FILE: &str = "credentials.bin";
const MAX_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id '{0}'")]
    InvalidId(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error("codec: {0}")]
    Codec(#[from] postcard::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Session ids double as directory names and keys, so keep them boring.
pub fn validate_session_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// Keyed store of credential material. Writes for one id are serialized by the
/// caller; implementations only need to make each write atomic.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, StoreError>;
    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), StoreError>;
    /// Deleting a missing id is not an error.
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

// ── File backend ────────────────────────────────────────────────────

/// One directory per session under a root, holding a single credentials file.
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, StoreError> {
        let path = self.session_dir(session_id)?.join(CREDENTIALS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Credentials::new(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!("{CREDENTIALS_FILE}.tmp"));
        tokio::fs::write(&tmp, credentials.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, dir.join(CREDENTIALS_FILE)).await?;
        debug!(session_id, bytes = credentials.len(), "saved credentials");
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session_id, "deleted credentials");
                Ok(())
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_session_id(&name).is_err() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(CREDENTIALS_FILE)).await? {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── Sled backend ────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    credentials: Vec<u8>,
    saved_at: u64,
}

/// All sessions in one embedded sled database.
pub struct SledCredentialStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledCredentialStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway store that never touches disk.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree("credentials")?;
        Ok(Self { db, tree })
    }
}

#[async_trait]
impl CredentialStore for SledCredentialStore {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, StoreError> {
        validate_session_id(session_id)?;
        match self.tree.get(session_id)? {
            Some(raw) => {
                let stored: StoredCredentials = postcard::from_bytes(&raw)?;
                Ok(Some(Credentials::new(stored.credentials)))
            },
            None => Ok(None),
        }
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        let raw = postcard::to_allocvec(&StoredCredentials {
            credentials: credentials.as_bytes().to_vec(),
            saved_at: now_ms(),
        })?;
        self.tree.insert(session_id, raw)?;
        self.db.flush_async().await?;
        debug!(session_id, bytes = credentials.len(), "saved credentials");
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        if self.tree.remove(session_id)?.is_some() {
            self.db.flush_async().await?;
            debug!(session_id, "deleted credentials");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for key in self.tree.iter().keys() {
            let key = key?;
            if let Ok(id) = std::str::from_utf8(&key) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn CredentialStore) {
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        store.save("s1", &Credentials::new(b"one".to_vec())).await.unwrap();
        store.save("s2", &Credentials::new(b"two".to_vec())).await.unwrap();
        store.save("s1", &Credentials::new(b"uno".to_vec())).await.unwrap();

        assert_eq!(
            store.load("s1").await.unwrap().unwrap().as_bytes(),
            b"uno"
        );
        assert_eq!(store.list().await.unwrap(), vec!["s1", "s2"]);

        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap(), vec!["s2"]);
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileCredentialStore::new(dir.path().join("auth"))).await;
    }

    #[tokio::test]
    async fn sled_store_round_trip() {
        exercise(&SledCredentialStore::temporary().unwrap()).await;
    }

    #[tokio::test]
    async fn file_store_ignores_stray_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("half-written")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        store.save("real", &Credentials::new(b"k".to_vec())).await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["real"]);
        assert!(!dir.path().join("real").join("credentials.bin.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save("s1", &Credentials::new(b"k".to_vec())).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("s1").join(CREDENTIALS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        for bad in ["", "../etc", "a/b", "with space"] {
            assert!(matches!(
                store.load(bad).await,
                Err(StoreError::InvalidId(_))
            ));
        }
        assert!(validate_session_id("9f3c2b1a-0d4e-4f5a-8b6c-7d8e9f0a1b2c").is_ok());
    }
}
