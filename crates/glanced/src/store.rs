//! The capture store: per-user enrollment images and metadata on disk.
//!
//! Layout: `<root>/<user_id>/` holds the user's uploaded images plus one
//! `info.json` metadata record. Every path is derived from a validated user
//! id, so the store never writes outside its root.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const INFO_FILE: &str = "info.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-user metadata record, all fields optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
}

/// Fields supplied with an upload. Only non-empty fields overwrite the
/// stored record; everything else is preserved.
#[derive(Debug, Clone, Default)]
pub struct InfoPatch {
    pub name: Option<String>,
    pub role: Option<String>,
    pub age: Option<String>,
}

impl InfoPatch {
    pub fn is_empty(&self) -> bool {
        let blank = |f: &Option<String>| f.as_deref().map_or(true, str::is_empty);
        blank(&self.name) && blank(&self.role) && blank(&self.age)
    }
}

/// One enrolled user as reported by `list_users`.
#[derive(Debug, Clone, Serialize)]
pub struct UserEntry {
    pub id: String,
    pub info: UserInfo,
}

pub struct CaptureStore {
    root: PathBuf,
    /// Serializes info.json read-modify-write cycles (lost-update guard).
    info_lock: Mutex<()>,
}

impl CaptureStore {
    /// Open (and create if missing) a store rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            info_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId(user_id.to_string()));
        }
        Ok(self.root.join(user_id))
    }

    /// Store uploaded bytes verbatim under the user's directory, creating it
    /// on first upload. The client filename is reduced to its basename; when
    /// absent (or unusable) a fresh name is generated. Bytes are not
    /// validated as a decodable image.
    pub fn save_capture(
        &self,
        user_id: &str,
        bytes: &[u8],
        filename: Option<&str>,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.user_dir(user_id)?;
        fs::create_dir_all(&dir)?;

        let name = filename
            .and_then(sanitize_filename)
            .unwrap_or_else(|| format!("capture-{}.jpg", Uuid::new_v4()));

        let path = dir.join(name);
        fs::write(&path, bytes)?;
        tracing::debug!(user_id, path = %path.display(), bytes = bytes.len(), "capture stored");
        Ok(path)
    }

    /// Merge metadata fields into the user's record. The existing record is
    /// read first (a corrupt or missing file reads as empty and gets repaired
    /// by the write), only supplied non-empty fields are overlaid, and the
    /// result is written back. Safe to call with an empty patch.
    pub async fn upsert_info(&self, user_id: &str, patch: &InfoPatch) -> Result<(), StoreError> {
        let dir = self.user_dir(user_id)?;

        let _guard = self.info_lock.lock().await;
        fs::create_dir_all(&dir)?;

        let path = dir.join(INFO_FILE);
        let mut info = read_info(&path);

        let overlay = |target: &mut Option<String>, value: &Option<String>| {
            if let Some(v) = value {
                if !v.is_empty() {
                    *target = Some(v.clone());
                }
            }
        };
        overlay(&mut info.name, &patch.name);
        overlay(&mut info.role, &patch.role);
        overlay(&mut info.age, &patch.age);

        fs::write(&path, serde_json::to_vec_pretty(&info)?)?;
        Ok(())
    }

    pub fn get_info(&self, user_id: &str) -> Result<UserInfo, StoreError> {
        let dir = self.user_dir(user_id)?;
        Ok(read_info(&dir.join(INFO_FILE)))
    }

    /// Every enrolled user with its metadata, sorted by id.
    pub fn list_users(&self) -> Result<Vec<UserEntry>, StoreError> {
        let mut users = Vec::new();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(users),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            let info = self.get_info(&id)?;
            users.push(UserEntry { id, info });
        }

        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    /// Every capture image labeled with its owning user id, for training.
    /// Metadata records and hidden files are not captures.
    pub fn labeled_images(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let mut images = Vec::new();

        for user in self.list_users()? {
            for entry in fs::read_dir(self.root.join(&user.id))? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name == INFO_FILE || name.starts_with('.') {
                    continue;
                }
                images.push((user.id.clone(), entry.path()));
            }
        }

        images.sort();
        Ok(images)
    }

    /// Delete every user directory and recreate the empty root. Best effort
    /// and irreversible.
    pub fn reset(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

fn valid_user_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
}

/// Basename of a client-supplied filename, or `None` when nothing usable
/// remains (path-only input, hidden name, non-UTF-8).
fn sanitize_filename(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.starts_with('.'))
        .map(str::to_owned)
}

/// Read a metadata record; corrupt or missing files read as empty.
fn read_info(path: &Path) -> UserInfo {
    fs::read(path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, CaptureStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CaptureStore::open(dir.path().join("dataset")).unwrap();
        (dir, store)
    }

    fn patch(name: Option<&str>, role: Option<&str>, age: Option<&str>) -> InfoPatch {
        InfoPatch {
            name: name.map(str::to_owned),
            role: role.map(str::to_owned),
            age: age.map(str::to_owned),
        }
    }

    #[test]
    fn test_save_capture_then_listed() {
        let (_dir, store) = open_store();

        let path = store.save_capture("alice", b"jpegbytes", Some("face.jpg")).unwrap();
        assert!(path.ends_with("alice/face.jpg"));
        assert_eq!(fs::read(&path).unwrap(), b"jpegbytes");

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "alice");
    }

    #[test]
    fn test_save_capture_generates_filename() {
        let (_dir, store) = open_store();

        let path = store.save_capture("alice", b"x", None).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("capture-") && name.ends_with(".jpg"), "{name}");
    }

    #[test]
    fn test_save_capture_strips_path_components() {
        let (_dir, store) = open_store();

        let path = store.save_capture("alice", b"x", Some("../../etc/passwd")).unwrap();
        assert!(path.ends_with("alice/passwd"), "{}", path.display());
        assert!(path.starts_with(store.root()));
    }

    #[test]
    fn test_save_capture_appends_not_overwrites() {
        let (_dir, store) = open_store();

        store.save_capture("alice", b"one", Some("a.jpg")).unwrap();
        store.save_capture("alice", b"two", Some("b.jpg")).unwrap();

        assert_eq!(store.labeled_images().unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_invalid_user_ids() {
        let (_dir, store) = open_store();

        for bad in ["", ".", "..", ".hidden", "a/b", "a\\b"] {
            assert!(
                matches!(
                    store.save_capture(bad, b"x", None),
                    Err(StoreError::InvalidUserId(_))
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_upsert_info_merges_fields() {
        let (_dir, store) = open_store();

        store.upsert_info("alice", &patch(Some("Alice"), None, None)).await.unwrap();
        store.upsert_info("alice", &patch(None, None, Some("34"))).await.unwrap();

        let info = store.get_info("alice").unwrap();
        assert_eq!(info.name.as_deref(), Some("Alice"));
        assert_eq!(info.age.as_deref(), Some("34"));
        assert_eq!(info.role, None);
    }

    #[tokio::test]
    async fn test_upsert_info_ignores_empty_strings() {
        let (_dir, store) = open_store();

        store.upsert_info("alice", &patch(Some("Alice"), Some("admin"), None)).await.unwrap();
        store.upsert_info("alice", &patch(Some(""), Some("guest"), None)).await.unwrap();

        let info = store.get_info("alice").unwrap();
        assert_eq!(info.name.as_deref(), Some("Alice"));
        assert_eq!(info.role.as_deref(), Some("guest"));
    }

    #[tokio::test]
    async fn test_upsert_info_empty_patch_is_noop() {
        let (_dir, store) = open_store();

        store.upsert_info("alice", &patch(Some("Alice"), None, None)).await.unwrap();
        store.upsert_info("alice", &InfoPatch::default()).await.unwrap();

        let info = store.get_info("alice").unwrap();
        assert_eq!(info.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_corrupt_info_reads_empty_and_repairs() {
        let (_dir, store) = open_store();

        store.save_capture("alice", b"x", None).unwrap();
        fs::write(store.root().join("alice").join(INFO_FILE), b"{ garbage").unwrap();

        assert_eq!(store.get_info("alice").unwrap(), UserInfo::default());

        store.upsert_info("alice", &patch(Some("Alice"), None, None)).await.unwrap();
        let info = store.get_info("alice").unwrap();
        assert_eq!(info.name.as_deref(), Some("Alice"));

        // The file is valid JSON again.
        let raw = fs::read(store.root().join("alice").join(INFO_FILE)).unwrap();
        assert!(serde_json::from_slice::<UserInfo>(&raw).is_ok());
    }

    #[test]
    fn test_list_users_ignores_stray_files() {
        let (_dir, store) = open_store();

        store.save_capture("bob", b"x", None).unwrap();
        fs::write(store.root().join("notes.txt"), b"not a user").unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "bob");
    }

    #[test]
    fn test_labeled_images_excludes_metadata() {
        let (_dir, store) = open_store();

        store.save_capture("alice", b"x", Some("a.jpg")).unwrap();
        fs::write(store.root().join("alice").join(INFO_FILE), b"{}").unwrap();

        let images = store.labeled_images().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].0, "alice");
        assert!(images[0].1.ends_with("alice/a.jpg"));
    }

    #[test]
    fn test_labeled_images_across_users_sorted() {
        let (_dir, store) = open_store();

        store.save_capture("bob", b"x", Some("b.jpg")).unwrap();
        store.save_capture("alice", b"x", Some("a.jpg")).unwrap();

        let images = store.labeled_images().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].0, "alice");
        assert_eq!(images[1].0, "bob");
    }

    #[test]
    fn test_reset_empties_store() {
        let (_dir, store) = open_store();

        store.save_capture("alice", b"x", None).unwrap();
        store.save_capture("bob", b"x", None).unwrap();

        store.reset().unwrap();

        assert!(store.list_users().unwrap().is_empty());
        assert!(store.root().exists());
    }

    #[test]
    fn test_info_patch_is_empty() {
        assert!(InfoPatch::default().is_empty());
        assert!(patch(Some(""), None, None).is_empty());
        assert!(!patch(Some("x"), None, None).is_empty());
    }
}
