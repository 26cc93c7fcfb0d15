use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::models::Credential;

/// File-backed credential store (`cookies.json`).
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the saved credential. Never fails: anything that cannot be read back
    /// as a complete credential counts as "no credential".
    pub fn load(&self) -> Option<Credential> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved credential at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Cannot read credential file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<Credential>(&contents) {
            Ok(credential) if credential.is_usable() => {
                debug!(
                    "Loaded {} session token(s) for {}",
                    credential.tokens.len(),
                    credential.origin
                );
                Some(credential)
            }
            Ok(_) => {
                warn!("Credential file {} holds no tokens, ignoring it", self.path.display());
                None
            }
            Err(e) => {
                warn!("Credential file {} is corrupt, ignoring it: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Writes the credential to a sibling temp file and renames it into place, so
    /// a failed save leaves the previous file as it was.
    pub fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let json = serde_json::to_vec_pretty(credential)
            .map_err(|e| StoreError::malformed(&self.path, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600)) {
                warn!("Failed to chmod 0600 {}: {}", tmp.path().display(), e);
            }
        }

        tmp.persist(&self.path).map_err(|e| StoreError::Persist {
            path: self.path.clone(),
            source: e,
        })?;

        info!("Session saved to {}", self.path.display());
        Ok(())
    }

    /// Deletes the saved credential. Returns whether a file was actually removed.
    pub fn clear(&self) -> Result<bool, StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed saved session {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionToken;
    use url::Url;

    fn credential() -> Credential {
        Credential::new(
            Url::parse("https://v.ruc.edu.cn/").unwrap(),
            vec![
                SessionToken {
                    name: "SESSION".into(),
                    value: "abc".into(),
                    host: None,
                },
                SessionToken {
                    name: "route".into(),
                    value: "r7".into(),
                    host: Some("jw.ruc.edu.cn".into()),
                },
            ],
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json"));

        let original = credential();
        store.save(&original).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, original);

        store.save(&loaded).unwrap();
        assert_eq!(store.load().unwrap(), loaded);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("missing.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn load_corrupt_or_partial_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        let store = SessionStore::new(&path);

        fs::write(&path, "{\"origin\": \"https://v.ruc.edu.cn/\", \"tok").unwrap();
        assert!(store.load().is_none());

        fs::write(&path, "{\"origin\": \"https://v.ruc.edu.cn/\", \"tokens\": []}").unwrap();
        assert!(store.load().is_none());

        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn failed_save_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        let store = SessionStore::new(&path);
        store.save(&credential()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // A regular file in place of the parent directory makes the save fail up front.
        let blocked = SessionStore::new(path.join("nested.json"));
        assert!(blocked.save(&credential()).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json"));
        store.save(&credential()).unwrap();

        assert!(store.clear().unwrap());
        assert!(!store.clear().unwrap());
        assert!(store.load().is_none());
    }
}
