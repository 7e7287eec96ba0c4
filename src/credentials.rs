use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::util::deserialize_opt_id;

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("credentials file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("credentials file is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Signed-in user as persisted by the login flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub token: String,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    data: Credentials,
}

/// File-backed credential store holding `{"data": {...}}`.
///
/// The last loaded or saved value is cached so request paths do not touch
/// the disk.
pub struct CredentialStore {
    path: PathBuf,
    cached: RwLock<Option<Credentials>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. A missing file means signed out.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError`] when the file exists but cannot be read
    /// or parsed.
    pub fn load(&self) -> Result<Option<Credentials>, CredentialsError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                *self.cached.write() = None;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let stored: StoredCredentials = serde_json::from_str(&contents)?;
        let credentials = (!stored.data.token.trim().is_empty()).then_some(stored.data);
        self.cached.write().clone_from(&credentials);
        Ok(credentials)
    }

    /// # Errors
    ///
    /// Returns [`CredentialsError::Io`] when the file cannot be written.
    pub fn save(&self, credentials: &Credentials) -> Result<(), CredentialsError> {
        let stored = StoredCredentials {
            data: credentials.clone(),
        };
        let json = serde_json::to_vec_pretty(&stored)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        *self.cached.write() = Some(credentials.clone());
        Ok(())
    }

    /// Forget the signed-in user. Succeeds when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::Io`] when the file exists but cannot be
    /// removed.
    pub fn clear(&self) -> Result<(), CredentialsError> {
        *self.cached.write() = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<Credentials> {
        self.cached.read().clone()
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.cached.read().as_ref().map(|c| c.token.clone())
    }
}
