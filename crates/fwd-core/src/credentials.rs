use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::info;

use crate::{domain::AccountId, Result};

/// Location of the per-account session files the protocol client resumes
/// from. Deleting a file is the only way to invalidate a resumable session.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Expected file name for an account (`<phone>.session`).
    pub fn file_name(account: &AccountId) -> String {
        format!("{}.session", account.as_str())
    }

    pub fn path_for(&self, account: &AccountId) -> PathBuf {
        self.dir.join(Self::file_name(account))
    }

    pub fn exists(&self, account: &AccountId) -> bool {
        self.path_for(account).is_file()
    }

    /// Remove the account's session file. Returns whether one existed.
    pub fn delete(&self, account: &AccountId) -> Result<bool> {
        let path = self.path_for(account);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(account = %account, "session file removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
