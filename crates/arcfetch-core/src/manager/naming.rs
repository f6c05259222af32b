//! Reserving destination file names.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::url_model::{sanitize_file_name, FALLBACK_NAME};

/// What to do when the destination name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedownloadMode {
    /// Download again under the next free name (`name.1.ext`, ...).
    #[default]
    Always,
    /// Fail with `AlreadyDownloaded`.
    Never,
    /// Ask the manager's [`FileExistsPrompt`].
    Ask,
    /// Remove the existing file and download in its place.
    Replace,
}

impl std::str::FromStr for RedownloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "ask" => Ok(Self::Ask),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown redownload mode: {other}")),
        }
    }
}

/// Asked whether to download a file whose name already exists.
#[async_trait]
pub trait FileExistsPrompt: Send + Sync {
    /// Return true to download under a new name, false to cancel.
    async fn confirm_redownload(&self, file_name: &str) -> bool;
}

/// Find and reserve an unused name for `file_name` in `dir`.
///
/// Tries `name.ext`, then `name.1.ext`, `name.2.ext`, ... Each candidate is
/// created exclusively, so two calls never return the same path. `mode`
/// only applies to the first collision.
pub async fn unused_name(
    dir: &Path,
    file_name: &str,
    mode: RedownloadMode,
    prompt: Option<&dyn FileExistsPrompt>,
) -> Result<PathBuf, DownloadError> {
    let mut name = sanitize_file_name(file_name);
    if name.is_empty() {
        name = FALLBACK_NAME.to_string();
    }
    let (stem, ext) = split_extension(&name);

    let mut candidate = dir.join(&name);
    let mut counter = 0u32;
    loop {
        match reserve(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(DownloadError::disk(candidate, e)),
        }
        if counter == 0 {
            match mode {
                RedownloadMode::Never => {
                    return Err(DownloadError::AlreadyDownloaded {
                        file_name: name,
                        path: candidate,
                    });
                }
                RedownloadMode::Ask => {
                    if let Some(prompt) = prompt {
                        if !prompt.confirm_redownload(&name).await {
                            return Err(DownloadError::UserCanceled);
                        }
                    }
                }
                RedownloadMode::Always | RedownloadMode::Replace => {}
            }
        }
        counter += 1;
        candidate = dir.join(format!("{stem}.{counter}{ext}"));
    }
}

/// Remove `dir/file_name` ahead of a `Replace` download. A missing file is fine.
pub async fn remove_existing(dir: &Path, file_name: &str) -> Result<(), DownloadError> {
    let name = sanitize_file_name(file_name);
    if name.is_empty() {
        return Ok(());
    }
    let path = dir.join(name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed file to be replaced");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::disk(path, e)),
    }
}

async fn reserve(path: &Path) -> io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map(drop)
}

/// `("archive.tar", ".gz")` for `archive.tar.gz`; dotfiles have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Answer(bool);

    #[async_trait]
    impl FileExistsPrompt for Answer {
        async fn confirm_redownload(&self, _file_name: &str) -> bool {
            self.0
        }
    }

    #[test]
    fn extension_split() {
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
        assert_eq!(split_extension("noext"), ("noext", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }

    #[tokio::test]
    async fn reserves_numbered_names() {
        let dir = tempfile::tempdir().unwrap();
        let first = unused_name(dir.path(), "mod.zip", RedownloadMode::Always, None)
            .await
            .unwrap();
        let second = unused_name(dir.path(), "mod.zip", RedownloadMode::Always, None)
            .await
            .unwrap();
        let third = unused_name(dir.path(), "mod.zip", RedownloadMode::Always, None)
            .await
            .unwrap();
        assert_eq!(first, dir.path().join("mod.zip"));
        assert_eq!(second, dir.path().join("mod.1.zip"));
        assert_eq!(third, dir.path().join("mod.2.zip"));
        assert!(third.exists());
    }

    #[tokio::test]
    async fn never_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        let err = unused_name(dir.path(), "mod.zip", RedownloadMode::Never, None)
            .await
            .unwrap_err();
        match err {
            DownloadError::AlreadyDownloaded { file_name, path } => {
                assert_eq!(file_name, "mod.zip");
                assert_eq!(path, dir.path().join("mod.zip"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn ask_follows_prompt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        let declined = unused_name(dir.path(), "mod.zip", RedownloadMode::Ask, Some(&Answer(false)))
            .await
            .unwrap_err();
        assert!(matches!(declined, DownloadError::UserCanceled));

        let accepted = unused_name(dir.path(), "mod.zip", RedownloadMode::Ask, Some(&Answer(true)))
            .await
            .unwrap();
        assert_eq!(accepted, dir.path().join("mod.1.zip"));

        let no_prompt = unused_name(dir.path(), "mod.zip", RedownloadMode::Ask, None)
            .await
            .unwrap();
        assert_eq!(no_prompt, dir.path().join("mod.2.zip"));
    }

    #[tokio::test]
    async fn replace_removes_then_reserves_same_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        remove_existing(dir.path(), "mod.zip").await.unwrap();
        let path = unused_name(dir.path(), "mod.zip", RedownloadMode::Replace, None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("mod.zip"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        remove_existing(dir.path(), "missing.zip").await.unwrap();
    }

    #[tokio::test]
    async fn empty_name_becomes_unnamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = unused_name(dir.path(), "", RedownloadMode::Always, None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("unnamed"));
        let path = unused_name(dir.path(), "a/b", RedownloadMode::Always, None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("a_b"));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Never".parse::<RedownloadMode>(), Ok(RedownloadMode::Never));
        assert!("sometimes".parse::<RedownloadMode>().is_err());
    }
}
