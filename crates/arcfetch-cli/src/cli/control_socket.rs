//! Control socket: server (during `arcfetch run`) and client (for `pause` and `remove`).
//! Protocol: one line per command: "pause <id>", "cancel <id>" or "cancel <id> delete".

use anyhow::Result;
use arcfetch_core::config;
use arcfetch_core::observer::DownloadObserver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause(String),
    Cancel { id: String, delete_file: bool },
}

impl ControlCommand {
    /// Parse one protocol line. Malformed lines give `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next()?;
        let id = words.next()?.to_string();
        let rest = words.next();
        if words.next().is_some() {
            return None;
        }
        match (verb, rest) {
            ("pause", None) => Some(ControlCommand::Pause(id)),
            ("cancel", None) => Some(ControlCommand::Cancel {
                id,
                delete_file: false,
            }),
            ("cancel", Some("delete")) => Some(ControlCommand::Cancel {
                id,
                delete_file: true,
            }),
            _ => None,
        }
    }

    fn to_line(&self) -> String {
        match self {
            ControlCommand::Pause(id) => format!("pause {id}\n"),
            ControlCommand::Cancel {
                id,
                delete_file: false,
            } => format!("cancel {id}\n"),
            ControlCommand::Cancel {
                id,
                delete_file: true,
            } => format!("cancel {id} delete\n"),
        }
    }
}

/// `~/.local/state/arcfetch/control.sock`.
pub fn default_path() -> Result<PathBuf> {
    Ok(config::state_dir()?.join("control.sock"))
}

/// Spawns a task that listens on `path` and forwards each command line to
/// the observer. Ignores malformed lines.
pub fn spawn_control_listener(
    observer: Arc<DownloadObserver>,
    path: impl AsRef<Path>,
) -> Result<tokio::task::JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let observer = Arc::clone(&observer);
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(stream).lines();
                        while let Ok(Some(line)) = reader.next_line().await {
                            match ControlCommand::parse(&line) {
                                Some(command) => apply(&observer, command).await,
                                None => tracing::debug!(line = %line.trim(), "ignoring control line"),
                            }
                        }
                    });
                }
                Err(e) => tracing::debug!("control socket accept: {}", e),
            }
        }
    });
    Ok(handle)
}

async fn apply(observer: &DownloadObserver, command: ControlCommand) {
    let (id, result) = match &command {
        ControlCommand::Pause(id) => (id, observer.pause(id).await),
        ControlCommand::Cancel { id, delete_file } => (id, observer.cancel(id, *delete_file).await),
    };
    match result {
        Ok(()) => tracing::info!(id = %id, ?command, "control command applied"),
        Err(e) => tracing::warn!(id = %id, ?command, "control command failed: {:#}", e),
    }
}

/// Sends `command` to a running `arcfetch run`. Returns false when no run
/// process is listening.
pub async fn send(socket_path: &Path, command: &ControlCommand) -> Result<bool> {
    if !socket_path.exists() {
        return Ok(false);
    }
    let mut stream = match UnixStream::connect(socket_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(path = %socket_path.display(), "control socket connect: {}", e);
            return Ok(false);
        }
    };
    stream.write_all(command.to_line().as_bytes()).await?;
    stream.shutdown().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pause_and_cancel() {
        assert_eq!(
            ControlCommand::parse("pause 7"),
            Some(ControlCommand::Pause("7".into()))
        );
        assert_eq!(
            ControlCommand::parse("  cancel 3 \n"),
            Some(ControlCommand::Cancel {
                id: "3".into(),
                delete_file: false
            })
        );
        assert_eq!(
            ControlCommand::parse("cancel 3 delete"),
            Some(ControlCommand::Cancel {
                id: "3".into(),
                delete_file: true
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(ControlCommand::parse(""), None);
        assert_eq!(ControlCommand::parse("pause"), None);
        assert_eq!(ControlCommand::parse("resume 1"), None);
        assert_eq!(ControlCommand::parse("pause 1 now"), None);
        assert_eq!(ControlCommand::parse("cancel 1 delete please"), None);
    }

    #[test]
    fn lines_parse_back() {
        for command in [
            ControlCommand::Pause("12".into()),
            ControlCommand::Cancel {
                id: "5".into(),
                delete_file: true,
            },
        ] {
            assert_eq!(ControlCommand::parse(&command.to_line()), Some(command.clone()));
        }
    }

    #[tokio::test]
    async fn send_without_listener_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        assert!(!send(&path, &ControlCommand::Pause("1".into())).await.unwrap());
    }
}
