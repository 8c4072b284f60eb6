//! Session files for running mounts.
//!
//! A mount session records itself in `<state dir>/sessions/<volume>.pid`
//! so `--unmount PATH` can find the process holding PATH and ask it to
//! stop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed session file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("volume '{volume}' already has a session (pid {pid})")]
    Running { volume: String, pid: u32 },
    #[error("no session is mounted at {0}")]
    NotFound(PathBuf),
    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: std::io::Error },
    #[error("session for {0} did not exit in time")]
    Timeout(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub pid: u32,
    pub volume: String,
    pub bucket: String,
    pub mount_path: PathBuf,
    pub started: DateTime<Utc>,
}

/// Removes the session file when dropped.
#[derive(Debug)]
pub struct SessionFile {
    path: PathBuf,
    info: SessionInfo,
}

fn session_path(dir: &Path, volume: &str) -> PathBuf {
    dir.join(format!("{volume}.pid"))
}

fn read_info(path: &Path) -> Result<SessionInfo, SessionError> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| SessionError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether `pid` names a live process we may signal.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission.
    unsafe { libc::kill(pid, 0) == 0 }
}

impl SessionFile {
    /// Record a session for `info.volume`. A file left by a process that
    /// no longer exists is replaced.
    pub fn create(dir: &Path, info: SessionInfo) -> Result<Self, SessionError> {
        std::fs::create_dir_all(dir)?;
        let path = session_path(dir, &info.volume);
        if path.exists() {
            match read_info(&path) {
                Ok(existing) if existing.pid != info.pid && process_alive(existing.pid) => {
                    return Err(SessionError::Running {
                        volume: info.volume,
                        pid: existing.pid,
                    });
                }
                Ok(existing) => {
                    tracing::warn!(pid = existing.pid, path = %path.display(), "replacing stale session file");
                }
                Err(e) => tracing::warn!(path = %path.display(), "replacing session file: {}", e),
            }
        }
        let text = serde_json::to_string_pretty(&info).map_err(|source| SessionError::Malformed {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, text)?;
        tracing::debug!(path = %path.display(), "session file written");
        Ok(Self { path, info })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to remove session file: {}", e);
        }
    }
}

/// All readable session files in `dir`.
pub fn list(dir: &Path) -> Result<Vec<(PathBuf, SessionInfo)>, SessionError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut sessions = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "pid") {
            match read_info(&path) {
                Ok(info) => sessions.push((path, info)),
                Err(e) => tracing::warn!(path = %path.display(), "skipping session file: {}", e),
            }
        }
    }
    Ok(sessions)
}

/// The session mounted at `mount_path`, if any.
pub fn find_by_mount_path(
    dir: &Path,
    mount_path: &Path,
) -> Result<Option<(PathBuf, SessionInfo)>, SessionError> {
    Ok(list(dir)?
        .into_iter()
        .find(|(_, info)| info.mount_path == mount_path))
}

/// Send SIGTERM to the session at `mount_path` and wait for its session
/// file to disappear.
pub async fn terminate(
    dir: &Path,
    mount_path: &Path,
    timeout: Duration,
) -> Result<SessionInfo, SessionError> {
    let (path, info) = find_by_mount_path(dir, mount_path)?
        .ok_or_else(|| SessionError::NotFound(mount_path.to_path_buf()))?;

    if !process_alive(info.pid) {
        tracing::warn!(pid = info.pid, "session process is gone, removing its file");
        std::fs::remove_file(&path)?;
        return Ok(info);
    }

    let pid = libc::pid_t::try_from(info.pid).map_err(|_| SessionError::Signal {
        pid: info.pid,
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: plain kill(2) on a pid read from our own session file.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(SessionError::Signal {
            pid: info.pid,
            source: std::io::Error::last_os_error(),
        });
    }
    tracing::info!(pid = info.pid, volume = info.volume, "sent SIGTERM to session");

    let wait = async {
        while path.exists() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SessionError::Timeout(mount_path.to_path_buf()))?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(volume: &str, mount_path: &str) -> SessionInfo {
        SessionInfo {
            pid: std::process::id(),
            volume: volume.to_string(),
            bucket: "b".to_string(),
            mount_path: PathBuf::from(mount_path),
            started: Utc::now(),
        }
    }

    #[test]
    fn test_session_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        let file = SessionFile::create(&sessions, info("vol", "/mnt/vol")).unwrap();
        assert!(file.path().exists());

        let (_, found) = find_by_mount_path(&sessions, Path::new("/mnt/vol"))
            .unwrap()
            .unwrap();
        assert_eq!(&found, file.info());
        assert!(find_by_mount_path(&sessions, Path::new("/mnt/other"))
            .unwrap()
            .is_none());

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
        assert!(list(&sessions).unwrap().is_empty());
    }

    #[test]
    fn test_live_session_blocks_second_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut theirs = info("vol", "/mnt/a");
        // pid 1 is always alive but is never us
        theirs.pid = 1;
        std::fs::write(
            session_path(dir.path(), "vol"),
            serde_json::to_string(&theirs).unwrap(),
        )
        .unwrap();
        if process_alive(1) {
            assert!(matches!(
                SessionFile::create(dir.path(), info("vol", "/mnt/b")),
                Err(SessionError::Running { pid: 1, .. })
            ));
        }
    }

    #[test]
    fn test_stale_session_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(session_path(dir.path(), "vol"), "not json").unwrap();
        let file = SessionFile::create(dir.path(), info("vol", "/mnt/vol")).unwrap();
        assert_eq!(list(dir.path()).unwrap().len(), 1);
        drop(file);
    }

    #[tokio::test]
    async fn test_terminate_unknown_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            terminate(dir.path(), Path::new("/mnt/x"), Duration::from_millis(10)).await,
            Err(SessionError::NotFound(_))
        ));
    }
}
