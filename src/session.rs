//! Session persistence and the advisory session lock
//!
//! A session directory holds everything needed to resume orchestration
//! after a restart: `session.json` with the roster and the id counter,
//! and `session.lock` while an engine is processing the roster.
//!
//! The lock is advisory and conflict is an error, never a wait: a second
//! engine on the same session reports which process holds it and stops.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collection::TaskUnit;
use crate::error::GridflowError;

const SESSION_FILE: &str = "session.json";
const LOCK_FILE: &str = "session.lock";

// ============================================================================
// SESSION DATA
// ============================================================================

/// Everything the engine persists between invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    /// Generator for `job-NNNNNN` ids; never reused within a session
    pub next_id: u64,
    pub roster: Vec<TaskUnit>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            next_id: 1,
            roster: Vec::new(),
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Where session data lives between invocations.
pub trait SessionStore {
    fn load(&self) -> Result<SessionData, GridflowError>;
    fn save(&self, data: &SessionData) -> Result<(), GridflowError>;
}

/// JSON file in a session directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }
}

impl SessionStore for FileSessionStore {
    /// Missing file means a fresh session, not an error.
    fn load(&self) -> Result<SessionData, GridflowError> {
        let path = self.session_path();
        if !path.exists() {
            debug!(path = %path.display(), "no session file; starting fresh");
            return Ok(SessionData::default());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write-then-rename, so a crash mid-save never corrupts the session.
    fn save(&self, data: &SessionData) -> Result<(), GridflowError> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("{}.tmp", SESSION_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        fs::rename(&tmp, self.session_path())?;
        Ok(())
    }
}

// ============================================================================
// LOCK
// ============================================================================

/// RAII guard on a session directory. Held for the duration of roster
/// processing; dropped (or crashed) it releases.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquire the lock or report who holds it. A lock left behind by a
    /// dead process is reclaimed.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self, GridflowError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);

        // One reclaim attempt at most; a second conflict is a real one.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if process_alive(pid) => {
                            return Err(GridflowError::LockConflict { pid });
                        }
                        _ => {
                            // Holder is gone or the file is garbage
                            warn!(path = %path.display(), "reclaiming stale session lock");
                            if let Some(pid) = reclaim(&path)? {
                                return Err(GridflowError::LockConflict { pid });
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(GridflowError::LockConflict { pid: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Remove a stale lock file without knocking out a racing acquirer: the
/// file is taken with an atomic rename first, then re-checked. If another
/// process reclaimed and relocked in between, its lock is renamed back
/// and the holder pid is returned as a conflict.
fn reclaim(path: &Path) -> Result<Option<u32>, GridflowError> {
    let claim = path.with_extension(format!("lock.{}", std::process::id()));
    match fs::rename(path, &claim) {
        Ok(()) => {}
        // Already removed by someone else; retry the create
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let holder = fs::read_to_string(&claim)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    match holder {
        Some(pid) if process_alive(pid) => {
            let _ = fs::rename(&claim, path);
            Ok(Some(pid))
        }
        _ => {
            let _ = fs::remove_file(&claim);
            Ok(None)
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Without a portable probe, assume the holder is alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

// ============================================================================
// TESTS
// ============================================================================
