//! Process-wide mutual exclusion, so only one mirror run is active at a time.
//!
//! The lock is a file holding the owner's PID, with an exclusive advisory
//! lock held on it for the life of the run. The OS drops the advisory lock
//! when the owner dies, so a killed run never blocks the next one. The PID
//! is still checked for liveness so a record written by a holder that does
//! not take the advisory lock is respected.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{MirrorError, MirrorResult};

/// How often to reopen when the file is replaced between open and lock.
const OPEN_ATTEMPTS: usize = 3;

/// Answers whether a process id belongs to a running process.
pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Asks the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only performs the existence and permission checks.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockGuard),
    /// Another live process holds it.
    Held { pid: u32 },
}

pub struct LockManager<P: ProcessProbe = SystemProbe> {
    path: PathBuf,
    probe: P,
}

impl LockManager<SystemProbe> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LockManager {
            path: path.into(),
            probe: SystemProbe,
        }
    }
}

impl<P: ProcessProbe> LockManager<P> {
    pub fn with_probe(path: impl Into<PathBuf>, probe: P) -> Self {
        LockManager {
            path: path.into(),
            probe,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock for the current process, discarding a stale record.
    pub fn try_acquire(&self) -> MirrorResult<LockAttempt> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..OPEN_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|e| {
                    MirrorError::Lock(format!("Could not open {}: {e}", self.path.display()))
                })?;

            if let Err(e) = file.try_lock_exclusive() {
                if e.kind() != fs2::lock_contended_error().kind() {
                    return Err(MirrorError::Lock(format!(
                        "Could not lock {}: {e}",
                        self.path.display()
                    )));
                }
                let pid = self.holder_pid();
                info!(pid, path = %self.path.display(), "sync already running");
                return Ok(LockAttempt::Held { pid });
            }

            // A releasing holder unlinks the file; a lock on the unlinked
            // inode guards nothing.
            if !is_same_file(&file, &self.path)? {
                debug!(path = %self.path.display(), "lock file replaced while opening, retrying");
                continue;
            }

            let content = read_record(&mut file)?;
            let owner = content.trim();
            if !owner.is_empty() {
                match owner.parse::<u32>() {
                    Ok(pid) if self.probe.is_alive(pid) => {
                        info!(pid, path = %self.path.display(), "sync already running");
                        return Ok(LockAttempt::Held { pid });
                    }
                    _ => warn!(owner, path = %self.path.display(), "removing stale lock"),
                }
            }

            let pid = std::process::id();
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(pid.to_string().as_bytes())?;
            file.flush()?;
            debug!(pid, path = %self.path.display(), "lock acquired");

            return Ok(LockAttempt::Acquired(LockGuard {
                path: self.path.clone(),
                pid,
                released: false,
                _file: file,
            }));
        }

        Err(MirrorError::Lock(format!(
            "{} kept changing while acquiring the lock",
            self.path.display()
        )))
    }

    fn holder_pid(&self) -> u32 {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| c.trim().parse::<u32>().ok())
            .unwrap_or_default()
    }
}

fn read_record(file: &mut File) -> MirrorResult<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    Ok(content)
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> MirrorResult<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> MirrorResult<bool> {
    Ok(path.exists())
}

/// Holds the lock; releases it when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
    // Dropped after `remove` runs, so the record goes before the advisory lock.
    _file: File,
}

impl LockGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Release now, reporting failures instead of only logging them.
    pub fn release(mut self) -> MirrorResult<()> {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> MirrorResult<()> {
        // Only remove the file if it is still ours.
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim() == self.pid.to_string() => {
                std::fs::remove_file(&self.path)?;
                debug!(pid = self.pid, path = %self.path.display(), "lock released");
                Ok(())
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "lock file now belongs to another process, leaving it");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), error = %e, "lock release failed");
        }
    }
}
