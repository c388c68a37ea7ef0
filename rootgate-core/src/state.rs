//! Session state directory
//!
//! The state directory is the only filesystem state shared between the
//! coordinator, the child and the drivers. It is passed around explicitly;
//! nothing in rootgate reads it from a global.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{AccessFlags, access, mkdtemp};

use crate::{Error, ProcessId, Result};

/// Documented environment variable exported to the child and the target
pub const STATE_DIR_ENV: &str = "ROOTGATE_STATE_DIR";

/// Lock file held by the coordinator for the whole session
pub const LOCK_FILE: &str = "lock";

/// File holding the child's pid
pub const CHILD_PID_FILE: &str = "child_pid";

/// Port control socket
pub const API_SOCKET: &str = "api.sock";

/// slirp4netns API socket
pub const SLIRP4NETNS_SOCKET: &str = "slirp4netns.sock";

/// vpnkit ethernet socket
pub const VPNKIT_SOCKET: &str = "vpnkit-ethernet.sock";

/// Socket of the builtin port driver's dial helper
pub const BUILTIN_SOCKET: &str = "builtin.sock";

/// Socket the builtin dial helper connects to once it listens
pub const BUILTIN_READY_SOCKET: &str = "builtin-ready.sock";

/// Generated `resolv.conf` when `/etc` is not copied up
pub const RESOLV_CONF: &str = "resolv.conf";

/// Generated `hosts` when `/etc` is not copied up
pub const HOSTS: &str = "hosts";

/// Handle to a session state directory
#[derive(Debug)]
pub struct StateDir {
    path: PathBuf,
    created: bool,
    lock: Option<Flock<File>>,
}

impl StateDir {
    /// Resolve or create the state directory
    ///
    /// With `None`, a private directory is created under the system temp
    /// directory and removed again by [`StateDir::cleanup`].
    ///
    /// # Errors
    /// Returns a state directory error naming the path if it cannot be
    /// created or is not writable
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let (path, created) = match path {
            Some(path) => {
                let path = std::path::absolute(path).map_err(|e| Error::StateDir {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
                fs::create_dir_all(&path).map_err(|e| Error::StateDir {
                    path: path.clone(),
                    message: format!("cannot create: {e}"),
                })?;
                (path, false)
            }
            None => {
                let template = std::env::temp_dir().join("rootgate.XXXXXX");
                let path = mkdtemp(template.as_path()).map_err(|e| Error::StateDir {
                    path: template.clone(),
                    message: format!("cannot create: {e}"),
                })?;
                (path, true)
            }
        };

        access(path.as_path(), AccessFlags::W_OK | AccessFlags::X_OK).map_err(|e| Error::StateDir {
            path: path.clone(),
            message: format!("not writable: {e}"),
        })?;

        tracing::debug!(state_dir = %path.display(), created, "State directory ready");
        Ok(Self {
            path,
            created,
            lock: None,
        })
    }

    /// Refer to an existing state directory without owning it
    ///
    /// Used by the child and by companion tooling.
    #[must_use]
    pub fn attach(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
            lock: None,
        }
    }

    /// Directory path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the directory
    #[must_use]
    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Take the session lock
    ///
    /// # Errors
    /// Returns a state directory error if another session holds it
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let lock_path = self.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::StateDir {
                path: lock_path.clone(),
                message: format!("cannot open lock file: {e}"),
            })?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            Error::StateDir {
                path: self.path.clone(),
                message: format!("already in use by another session ({errno})"),
            }
        })?;
        self.lock = Some(lock);
        Ok(())
    }

    /// Whether this handle holds the session lock
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Record the child's pid
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn write_child_pid(&self, pid: ProcessId) -> Result<()> {
        let path = self.join(CHILD_PID_FILE);
        fs::write(&path, pid.to_string()).map_err(|e| Error::StateDir {
            path,
            message: format!("cannot write pid file: {e}"),
        })
    }

    /// Read the recorded child pid, if any
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be parsed
    pub fn child_pid(&self) -> Result<Option<ProcessId>> {
        let path = self.join(CHILD_PID_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => content
                .trim()
                .parse::<i32>()
                .map(|pid| Some(ProcessId::from_raw(pid)))
                .map_err(|e| Error::StateDir {
                    path,
                    message: format!("corrupt pid file: {e}"),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove session files, and the directory itself if it was auto-created
    ///
    /// # Errors
    /// Returns error if an auto-created directory cannot be removed
    pub fn cleanup(mut self) -> Result<()> {
        for name in [
            CHILD_PID_FILE,
            API_SOCKET,
            SLIRP4NETNS_SOCKET,
            VPNKIT_SOCKET,
            BUILTIN_SOCKET,
            BUILTIN_READY_SOCKET,
            RESOLV_CONF,
            HOSTS,
        ] {
            let _ = fs::remove_file(self.join(name));
        }
        self.lock = None;
        if self.created {
            tracing::debug!(state_dir = %self.path.display(), "Removing state directory");
            fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }
}
