//! Process helpers shared by the coordinator, the child and the drivers
//!
//! This module uses `unsafe` for `pre_exec` hooks and `fork()`. Code running
//! between fork and exec sticks to async-signal-safe libc calls.

#![allow(unsafe_code)]

use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, setsid};

use crate::{Error, Result};

/// Exit code for any bootstrap or driver failure before the target runs
pub const EXIT_BOOTSTRAP_FAILURE: i32 = 125;

/// Exit code when the target exists but cannot be executed
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// Exit code when the target cannot be found
pub const EXIT_NOT_FOUND: i32 = 127;

/// Map a wait status to a shell-style exit code
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => EXIT_BOOTSTRAP_FAILURE,
    }
}

/// Find an executable on `PATH`, or check an explicit path
///
/// # Errors
/// Returns [`Error::BinaryNotFound`] if nothing executable matches
pub fn lookup_binary(name: &str) -> Result<PathBuf> {
    let not_found = || Error::BinaryNotFound {
        name: name.to_string(),
    };

    if name.contains('/') {
        let path = Path::new(name);
        return if is_executable(path) {
            Ok(path.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let search = std::env::var_os("PATH").ok_or_else(not_found)?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(not_found)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Arrange for a spawned process to be killed when its parent dies
pub fn kill_with_parent(cmd: &mut tokio::process::Command) {
    // SAFETY: prctl is async-signal-safe
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Let a spawned process inherit `fd` under the same number
pub fn pass_fd(cmd: &mut tokio::process::Command, fd: RawFd) {
    // SAFETY: fcntl is async-signal-safe
    unsafe {
        cmd.pre_exec(move || clear_cloexec(fd));
    }
}

/// Let a spawned process inherit `fd` as descriptor `target`
pub fn pass_fd_as(cmd: &mut tokio::process::Command, fd: RawFd, target: RawFd) {
    // SAFETY: dup2 and fcntl are async-signal-safe
    unsafe {
        cmd.pre_exec(move || {
            if fd == target {
                return clear_cloexec(fd);
            }
            if libc::dup2(fd, target) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: plain fcntl calls on an inherited descriptor
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Stop a backend process: SIGTERM, then SIGKILL after `grace`
///
/// Returns `None` if the process was already reaped.
///
/// # Errors
/// Returns error if waiting on the process fails
pub async fn terminate(
    child: &mut tokio::process::Child,
    grace: Duration,
) -> Result<Option<ExitStatus>> {
    let Some(pid) = child.id() else {
        return Ok(None);
    };
    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        tracing::debug!(pid = %pid, error = %e, "SIGTERM failed");
    }
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Ok(Some(status?));
    }
    tracing::debug!(pid = %pid, "Grace period elapsed, killing");
    child.kill().await?;
    Ok(Some(child.wait().await?))
}

/// Run `body` in a detached process that outlives the caller's exec
///
/// The process is double-forked so the caller never has to reap it. Every
/// descriptor above stderr except `keep` is closed and stdin/stdout point
/// at `/dev/null`. Must only be called from a single-threaded process.
///
/// # Errors
/// Returns error if forking fails
pub fn daemonize<F>(name: &str, keep: &[RawFd], body: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    // SAFETY: the caller guarantees there are no other threads
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => break,
                    Ok(WaitStatus::Exited(_, code)) => {
                        return Err(Error::Namespace {
                            message: format!("{name}: detaching failed with code {code}"),
                        });
                    }
                    Ok(_) | Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::debug!(helper = name, "Helper detached");
            Ok(())
        }
        ForkResult::Child => {
            let _ = setsid();
            // SAFETY: still single-threaded
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                Ok(ForkResult::Child) => {}
                Err(_) => unsafe { libc::_exit(1) },
            }
            close_inherited(keep);
            let code = match body() {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(helper = name, error = %e, "Helper failed");
                    1
                }
            };
            // SAFETY: leave without running the parent's atexit handlers
            unsafe { libc::_exit(code) }
        }
    }
}

fn close_inherited(keep: &[RawFd]) {
    let fds: Vec<RawFd> = std::fs::read_dir("/proc/self/fd")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    // SAFETY: closing descriptors this process does not use
    unsafe {
        for fd in fds {
            if fd > 2 && !keep.contains(&fd) {
                libc::close(fd);
            }
        }
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            if null > 2 && !keep.contains(&null) {
                libc::close(null);
            }
        }
    }
}
