//! Replacing the child with the target command

use std::ffi::CString;

use nix::errno::Errno;
use rootgate_core::process::{EXIT_CANNOT_EXECUTE, EXIT_NOT_FOUND};
use tracing::debug;

/// Why the target could not be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    /// Exit code the caller should use (127 or 126)
    pub code: i32,
    /// Human-readable reason
    pub message: String,
}

/// Replace the current process image with `command`
///
/// `command[0]` is looked up on `PATH` when it contains no slash. Only
/// returns on failure.
#[must_use]
pub fn exec_target(command: &[String]) -> ExecFailure {
    let Some(program) = command.first() else {
        return ExecFailure {
            code: EXIT_NOT_FOUND,
            message: "no command given".to_string(),
        };
    };

    let args: Result<Vec<CString>, _> = command
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect();
    let args = match args {
        Ok(args) => args,
        Err(e) => {
            return ExecFailure {
                code: EXIT_CANNOT_EXECUTE,
                message: format!("invalid argument for {program}: {e}"),
            };
        }
    };

    debug!(program = %program, argc = args.len(), "Executing target");

    let Err(errno) = nix::unistd::execvp(&args[0], &args);
    failure_for(program, errno)
}

fn failure_for(program: &str, errno: Errno) -> ExecFailure {
    let code = match errno {
        Errno::ENOENT | Errno::ENOTDIR => EXIT_NOT_FOUND,
        _ => EXIT_CANNOT_EXECUTE,
    };
    ExecFailure {
        code,
        message: format!("cannot execute {program}: {}", errno.desc()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command() {
        let failure = exec_target(&[]);
        assert_eq!(failure.code, EXIT_NOT_FOUND);
    }

    #[test]
    fn test_missing_binary_is_127() {
        let failure = exec_target(&["/nonexistent/rootgate-target".to_string()]);
        assert_eq!(failure.code, EXIT_NOT_FOUND);
        assert!(failure.message.contains("/nonexistent/rootgate-target"));
    }

    #[test]
    fn test_not_executable_is_126() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"data").unwrap();
        let failure = exec_target(&[file.to_string_lossy().into_owned()]);
        assert_eq!(failure.code, EXIT_CANNOT_EXECUTE);
    }

    #[test]
    fn test_nul_in_argument_is_126() {
        let failure = exec_target(&["sh".to_string(), "a\0b".to_string()]);
        assert_eq!(failure.code, EXIT_CANNOT_EXECUTE);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(failure_for("x", Errno::ENOENT).code, 127);
        assert_eq!(failure_for("x", Errno::EACCES).code, 126);
        assert_eq!(failure_for("x", Errno::ENOEXEC).code, 126);
    }
}
