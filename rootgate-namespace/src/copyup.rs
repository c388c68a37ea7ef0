//! Copy-up: making read-only paths writable inside the mount namespace

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::mount::{MsFlags, mount};
use nix::unistd::mkdtemp;
use rootgate_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Available copy-up drivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyUpMode {
    /// tmpfs over the path, entries symlinked into a bind mount of the original
    #[default]
    #[serde(rename = "tmpfs+symlink")]
    TmpfsSymlink,
}

impl CopyUpMode {
    /// Flag value
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TmpfsSymlink => "tmpfs+symlink",
        }
    }

    /// Instantiate the driver
    #[must_use]
    pub fn driver(self) -> Box<dyn CopyUpDriver> {
        match self {
            Self::TmpfsSymlink => Box::new(TmpfsSymlink::new()),
        }
    }
}

impl FromStr for CopyUpMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tmpfs+symlink" => Ok(Self::TmpfsSymlink),
            other => Err(Error::invalid_config(format!("unknown copy-up mode: {other}"))),
        }
    }
}

impl std::fmt::Display for CopyUpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy-up contract consumed by the child
pub trait CopyUpDriver: Send {
    /// Make every path writable, preserving its visible entries
    ///
    /// Paths already handled by an earlier call are skipped. Returns the
    /// paths copied up by this call.
    ///
    /// # Errors
    /// Returns [`Error::CopyUp`] naming the first path that failed
    fn copy_up(&mut self, paths: &[PathBuf]) -> Result<Vec<PathBuf>>;
}

/// Reject copy-up paths that would hide the state directory
///
/// # Errors
/// Returns a configuration error naming the offending path
pub fn check_state_dir(paths: &[PathBuf], state_dir: &Path) -> Result<()> {
    for path in paths {
        if state_dir.starts_with(path) {
            return Err(Error::invalid_config(format!(
                "copy-up path {} contains the state directory {}",
                path.display(),
                state_dir.display()
            )));
        }
    }
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let err = |message: &str| Error::CopyUp {
        path: path.to_path_buf(),
        message: message.to_string(),
    };
    if !path.is_absolute() {
        return Err(err("path must be absolute"));
    }
    if !path.is_dir() {
        return Err(err("not a directory"));
    }
    Ok(())
}

/// The `tmpfs+symlink` driver
#[derive(Debug)]
pub struct TmpfsSymlink {
    scratch: PathBuf,
    done: BTreeSet<PathBuf>,
}

impl Default for TmpfsSymlink {
    fn default() -> Self {
        Self::new()
    }
}

impl TmpfsSymlink {
    /// Driver keeping its bind mounts under `/tmp`
    #[must_use]
    pub fn new() -> Self {
        Self::with_scratch("/tmp")
    }

    /// Driver keeping its bind mounts under `scratch`
    #[must_use]
    pub fn with_scratch(scratch: impl Into<PathBuf>) -> Self {
        Self {
            scratch: scratch.into(),
            done: BTreeSet::new(),
        }
    }

    fn copy_up_one(&self, path: &Path) -> Result<()> {
        let fail = |message: String| Error::CopyUp {
            path: path.to_path_buf(),
            message,
        };

        let template = self.scratch.join("rootgate-copyup.XXXXXX");
        let original = mkdtemp(template.as_path())
            .map_err(|e| fail(format!("cannot create bind directory: {e}")))?;

        mount(
            Some(path),
            original.as_path(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| fail(format!("bind mount failed: {e}")))?;

        mount(
            Some("tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::empty(),
            Some("mode=755"),
        )
        .map_err(|e| fail(format!("tmpfs mount failed: {e}")))?;

        let entries = fs::read_dir(&original).map_err(|e| fail(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| fail(e.to_string()))?;
            let name = entry.file_name();
            let source = entry.path();
            let target = path.join(&name);
            let file_type = entry.file_type().map_err(|e| fail(e.to_string()))?;

            let link_to = if file_type.is_symlink() {
                fs::read_link(&source).map_err(|e| fail(e.to_string()))?
            } else {
                source
            };
            symlink(&link_to, &target).map_err(|e| {
                fail(format!("cannot recreate {}: {e}", name.to_string_lossy()))
            })?;
        }

        tracing::debug!(
            path = %path.display(),
            original = %original.display(),
            "Copied up"
        );
        Ok(())
    }
}

impl CopyUpDriver for TmpfsSymlink {
    fn copy_up(&mut self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::new();
        for path in paths {
            if self.done.contains(path) {
                tracing::debug!(path = %path.display(), "Already copied up");
                continue;
            }
            validate(path)?;
            self.copy_up_one(path)?;
            self.done.insert(path.clone());
            copied.push(path.clone());
        }
        Ok(copied)
    }
}

/// Test double recording which paths were made writable
#[derive(Debug, Default)]
pub struct MemoryCopyUp {
    writable: BTreeSet<PathBuf>,
    calls: usize,
}

impl MemoryCopyUp {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` was copied up
    #[must_use]
    pub fn is_writable(&self, path: &Path) -> bool {
        self.writable.contains(path)
    }

    /// Every path copied up so far
    #[must_use]
    pub const fn writable(&self) -> &BTreeSet<PathBuf> {
        &self.writable
    }

    /// Number of `copy_up` calls
    #[must_use]
    pub const fn calls(&self) -> usize {
        self.calls
    }
}

impl CopyUpDriver for MemoryCopyUp {
    fn copy_up(&mut self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.calls += 1;
        let mut copied = Vec::new();
        for path in paths {
            if self.writable.contains(path) {
                continue;
            }
            validate(path)?;
            self.writable.insert(path.clone());
            copied.push(path.clone());
        }
        Ok(copied)
    }
}
