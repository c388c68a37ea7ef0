//! Namespace lifecycle management

use nix::mount::{MsFlags, mount};
use nix::sched::unshare;
use rootgate_core::{Error, ProcessId, Result};

use crate::config::NamespaceConfig;

/// Namespace manager for creating namespaces in the calling process
#[derive(Debug)]
pub struct NamespaceManager {
    config: NamespaceConfig,
    created: bool,
}

impl NamespaceManager {
    /// Create a new namespace manager
    #[must_use]
    pub const fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            created: false,
        }
    }

    /// Get the configuration
    #[must_use]
    pub const fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Check if namespaces have been created
    #[must_use]
    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Create the configured namespaces with a single unshare(2)
    ///
    /// Must be called while the process is single-threaded, otherwise the
    /// kernel refuses `CLONE_NEWUSER`.
    ///
    /// # Errors
    /// Returns error if namespace creation fails (typically when
    /// unprivileged user namespaces are disabled)
    pub fn create(&mut self) -> Result<()> {
        if self.created {
            tracing::warn!("Namespaces already created");
            return Ok(());
        }

        if !self.config.has_any() {
            tracing::debug!("No namespaces requested");
            self.created = true;
            return Ok(());
        }

        let flags = self.config.to_clone_flags();
        let enabled = self.config.enabled_namespaces();

        tracing::debug!(namespaces = ?enabled, "Creating namespaces");

        unshare(flags).map_err(|e| {
            tracing::error!(
                error = %e,
                namespaces = ?enabled,
                "Failed to create namespaces"
            );
            Error::Namespace {
                message: format!("Failed to unshare {}: {e}", enabled.join(",")),
            }
        })?;

        self.created = true;
        tracing::debug!(namespaces = ?enabled, "Namespaces created");
        Ok(())
    }

    /// Make the whole mount tree a recursive slave of the host
    ///
    /// Mounts made afterwards in this namespace never propagate back.
    ///
    /// # Errors
    /// Returns error if the propagation change fails
    pub fn make_mounts_slave(&self) -> Result<()> {
        if !self.config.mount {
            return Ok(());
        }
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None::<&str>,
        )
        .map_err(|e| Error::Namespace {
            message: format!("Failed to make mounts rslave: {e}"),
        })
    }

    /// Get current namespace IDs
    ///
    /// # Errors
    /// Returns error if reading namespace IDs fails
    pub fn current_namespaces() -> Result<NamespaceInfo> {
        Self::namespaces_for_pid(ProcessId::current())
    }

    /// Get namespace IDs for a specific PID
    ///
    /// # Errors
    /// Returns error if the process does not exist
    pub fn namespaces_for_pid(pid: ProcessId) -> Result<NamespaceInfo> {
        let base_path = format!("/proc/{pid}/ns");
        if !std::path::Path::new(&base_path).exists() {
            return Err(Error::Namespace {
                message: format!("No such process: {pid}"),
            });
        }

        let read_ns = |name: &str| {
            std::fs::read_link(format!("{base_path}/{name}"))
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        };

        Ok(NamespaceInfo {
            net: read_ns("net"),
            mnt: read_ns("mnt"),
            user: read_ns("user"),
        })
    }
}

/// Namespace identities of a process, as shown under `/proc/<pid>/ns`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Network namespace ID
    pub net: Option<String>,
    /// Mount namespace ID
    pub mnt: Option<String>,
    /// User namespace ID
    pub user: Option<String>,
}

impl NamespaceInfo {
    /// Names of the namespaces that differ from `other`
    #[must_use]
    pub fn differing(&self, other: &Self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.user != other.user {
            names.push("user");
        }
        if self.net != other.net {
            names.push("net");
        }
        if self.mnt != other.mnt {
            names.push("mnt");
        }
        names
    }
}

impl std::fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "user={} net={} mnt={}",
            show(&self.user),
            show(&self.net),
            show(&self.mnt)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_creation() {
        let manager = NamespaceManager::new(NamespaceConfig::new().with_network(true));

        assert!(!manager.is_created());
        assert!(manager.config().has_any());
    }

    #[test]
    fn test_create_without_namespaces_is_noop() {
        let mut manager = NamespaceManager::new(NamespaceConfig::new());
        let before = NamespaceManager::current_namespaces().unwrap();
        manager.create().unwrap();
        assert!(manager.is_created());
        assert!(manager.make_mounts_slave().is_ok());
        let after = NamespaceManager::current_namespaces().unwrap();
        assert!(before.differing(&after).is_empty());
    }

    #[test]
    fn test_current_namespaces() {
        let info = NamespaceManager::current_namespaces().unwrap();
        assert!(info.net.is_some());
        assert!(info.user.is_some());
    }

    #[test]
    fn test_unknown_pid() {
        assert!(NamespaceManager::namespaces_for_pid(ProcessId::from_raw(i32::MAX)).is_err());
    }

    #[test]
    fn test_differing() {
        let a = NamespaceInfo {
            net: Some("net:[1]".to_string()),
            mnt: Some("mnt:[2]".to_string()),
            user: Some("user:[3]".to_string()),
        };
        let mut b = a.clone();
        b.net = Some("net:[9]".to_string());
        assert_eq!(a.differing(&b), vec!["net"]);
        assert!(a.to_string().contains("net=net:[1]"));
    }
}
