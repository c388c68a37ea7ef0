//! Namespace configuration

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Which namespaces the child creates
///
/// A user namespace is implied as soon as any other namespace is requested,
/// since an unprivileged process cannot create the others without it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Create a user namespace
    pub user: bool,

    /// Create a network namespace
    pub network: bool,

    /// Create a mount namespace
    pub mount: bool,
}

impl NamespaceConfig {
    /// Create a configuration that creates no namespaces
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespaces needed by a session
    ///
    /// A non-host network needs its own network namespace plus a mount
    /// namespace for sysfs and name resolution; copy-up needs a mount
    /// namespace.
    #[must_use]
    pub fn for_session(isolated_network: bool, copy_up: bool) -> Self {
        Self::new()
            .with_network(isolated_network)
            .with_mount(isolated_network || copy_up)
    }

    /// Enable user namespace
    #[must_use]
    pub const fn with_user(mut self, enable: bool) -> Self {
        self.user = enable;
        self
    }

    /// Enable network namespace
    #[must_use]
    pub const fn with_network(mut self, enable: bool) -> Self {
        self.network = enable;
        self
    }

    /// Enable mount namespace
    #[must_use]
    pub const fn with_mount(mut self, enable: bool) -> Self {
        self.mount = enable;
        self
    }

    /// Whether a user namespace will be created, explicitly or implied
    #[must_use]
    pub const fn needs_user(&self) -> bool {
        self.user || self.network || self.mount
    }

    /// Convert to clone flags for unshare(2)
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.needs_user() {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }

        flags
    }

    /// Check if any namespaces are enabled
    #[must_use]
    pub const fn has_any(&self) -> bool {
        self.needs_user()
    }

    /// Get list of enabled namespace names
    #[must_use]
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = Vec::new();

        if self.needs_user() {
            namespaces.push("user");
        }
        if self.network {
            namespaces.push("net");
        }
        if self.mount {
            namespaces.push("mnt");
        }

        namespaces
    }
}
