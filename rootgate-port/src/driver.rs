//! Port driver contract
//!
//! Port drivers make ports bound inside the isolated network namespace
//! reachable from the host. The parent-side half accepts mappings for the
//! whole session; the child-side half prepares whatever the backend needs
//! inside the namespace before the target starts.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use rootgate_core::process::lookup_binary;
use rootgate_core::{
    Error, NetworkMessage, PortId, PortMessage, PortSpec, PortStatus, ProcessId, Result,
};

use crate::builtin::{BuiltinChild, BuiltinParent};
use crate::slirp4netns::Slirp4netnsPortParent;
use crate::socat::SocatParent;

/// Available port drivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PortDriverKind {
    /// No port forwarding
    #[default]
    None,
    /// Host-side relay dialing through a helper in the namespace
    Builtin,
    /// Host forwards through the slirp4netns API socket
    Slirp4netns,
    /// One socat process per mapping
    Socat,
}

impl PortDriverKind {
    /// Flag value
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Builtin => "builtin",
            Self::Slirp4netns => "slirp4netns",
            Self::Socat => "socat",
        }
    }

    /// Whether a driver is selected at all
    #[must_use]
    pub const fn is_none(self) -> bool {
        matches!(self, Self::None)
    }

    /// Whether the driver can only forward through the slirp4netns stack
    #[must_use]
    pub const fn requires_slirp4netns(self) -> bool {
        matches!(self, Self::Slirp4netns)
    }

    /// Build the parent-side driver, `None` when no driver is selected
    ///
    /// # Errors
    /// Returns error if a binary the driver runs cannot be found
    pub fn parent_driver(self) -> Result<Option<Arc<dyn PortParentDriver>>> {
        let driver: Arc<dyn PortParentDriver> = match self {
            Self::None => return Ok(None),
            Self::Builtin => Arc::new(BuiltinParent::new()),
            Self::Slirp4netns => Arc::new(Slirp4netnsPortParent::new()),
            Self::Socat => Arc::new(SocatParent::new(
                lookup_binary("socat")?,
                lookup_binary("nsenter")?,
            )),
        };
        Ok(Some(driver))
    }

    /// Build the child-side driver, `None` when nothing runs in the namespace
    #[must_use]
    pub fn child_driver(self) -> Option<Box<dyn PortChildDriver>> {
        match self {
            Self::Builtin => Some(Box::new(BuiltinChild)),
            Self::None | Self::Slirp4netns | Self::Socat => None,
        }
    }
}

impl fmt::Display for PortDriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortDriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "builtin" => Ok(Self::Builtin),
            "slirp4netns" => Ok(Self::Slirp4netns),
            "socat" => Ok(Self::Socat),
            other => Err(Error::invalid_config(format!("unknown port driver: {other}"))),
        }
    }
}

/// Everything the coordinator hands a parent-side port driver
#[derive(Debug, Clone)]
pub struct PortContext {
    /// Pid of the child holding the namespaces
    pub child_pid: ProcessId,
    /// Session state directory
    pub state_dir: PathBuf,
    /// Network attachment, absent for host networking
    pub network: Option<NetworkMessage>,
    /// Cancelled when the session is aborted
    pub cancel: CancellationToken,
}

/// Parent-side half of a port driver
///
/// Mapping calls take `&self` so the control socket can share the driver
/// with the coordinator. Calls for different mappings run concurrently.
#[async_trait]
pub trait PortParentDriver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &'static str;

    /// Data the child-side driver needs; called before the child is configured
    ///
    /// # Errors
    /// Returns error if driver-private endpoints cannot be created
    fn opaque_for_child(&self, ctx: &PortContext) -> Result<PortMessage>;

    /// Wait until the driver can forward traffic
    ///
    /// # Errors
    /// Returns error if the child-side half never becomes ready
    async fn start(&self, ctx: &PortContext) -> Result<()>;

    /// Expose a port
    ///
    /// # Errors
    /// Returns a conflict if an active mapping claims the same protocol and
    /// host address, or an error if the host side cannot be bound
    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus>;

    /// Withdraw a port
    ///
    /// # Errors
    /// Returns [`Error::PortNotFound`] for an unknown id
    async fn remove_port(&self, id: PortId) -> Result<()>;

    /// Active mappings ordered by id
    async fn list_ports(&self) -> Vec<PortStatus>;

    /// Withdraw every mapping and release the driver's resources
    ///
    /// # Errors
    /// Returns error if a backend process cannot be reaped
    async fn stop(&self) -> Result<()>;
}

/// Child-side half of a port driver
pub trait PortChildDriver {
    /// Prepare the namespace side of the driver
    ///
    /// # Errors
    /// Returns error if the driver cannot reach its parent-side half
    fn setup(&self, msg: &PortMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("none".parse::<PortDriverKind>().unwrap(), PortDriverKind::None);
        assert_eq!(
            "builtin".parse::<PortDriverKind>().unwrap(),
            PortDriverKind::Builtin
        );
        assert!("vpnkit".parse::<PortDriverKind>().is_err());
        assert_eq!(PortDriverKind::Socat.to_string(), "socat");
    }

    #[test]
    fn test_requirements() {
        assert!(PortDriverKind::None.is_none());
        assert!(PortDriverKind::Slirp4netns.requires_slirp4netns());
        assert!(!PortDriverKind::Builtin.requires_slirp4netns());
    }

    #[test]
    fn test_drivers_per_kind() {
        assert!(PortDriverKind::None.parent_driver().unwrap().is_none());
        let builtin = PortDriverKind::Builtin.parent_driver().unwrap().unwrap();
        assert_eq!(builtin.name(), "builtin");

        assert!(PortDriverKind::Builtin.child_driver().is_some());
        assert!(PortDriverKind::Socat.child_driver().is_none());
        assert!(PortDriverKind::Slirp4netns.child_driver().is_none());
    }
}
