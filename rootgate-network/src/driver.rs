//! Network driver contract
//!
//! A network driver has two halves. The parent-side half runs in the
//! coordinator, launches a user-mode network stack bound to the child's
//! namespaces and describes the attachment in a [`NetworkMessage`]. The
//! child-side half runs inside the new network namespace and configures the
//! interface from that message.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use rootgate_core::process::lookup_binary;
use rootgate_core::{AddressBlock, Error, Mtu, NetworkMessage, ProcessId, Result};

use crate::slirp4netns::{Slirp4netnsChild, Slirp4netnsParent};
use crate::vdeplug::{VdeplugChild, VdeplugParent};
use crate::vpnkit::{VpnkitChild, VpnkitParent};

/// Available network drivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetworkMode {
    /// Share the host network namespace
    #[default]
    Host,
    /// slirp4netns user-mode stack
    Slirp4netns,
    /// vpnkit user-mode stack
    Vpnkit,
    /// libslirp through `vde_plug`
    VdeplugSlirp,
}

impl NetworkMode {
    /// Flag value
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Slirp4netns => "slirp4netns",
            Self::Vpnkit => "vpnkit",
            Self::VdeplugSlirp => "vdeplug_slirp",
        }
    }

    /// Whether the child keeps the host network namespace
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }

    /// MTU used when none is given
    #[must_use]
    pub const fn default_mtu(self) -> u32 {
        match self {
            Self::Slirp4netns => 65520,
            Self::Host | Self::Vpnkit | Self::VdeplugSlirp => 1500,
        }
    }

    /// Whether the backend accepts a custom address block
    #[must_use]
    pub const fn supports_cidr(self) -> bool {
        matches!(self, Self::Slirp4netns)
    }

    /// Whether the backend can refuse connections to the host loopback
    #[must_use]
    pub const fn supports_disable_host_loopback(self) -> bool {
        matches!(self, Self::Slirp4netns | Self::Vpnkit)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "slirp4netns" => Ok(Self::Slirp4netns),
            "vpnkit" => Ok(Self::Vpnkit),
            "vdeplug_slirp" => Ok(Self::VdeplugSlirp),
            other => Err(Error::invalid_config(format!("unknown network mode: {other}"))),
        }
    }
}

/// Everything the coordinator hands a parent-side driver at start
#[derive(Debug, Clone)]
pub struct ParentContext {
    /// Pid of the child holding the namespaces
    pub child_pid: ProcessId,
    /// Session state directory
    pub state_dir: PathBuf,
    /// Cancelled when the session is aborted
    pub cancel: CancellationToken,
}

/// Parent-side half of a network driver
#[async_trait]
pub trait NetworkParentDriver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &'static str;

    /// Launch the backend and wait until it is attached
    ///
    /// # Errors
    /// Returns error if the backend fails to start or exits early
    async fn start(&mut self, ctx: &ParentContext) -> Result<NetworkMessage>;

    /// Terminate the backend
    ///
    /// Idempotent, and safe after a partially failed `start`.
    ///
    /// # Errors
    /// Returns error if the backend cannot be reaped
    async fn stop(&mut self) -> Result<()>;
}

/// Child-side half of a network driver
pub trait NetworkChildDriver {
    /// Configure the namespace's interface
    ///
    /// # Errors
    /// Returns error if the device cannot be prepared or addressed
    fn configure(&self, msg: &NetworkMessage) -> Result<()>;
}

/// Validated network options
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Selected driver
    pub mode: NetworkMode,
    /// Requested MTU
    pub mtu: Mtu,
    /// Custom address block (slirp4netns only)
    pub cidr: Option<AddressBlock>,
    /// Refuse connections to the host loopback
    pub disable_host_loopback: bool,
    /// slirp4netns binary name or path
    pub slirp4netns_binary: String,
    /// vpnkit binary name or path
    pub vpnkit_binary: String,
    /// Open the slirp4netns API socket
    pub api_socket: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self::new(NetworkMode::Host)
    }
}

impl NetworkOptions {
    /// Options for `mode` with backend defaults
    #[must_use]
    pub fn new(mode: NetworkMode) -> Self {
        Self {
            mode,
            mtu: Mtu::UNSET,
            cidr: None,
            disable_host_loopback: false,
            slirp4netns_binary: "slirp4netns".to_string(),
            vpnkit_binary: "vpnkit".to_string(),
            api_socket: false,
        }
    }

    /// Set the MTU
    #[must_use]
    pub const fn with_mtu(mut self, mtu: Mtu) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set a custom address block
    #[must_use]
    pub const fn with_cidr(mut self, cidr: Option<AddressBlock>) -> Self {
        self.cidr = cidr;
        self
    }

    /// Refuse connections to the host loopback
    #[must_use]
    pub const fn with_disable_host_loopback(mut self, disable: bool) -> Self {
        self.disable_host_loopback = disable;
        self
    }

    /// Set the slirp4netns binary
    #[must_use]
    pub fn with_slirp4netns_binary(mut self, binary: impl Into<String>) -> Self {
        self.slirp4netns_binary = binary.into();
        self
    }

    /// Set the vpnkit binary
    #[must_use]
    pub fn with_vpnkit_binary(mut self, binary: impl Into<String>) -> Self {
        self.vpnkit_binary = binary.into();
        self
    }

    /// Open the slirp4netns API socket
    #[must_use]
    pub const fn with_api_socket(mut self, enable: bool) -> Self {
        self.api_socket = enable;
        self
    }

    /// MTU after resolving the sentinel against the backend default
    #[must_use]
    pub const fn resolved_mtu(&self) -> u32 {
        self.mtu.resolve(self.mode.default_mtu())
    }

    /// Reject invalid combinations
    ///
    /// Nothing is launched; binaries are not looked up.
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if let Some(cidr) = self.cidr {
            if !self.mode.supports_cidr() {
                return Err(Error::invalid_config(
                    "custom cidr is supported only for --net=slirp4netns",
                ));
            }
            if cidr.prefix() > 25 {
                return Err(Error::invalid_config(format!(
                    "cidr {cidr} is too small, the prefix must be /25 or shorter"
                )));
            }
        }
        if self.disable_host_loopback && self.mode == NetworkMode::VdeplugSlirp {
            return Err(Error::invalid_config(
                "--disable-host-loopback is not supported for vdeplug_slirp",
            ));
        }
        if self.api_socket && self.mode != NetworkMode::Slirp4netns {
            return Err(Error::invalid_config(
                "the slirp4netns API socket requires --net=slirp4netns",
            ));
        }

        if self.mode.is_host() {
            if !self.mtu.is_unset() {
                tracing::warn!(mtu = %self.mtu, "unsupported mtu for --net=host, ignoring");
            }
        } else if !self.disable_host_loopback {
            tracing::warn!(
                "specifying --disable-host-loopback is highly recommended to prohibit \
                 connecting to 127.0.0.1:* on the host namespace"
            );
        }
        Ok(())
    }

    /// Build the parent-side driver, `None` for host networking
    ///
    /// # Errors
    /// Returns error if the options are invalid or a backend binary is missing
    pub fn parent_driver(&self) -> Result<Option<Box<dyn NetworkParentDriver>>> {
        self.validate()?;
        let driver: Box<dyn NetworkParentDriver> = match self.mode {
            NetworkMode::Host => return Ok(None),
            NetworkMode::Slirp4netns => Box::new(Slirp4netnsParent::new(
                lookup_binary(&self.slirp4netns_binary)?,
                self.resolved_mtu(),
                self.cidr,
                self.disable_host_loopback,
                self.api_socket,
            )),
            NetworkMode::Vpnkit => Box::new(VpnkitParent::new(
                lookup_binary(&self.vpnkit_binary)?,
                self.resolved_mtu(),
                self.disable_host_loopback,
            )),
            NetworkMode::VdeplugSlirp => Box::new(VdeplugParent::new(
                lookup_binary("vde_plug")?,
                lookup_binary("nsenter")?,
                self.resolved_mtu(),
            )),
        };
        Ok(Some(driver))
    }
}

/// Build the child-side driver, `None` for host networking
#[must_use]
pub fn child_driver(mode: NetworkMode) -> Option<Box<dyn NetworkChildDriver>> {
    match mode {
        NetworkMode::Host => None,
        NetworkMode::Slirp4netns => Some(Box::new(Slirp4netnsChild)),
        NetworkMode::Vpnkit => Some(Box::new(VpnkitChild)),
        NetworkMode::VdeplugSlirp => Some(Box::new(VdeplugChild)),
    }
}

/// Parent-side driver for tests that hands out a fixed attachment
#[derive(Clone)]
pub struct MockNetworkDriver {
    state: Arc<Mutex<MockState>>,
}

struct MockState {
    message: NetworkMessage,
    started_for: Option<ProcessId>,
    start_calls: usize,
    stop_calls: usize,
    fail_start: bool,
}

impl MockNetworkDriver {
    /// Mock that answers `start` with `message`
    #[must_use]
    pub fn new(message: NetworkMessage) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                message,
                started_for: None,
                start_calls: 0,
                stop_calls: 0,
                fail_start: false,
            })),
        }
    }

    /// Make `start` fail
    pub async fn fail_start(&self) {
        self.state.lock().await.fail_start = true;
    }

    /// Pid passed to the last `start`
    pub async fn started_for(&self) -> Option<ProcessId> {
        self.state.lock().await.started_for
    }

    /// Number of `start` calls
    pub async fn start_calls(&self) -> usize {
        self.state.lock().await.start_calls
    }

    /// Number of `stop` calls
    pub async fn stop_calls(&self) -> usize {
        self.state.lock().await.stop_calls
    }
}

#[async_trait]
impl NetworkParentDriver for MockNetworkDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&mut self, ctx: &ParentContext) -> Result<NetworkMessage> {
        let mut state = self.state.lock().await;
        state.start_calls += 1;
        state.started_for = Some(ctx.child_pid);
        if state.fail_start {
            return Err(Error::Network {
                driver: "mock",
                message: "start refused".to_string(),
            });
        }
        Ok(state.message.clone())
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.lock().await.stop_calls += 1;
        Ok(())
    }
}
