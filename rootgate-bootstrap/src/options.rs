//! Session options shared by both roles

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use rootgate_core::channel::CONTROL_FD;
use rootgate_core::{Error, PortSpec, Result};
use rootgate_namespace::{CopyUpMode, IdMapPolicy, NamespaceConfig};
use rootgate_network::NetworkOptions;
use rootgate_port::PortDriverKind;

/// Which half of a session this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Coordinator outside the namespaces
    Parent,
    /// Initializer inside the namespaces
    Child {
        /// Inherited control channel descriptor
        control_fd: RawFd,
    },
}

impl Role {
    /// Role for the value of the control descriptor variable, if any
    ///
    /// # Errors
    /// Returns error if the value is not the expected descriptor number
    pub fn from_control_fd(value: Option<&str>) -> Result<Self> {
        let Some(value) = value else {
            return Ok(Self::Parent);
        };
        let control_fd: RawFd = value
            .parse()
            .map_err(|_| Error::handshake(format!("invalid control descriptor {value:?}")))?;
        if control_fd != CONTROL_FD {
            return Err(Error::handshake(format!(
                "control descriptor must be {CONTROL_FD}, got {control_fd}"
            )));
        }
        Ok(Self::Child { control_fd })
    }

    /// Short label used in error prefixes
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child { .. } => "child ",
        }
    }
}

/// Everything both roles derive from the command line
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Network driver options
    pub network: NetworkOptions,
    /// Selected port driver
    pub port_driver: PortDriverKind,
    /// Mappings added right after the port driver starts
    pub publish: Vec<PortSpec>,
    /// Paths made writable inside the mount namespace
    pub copy_up: Vec<PathBuf>,
    /// Copy-up driver
    pub copy_up_mode: CopyUpMode,
    /// How the child's id maps are installed
    pub id_map: IdMapPolicy,
    /// Target command and its arguments
    pub command: Vec<String>,
}

impl SessionOptions {
    /// Options running `command` with host networking and no ports
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Set the network options
    #[must_use]
    pub fn with_network(mut self, network: NetworkOptions) -> Self {
        self.network = network;
        self
    }

    /// Select the port driver
    #[must_use]
    pub const fn with_port_driver(mut self, kind: PortDriverKind) -> Self {
        self.port_driver = kind;
        self
    }

    /// Set the initial mappings
    #[must_use]
    pub fn with_publish(mut self, publish: Vec<PortSpec>) -> Self {
        self.publish = publish;
        self
    }

    /// Set the copy-up paths
    #[must_use]
    pub fn with_copy_up(mut self, paths: Vec<PathBuf>) -> Self {
        self.copy_up = paths;
        self
    }

    /// Select the copy-up driver
    #[must_use]
    pub const fn with_copy_up_mode(mut self, mode: CopyUpMode) -> Self {
        self.copy_up_mode = mode;
        self
    }

    /// Set the id map policy
    #[must_use]
    pub const fn with_id_map(mut self, policy: IdMapPolicy) -> Self {
        self.id_map = policy;
        self
    }

    /// Network options as the drivers see them
    ///
    /// The slirp4netns port driver talks to the network backend's API
    /// socket, so selecting it turns the socket on.
    #[must_use]
    pub fn network_options(&self) -> NetworkOptions {
        let api_socket = self.network.api_socket || self.port_driver.requires_slirp4netns();
        self.network.clone().with_api_socket(api_socket)
    }

    /// Namespaces the child creates
    #[must_use]
    pub fn namespaces(&self) -> NamespaceConfig {
        NamespaceConfig::for_session(!self.network.mode.is_host(), !self.copy_up.is_empty())
    }

    /// Whether `/etc` itself is copied up
    #[must_use]
    pub fn copies_up_etc(&self) -> bool {
        self.copy_up.iter().any(|path| path == Path::new("/etc"))
    }

    /// Reject invalid combinations before anything is launched
    ///
    /// Network options on their own are checked when the network driver
    /// is built.
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::invalid_config("no command given"));
        }

        if !self.port_driver.is_none() && self.network.mode.is_host() {
            return Err(Error::invalid_config(format!(
                "port driver {} requires a non-host network, see --net",
                self.port_driver
            )));
        }
        if self.port_driver.requires_slirp4netns()
            && self.network.mode != rootgate_network::NetworkMode::Slirp4netns
        {
            return Err(Error::invalid_config(
                "port driver slirp4netns requires --net=slirp4netns",
            ));
        }
        if self.port_driver.is_none() && !self.publish.is_empty() {
            return Err(Error::invalid_config("--publish requires a port driver"));
        }

        for path in &self.copy_up {
            if !path.is_absolute() {
                return Err(Error::invalid_config(format!(
                    "copy-up path must be absolute: {}",
                    path.display()
                )));
            }
            if path == Path::new("/") {
                return Err(Error::invalid_config("cannot copy-up the root directory"));
            }
        }
        Ok(())
    }
}

/// How the coordinator launches the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    /// Program to run
    pub program: PathBuf,
    /// Its arguments
    pub args: Vec<OsString>,
}

impl ChildCommand {
    /// Run `program` with `args`
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-execute the running binary with `args`
    pub fn current_exe<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::new("/proc/self/exe", args)
    }
}

/// Coordinator options
#[derive(Debug, Clone)]
pub struct ParentOptions {
    /// Shared session options
    pub session: SessionOptions,
    /// State directory, a private temporary one when `None`
    pub state_dir: Option<PathBuf>,
    /// Child launch command
    pub child: ChildCommand,
}

impl ParentOptions {
    /// Options launching `child` for `session`
    #[must_use]
    pub const fn new(session: SessionOptions, child: ChildCommand) -> Self {
        Self {
            session,
            state_dir: None,
            child,
        }
    }

    /// Use a fixed state directory
    #[must_use]
    pub fn with_state_dir(mut self, path: Option<PathBuf>) -> Self {
        self.state_dir = path;
        self
    }
}

/// Initializer options
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Shared session options
    pub session: SessionOptions,
    /// Inherited control channel descriptor
    pub control_fd: RawFd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rootgate_network::NetworkMode;

    fn command() -> Vec<String> {
        vec!["sh".to_string()]
    }

    #[test]
    fn test_role_detection() {
        assert_eq!(Role::from_control_fd(None).unwrap(), Role::Parent);
        assert_eq!(
            Role::from_control_fd(Some("3")).unwrap(),
            Role::Child { control_fd: 3 }
        );
        assert!(Role::from_control_fd(Some("7")).is_err());
        assert!(Role::from_control_fd(Some("three")).is_err());
    }

    #[test]
    fn test_host_network_has_no_namespaces() {
        let options = SessionOptions::new(command());
        assert!(options.validate().is_ok());
        assert!(!options.namespaces().has_any());
    }

    #[test]
    fn test_copy_up_alone_needs_mount_namespace() {
        let options = SessionOptions::new(command()).with_copy_up(vec![PathBuf::from("/etc")]);
        let namespaces = options.namespaces();
        assert!(namespaces.mount);
        assert!(!namespaces.network);
        assert!(namespaces.needs_user());
        assert!(options.copies_up_etc());
    }

    #[test]
    fn test_port_driver_requires_isolated_network() {
        let options = SessionOptions::new(command()).with_port_driver(PortDriverKind::Builtin);
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("non-host"));

        let options = options.with_network(NetworkOptions::new(NetworkMode::Vpnkit));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_slirp4netns_port_driver_enables_api_socket() {
        let options = SessionOptions::new(command())
            .with_network(NetworkOptions::new(NetworkMode::Slirp4netns))
            .with_port_driver(PortDriverKind::Slirp4netns);
        assert!(options.validate().is_ok());
        assert!(options.network_options().api_socket);
        assert!(!options.network.api_socket);

        let options = options.with_network(NetworkOptions::new(NetworkMode::Vpnkit));
        assert_eq!(options.validate().unwrap_err().kind(), "invalid");
    }

    #[test]
    fn test_publish_without_driver() {
        let options = SessionOptions::new(command())
            .with_network(NetworkOptions::new(NetworkMode::Slirp4netns))
            .with_publish(vec!["8080:80".parse().unwrap()]);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_copy_up_paths_must_be_absolute() {
        let relative = SessionOptions::new(command()).with_copy_up(vec![PathBuf::from("etc")]);
        assert!(relative.validate().is_err());
        let root = SessionOptions::new(command()).with_copy_up(vec![PathBuf::from("/")]);
        assert!(root.validate().is_err());
    }

    #[test]
    fn test_empty_command() {
        assert!(SessionOptions::new(Vec::new()).validate().is_err());
    }

    #[test]
    fn test_current_exe_command() {
        let child = ChildCommand::current_exe(["--net=host", "--", "true"]);
        assert_eq!(child.program, PathBuf::from("/proc/self/exe"));
        assert_eq!(child.args.len(), 3);
    }
}
