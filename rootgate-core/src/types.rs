//! Core type definitions with strong typing and validation

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::{Error, Result};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the current process ID
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_possible_wrap)]
        Self(std::process::id() as i32)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        nix::unistd::Pid::from_raw(pid.0)
    }
}

/// Interface MTU, where zero means "use the backend default"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Mtu(u32);

impl Mtu {
    /// Sentinel for "not configured"
    pub const UNSET: Self = Self(0);

    /// Largest MTU a user-mode stack accepts
    pub const MAX: u32 = 65521;

    /// Validate a user-supplied MTU
    ///
    /// # Errors
    /// Returns error if the value is negative or above [`Mtu::MAX`]
    pub fn new(value: i64) -> Result<Self> {
        if value < 0 || value > i64::from(Self::MAX) {
            return Err(Error::invalid_config(format!(
                "mtu must be between 0 and {}, got {value}",
                Self::MAX
            )));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(Self(value as u32))
    }

    /// Whether the sentinel is set
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// Resolve against a backend default
    #[must_use]
    pub const fn resolve(self, default: u32) -> u32 {
        if self.0 == 0 { default } else { self.0 }
    }

    /// Raw value (0 when unset)
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Mtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            write!(f, "default")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// IPv4 address block in CIDR form whose address is exactly the network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressBlock(Ipv4Network);

impl AddressBlock {
    /// Parse and validate a CIDR string
    ///
    /// # Errors
    /// Returns error if the string is not a CIDR or has host bits set
    pub fn parse(s: &str) -> Result<Self> {
        let net = Ipv4Network::from_str(s)
            .map_err(|e| Error::invalid_config(format!("invalid cidr {s:?}: {e}")))?;
        if net.ip() != net.network() {
            return Err(Error::invalid_config(format!(
                "cidr must be like {}/{}, not like {s}",
                net.network(),
                net.prefix()
            )));
        }
        Ok(Self(net))
    }

    /// Network address
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// Prefix length
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    /// The `n`th address of the block, if it lies inside the block
    #[must_use]
    pub fn nth(&self, n: u32) -> Option<Ipv4Addr> {
        let addr = u32::from(self.0.network()).checked_add(n)?;
        let addr = Ipv4Addr::from(addr);
        self.0.contains(addr).then_some(addr)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0.network(), self.0.prefix())
    }
}

impl FromStr for AddressBlock {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AddressBlock {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AddressBlock> for String {
    fn from(block: AddressBlock) -> Self {
        block.to_string()
    }
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// Lowercase protocol name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(Error::invalid_config(format!("unknown protocol: {other}"))),
        }
    }
}

/// A request to expose a namespace port on the host
///
/// Text form: `[HOST_IP:]HOST_PORT:[CHILD_IP:]CHILD_PORT[/PROTO]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Protocol
    #[serde(default)]
    pub proto: Protocol,
    /// Host-facing address
    pub host: SocketAddr,
    /// Namespace-facing address; `None` lets the driver pick its default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_ip: Option<IpAddr>,
    /// Namespace-facing port
    pub child_port: u16,
}

impl PortSpec {
    /// Create a TCP spec
    #[must_use]
    pub const fn tcp(host: SocketAddr, child_port: u16) -> Self {
        Self {
            proto: Protocol::Tcp,
            host,
            child_ip: None,
            child_port,
        }
    }

    /// Set the protocol
    #[must_use]
    pub const fn with_proto(mut self, proto: Protocol) -> Self {
        self.proto = proto;
        self
    }

    /// Set the namespace-facing address
    #[must_use]
    pub const fn with_child_ip(mut self, ip: IpAddr) -> Self {
        self.child_ip = Some(ip);
        self
    }

    /// Namespace-facing socket address, falling back to `default_ip`
    #[must_use]
    pub fn child_addr(&self, default_ip: IpAddr) -> SocketAddr {
        SocketAddr::new(self.child_ip.unwrap_or(default_ip), self.child_port)
    }

    /// Whether two specs claim the same host endpoint
    ///
    /// Port 0 asks the kernel for a free port and never collides.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.host.port() != 0 && self.proto == other.proto && self.host == other.host
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.host)?;
        if let Some(ip) = self.child_ip {
            write!(f, "{ip}:")?;
        }
        write!(f, "{}/{}", self.child_port, self.proto)
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::invalid_config(format!("invalid port spec {s:?}: {why}"));

        let (addrs, proto) = match s.rsplit_once('/') {
            Some((addrs, proto)) => (addrs, proto.parse()?),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = addrs.split(':').collect();
        let (host_ip, host_port, child_ip, child_port) = match parts.as_slice() {
            [hp, cp] => (None, *hp, None, *cp),
            [hip, hp, cp] => (Some(*hip), *hp, None, *cp),
            [hip, hp, cip, cp] => (Some(*hip), *hp, Some(*cip), *cp),
            _ => return Err(invalid("expected [HOST_IP:]HOST_PORT:[CHILD_IP:]CHILD_PORT")),
        };

        let host_ip: IpAddr = match host_ip {
            Some(ip) => ip.parse().map_err(|_| invalid("bad host address"))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let child_ip = child_ip
            .map(|ip| ip.parse::<IpAddr>().map_err(|_| invalid("bad child address")))
            .transpose()?;
        let host_port: u16 = host_port.parse().map_err(|_| invalid("bad host port"))?;
        let child_port: u16 = child_port.parse().map_err(|_| invalid("bad child port"))?;
        if child_port == 0 {
            return Err(invalid("child port must not be 0"));
        }

        Ok(Self {
            proto,
            host: SocketAddr::new(host_ip, host_port),
            child_ip,
            child_port,
        })
    }
}

/// Identifier of an accepted port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct PortId(u64);

impl PortId {
    /// Create from raw id
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get raw id
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| Error::invalid_config(format!("invalid port id: {s}")))
    }
}

/// An accepted port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    /// Mapping id
    pub id: PortId,
    /// The mapping, with the host port resolved if 0 was requested
    pub spec: PortSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu_bounds() {
        assert_eq!(Mtu::new(0).unwrap(), Mtu::UNSET);
        assert_eq!(Mtu::new(1).unwrap().get(), 1);
        assert_eq!(Mtu::new(65521).unwrap().get(), 65521);
        assert!(Mtu::new(-1).is_err());
        assert!(Mtu::new(65522).is_err());
        assert!(Mtu::new(i64::MAX).is_err());
    }

    #[test]
    fn test_mtu_resolve() {
        assert_eq!(Mtu::UNSET.resolve(65520), 65520);
        assert_eq!(Mtu::new(1400).unwrap().resolve(65520), 1400);
    }

    #[test]
    fn test_address_block_requires_network_address() {
        assert!(AddressBlock::parse("10.0.2.0/24").is_ok());
        assert!(AddressBlock::parse("10.0.2.100/24").is_err());
        assert!(AddressBlock::parse("192.168.0.0/16").is_ok());
        assert!(AddressBlock::parse("not-a-cidr").is_err());
    }

    #[test]
    fn test_address_block_nth() {
        let block = AddressBlock::parse("10.0.3.0/24").unwrap();
        assert_eq!(block.nth(2), Some(Ipv4Addr::new(10, 0, 3, 2)));
        assert_eq!(block.nth(100), Some(Ipv4Addr::new(10, 0, 3, 100)));
        assert_eq!(block.nth(256), None);
        assert_eq!(block.to_string(), "10.0.3.0/24");
    }

    #[test]
    fn test_port_spec_parse() {
        let spec: PortSpec = "8080:80".parse().unwrap();
        assert_eq!(spec.proto, Protocol::Tcp);
        assert_eq!(spec.host, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(spec.child_ip, None);
        assert_eq!(spec.child_port, 80);

        let spec: PortSpec = "127.0.0.1:5353:53/udp".parse().unwrap();
        assert_eq!(spec.proto, Protocol::Udp);
        assert_eq!(spec.host, "127.0.0.1:5353".parse().unwrap());

        let spec: PortSpec = "0.0.0.0:8443:10.0.2.100:443/tcp".parse().unwrap();
        assert_eq!(spec.child_ip, Some("10.0.2.100".parse().unwrap()));

        assert!("8080".parse::<PortSpec>().is_err());
        assert!("8080:0".parse::<PortSpec>().is_err());
        assert!("8080:80/sctp".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_port_spec_conflicts() {
        let a: PortSpec = "8080:80".parse().unwrap();
        let b: PortSpec = "8080:81".parse().unwrap();
        let c: PortSpec = "8080:80/udp".parse().unwrap();
        let d: PortSpec = "127.0.0.1:8080:80".parse().unwrap();
        let any: PortSpec = "0:80".parse().unwrap();

        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
        assert!(!a.conflicts_with(&d));
        assert!(!any.conflicts_with(&any));
    }

    #[test]
    fn test_port_spec_serde() {
        let spec: PortSpec = "127.0.0.1:8080:80".parse().unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        let back: PortSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);

        let spec: PortSpec =
            serde_json::from_str(r#"{"host":"0.0.0.0:8080","child_port":80}"#).unwrap();
        assert_eq!(spec.proto, Protocol::Tcp);
    }

    #[test]
    fn test_process_id() {
        let pid = ProcessId::from_raw(123);
        assert_eq!(pid.as_raw(), 123);

        let nix_pid = pid.as_nix_pid();
        assert_eq!(nix_pid.as_raw(), 123);
    }
}
