//! Messages carried over the parent/child control channel

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Network attachment handed from the parent-side network driver to the child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// Interface name inside the namespace
    pub dev: String,
    /// Address assigned to `dev`
    pub ip: Ipv4Addr,
    /// Prefix length of `ip`
    pub prefix: u8,
    /// Default gateway
    pub gateway: Ipv4Addr,
    /// Nameserver written to `resolv.conf`
    pub dns: Ipv4Addr,
    /// Resolved MTU of `dev`
    pub mtu: u32,
    /// Whether connections to the host loopback are refused
    pub disable_host_loopback: bool,
    /// Driver-specific key/value data
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub opaque: BTreeMap<String, String>,
}

impl NetworkMessage {
    /// Look up a required opaque value
    ///
    /// # Errors
    /// Returns a handshake error if the key is missing
    pub fn opaque_value(&self, key: &str) -> crate::Result<&str> {
        self.opaque
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| crate::Error::handshake(format!("network message lacks {key:?}")))
    }
}

/// Driver-private data the child-side port driver needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMessage {
    /// Driver-specific key/value data
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub opaque: BTreeMap<String, String>,
}

impl PortMessage {
    /// Look up a required opaque value
    ///
    /// # Errors
    /// Returns a handshake error if the key is missing
    pub fn opaque_value(&self, key: &str) -> crate::Result<&str> {
        self.opaque
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| crate::Error::handshake(format!("port message lacks {key:?}")))
    }
}

/// One frame on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Child: namespaces exist, the parent may attach to them
    NamespacesReady,

    /// Parent: everything the child needs to finish its setup
    Configure {
        /// Network attachment, absent for host networking
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<NetworkMessage>,
        /// Port driver data
        #[serde(default)]
        port: PortMessage,
        /// Session state directory
        state_dir: PathBuf,
    },

    /// Child: setup failed before exec
    Failure {
        /// Human-readable error
        message: String,
    },

    /// Child: the target could not be executed
    ExecFailed {
        /// Human-readable error
        message: String,
        /// Exit code the child is about to use
        code: i32,
    },
}

impl ControlMessage {
    /// Short name used in logs and desync errors
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NamespacesReady => "namespaces_ready",
            Self::Configure { .. } => "configure",
            Self::Failure { .. } => "failure",
            Self::ExecFailed { .. } => "exec_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_tagged() {
        let json = serde_json::to_string(&ControlMessage::NamespacesReady).unwrap();
        assert_eq!(json, r#"{"type":"namespaces_ready"}"#);

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"failure","message":"boom"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Failure {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_configure_without_network() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"configure","state_dir":"/tmp/s"}"#).unwrap();
        match msg {
            ControlMessage::Configure {
                network,
                port,
                state_dir,
            } => {
                assert!(network.is_none());
                assert!(port.opaque.is_empty());
                assert_eq!(state_dir, PathBuf::from("/tmp/s"));
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn test_opaque_lookup() {
        let mut port = PortMessage::default();
        port.opaque.insert("builtin.socket".into(), "/s/builtin.sock".into());
        assert_eq!(port.opaque_value("builtin.socket").unwrap(), "/s/builtin.sock");
        assert!(port.opaque_value("missing").is_err());
    }
}
