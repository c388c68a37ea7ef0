//! Session lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::{PortId, PortSpec, ProcessId};

/// Events emitted by the coordinator while a session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Child process launched
    ChildStarted {
        /// Child pid
        pid: ProcessId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Child created its namespaces
    NamespacesReady {
        /// Child pid
        pid: ProcessId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Network driver attached to the child's namespace
    NetworkAttached {
        /// Driver name
        driver: String,
        /// Interface name inside the namespace
        dev: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Port mapping accepted
    PortAdded {
        /// Mapping id
        id: PortId,
        /// Resolved mapping
        spec: PortSpec,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Port mapping withdrawn
    PortRemoved {
        /// Mapping id
        id: PortId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Child exited; the session is ending
    ChildExited {
        /// Child pid
        pid: ProcessId,
        /// Exit code propagated to the caller
        exit_code: i32,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Fatal session error
    Error {
        /// Error message
        message: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl SessionEvent {
    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::ChildStarted { timestamp, .. }
            | Self::NamespacesReady { timestamp, .. }
            | Self::NetworkAttached { timestamp, .. }
            | Self::PortAdded { timestamp, .. }
            | Self::PortRemoved { timestamp, .. }
            | Self::ChildExited { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this is a critical event
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        match self {
            Self::ChildStarted { pid, .. } => {
                tracing::debug!(child_pid = %pid, event = "child_started", "Child started");
            }
            Self::NamespacesReady { pid, .. } => {
                tracing::debug!(
                    child_pid = %pid,
                    event = "namespaces_ready",
                    "Child namespaces ready"
                );
            }
            Self::NetworkAttached { driver, dev, .. } => {
                tracing::info!(
                    driver = %driver,
                    dev = %dev,
                    event = "network_attached",
                    "Network attached"
                );
            }
            Self::PortAdded { id, spec, .. } => {
                tracing::info!(port_id = %id, spec = %spec, event = "port_added", "Port added");
            }
            Self::PortRemoved { id, .. } => {
                tracing::info!(port_id = %id, event = "port_removed", "Port removed");
            }
            Self::ChildExited { pid, exit_code, .. } => {
                tracing::debug!(
                    child_pid = %pid,
                    exit_code,
                    event = "child_exited",
                    "Child exited"
                );
            }
            Self::Error { message, .. } => {
                tracing::error!(message = %message, event = "error", "Session error");
            }
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChildStarted { pid, .. } => write!(f, "child {pid} started"),
            Self::NamespacesReady { pid, .. } => write!(f, "child {pid} namespaces ready"),
            Self::NetworkAttached { driver, dev, .. } => {
                write!(f, "network {driver} attached on {dev}")
            }
            Self::PortAdded { id, spec, .. } => write!(f, "port {id} added: {spec}"),
            Self::PortRemoved { id, .. } => write!(f, "port {id} removed"),
            Self::ChildExited { pid, exit_code, .. } => {
                write!(f, "child {pid} exited with code {exit_code}")
            }
            Self::Error { message, .. } => write!(f, "error: {message}"),
        }
    }
}

mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}
