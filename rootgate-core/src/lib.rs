//! Rootgate Core - Foundation types, wire messages, and session plumbing
//!
//! This crate provides the pieces every other rootgate crate shares: the
//! error type, validated option types, the control channel between the
//! coordinator and the child, and the session state directory.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod error;
pub mod events;
pub mod message;
pub mod process;
pub mod state;
pub mod types;

pub use channel::{ChildChannel, ParentChannel};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use message::{ControlMessage, NetworkMessage, PortMessage};
pub use state::StateDir;
pub use types::{AddressBlock, Mtu, PortId, PortSpec, PortStatus, ProcessId, Protocol};
