//! Port drivers exposing namespace ports on the host
//!
//! Backends:
//! - [`builtin`] - host-side relay, dials through a helper inside the namespace
//! - [`slirp4netns`] - host forwards installed through the slirp4netns API socket
//! - [`socat`] - one socat process per mapping
//!
//! [`api`] serves and talks to the session's port control socket.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod api;
pub mod builtin;
pub mod driver;
pub mod slirp4netns;
pub mod socat;
pub mod table;

pub use api::{ApiClient, ApiRequest, ApiResponse, ApiServer};
pub use builtin::{BuiltinChild, BuiltinParent, DirectDialer};
pub use driver::{PortChildDriver, PortContext, PortDriverKind, PortParentDriver};
pub use table::PortTable;
