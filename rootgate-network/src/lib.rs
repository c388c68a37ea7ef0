//! Network drivers attaching a user-mode network stack to the child
//!
//! Backends:
//! - [`slirp4netns`] - reference backend, ready/exit pipes and an optional API socket
//! - [`vpnkit`] - vmnet protocol over a unix socket, TAP relay in the child
//! - [`vdeplug`] - libslirp plugged in with `vde_plug`

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod configure;
pub mod driver;
pub mod slirp4netns;
pub mod tap;
pub mod vdeplug;
pub mod vmnet;
pub mod vpnkit;

pub use driver::{
    MockNetworkDriver, NetworkChildDriver, NetworkMode, NetworkOptions, NetworkParentDriver,
    ParentContext, child_driver,
};
