//! Namespace management for the rootless child
//!
//! This crate provides the pieces of isolation the child initializer and
//! the coordinator need:
//! - Namespace creation (user, network, mount) with a single `unshare`
//! - uid/gid map installation from outside the user namespace
//! - Copy-up of read-only paths inside the mount namespace
//! - Replacing the child with the target command

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod copyup;
pub mod executor;
pub mod idmap;
pub mod manager;

pub use config::NamespaceConfig;
pub use copyup::{CopyUpDriver, CopyUpMode, MemoryCopyUp, TmpfsSymlink};
pub use executor::{ExecFailure, exec_target};
pub use idmap::IdMapPolicy;
pub use manager::{NamespaceInfo, NamespaceManager};
