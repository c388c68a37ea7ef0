//! Session bootstrap for both process roles
//!
//! The same executable runs twice. The [`Coordinator`] (parent role) launches
//! a copy of itself as the child, attaches the network and port drivers once
//! the child's namespaces exist, and waits for the target to exit. The
//! [`Initializer`] (child role) creates the namespaces, finishes the in-namespace
//! setup it is told about over the control channel and execs the target.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod child;
pub mod options;
pub mod parent;

pub use child::Initializer;
pub use options::{ChildCommand, ChildOptions, ParentOptions, Role, SessionOptions};
pub use parent::Coordinator;
