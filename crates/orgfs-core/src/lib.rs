//! Permission-model compiler for the orgfs shared filesystem.
//!
//! A shared scientific-computing filesystem serves two views of the same
//! storage: a service tree owned by operating facilities and an org tree
//! owned by research units, connected by a symlink layer and POSIX ACLs.
//! This crate derives, from a declarative configuration and the Unix group
//! table, the complete desired set of filesystem entries: directories,
//! owning groups, ACLs (normal and default), symlink targets, and the
//! sharing overlay.
//!
//! Everything here is pure: no filesystem I/O, no subprocesses, no logging.
//! The companion `orgfs-perms` crate applies and verifies the plans.

pub mod acl;
pub mod config;
pub mod error;
pub mod filter;
pub mod groups;
pub mod org;
pub mod plan;
pub mod sharing;

pub use config::Config;
pub use error::{ModelError, ModelResult};
pub use groups::Group;
pub use org::Organization;
pub use plan::{plan_tree, DirAclSpec, Entry, EntryKind};
pub use sharing::{compile_sharing, FsLayout, Sharing};
