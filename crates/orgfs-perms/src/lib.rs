//! Reconciler and verifier for the orgfs shared filesystem.
//!
//! Consumes the plans computed by `orgfs-core` and makes the filesystem
//! match: directories, ownership, setgid bits, POSIX ACLs, symlinks, and
//! the sharing overlay.  The verifier reads everything back and reports
//! discrepancies without mutating.

pub mod apply;
pub mod check;
pub mod cli;
pub mod driver;
pub mod error;
pub mod sharing_apply;

pub use apply::{ensure_permissions, ApplyOptions};
pub use check::{check_permissions, CheckReport};
pub use cli::Cli;
pub use error::{FsError, FsResult};
