//! Plan reconciler.
//!
//! Applies a planned tree to the filesystem idempotently: creates missing
//! directories and symlinks, installs ownership, setgid bits, and ACLs,
//! and removes unplanned org-unit symlinks and empty unplanned service
//! subdirs.  A failed operation stops the surrounding subtree; the error
//! carries the subtree context.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use orgfs_core::{Config, Entry, EntryKind};
use tracing::{info, warn};

use crate::driver;
use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Propagate the per-policy ACL shapes to every descendant.
    pub recursive: bool,
}

/// Applies the plan.  Entries are processed in plan order within each
/// subtree: toplevel dirs, the service tree, the org tree, then symlinks
/// outside both trees.
pub fn ensure_permissions(cfg: &Config, plan: &[Entry], opts: ApplyOptions) -> FsResult<()> {
    let service_root = cfg.root_dir.join(&cfg.service_dir);
    let ou_root = cfg.root_dir.join(&cfg.org_unit_dir);

    let is_toplevel =
        |p: &Path| p == cfg.root_dir || p == service_root.as_path() || p == ou_root.as_path();

    for entry in plan.iter().filter(|e| is_toplevel(&e.path)) {
        ensure_entry(entry, opts).map_err(|e| e.context("toplevel dirs"))?;
    }

    for entry in plan
        .iter()
        .filter(|e| e.path.starts_with(&service_root) && e.path != service_root)
    {
        ensure_entry(entry, opts).map_err(|e| e.context("service dirs"))?;
    }
    remove_unexpected_service_subdirs(&expected_children(plan, &service_root, false))
        .map_err(|e| e.context("service dirs"))?;

    for entry in plan
        .iter()
        .filter(|e| e.path.starts_with(&ou_root) && e.path != ou_root)
    {
        ensure_entry(entry, opts).map_err(|e| e.context("org unit dirs"))?;
    }
    remove_unexpected_ou_links(&expected_children(plan, &ou_root, true))
        .map_err(|e| e.context("org unit dirs"))?;

    for entry in plan.iter().filter(|e| {
        !is_toplevel(&e.path)
            && !e.path.starts_with(&service_root)
            && !e.path.starts_with(&ou_root)
    }) {
        ensure_entry(entry, opts).map_err(|e| e.context("symlink"))?;
    }

    Ok(())
}

fn ensure_entry(entry: &Entry, opts: ApplyOptions) -> FsResult<()> {
    match &entry.kind {
        EntryKind::Dir(spec) => {
            let created = driver::ensure_dir(&entry.path)?;
            driver::chown_root_group(&entry.path, spec.owning_gid())?;
            if spec.setgid() {
                driver::ensure_setgid(&entry.path)?;
            }
            driver::setfacl_modify(&entry.path, &spec.modify_entries())?;
            let removals = spec.remove_entries();
            if !removals.is_empty() {
                driver::setfacl_remove(&entry.path, &removals)?;
            }
            if created {
                info!("Created `{}`.", entry.path.display());
            }
            if opts.recursive {
                if let Some((dir_entries, file_entries)) = spec.recursive_entries() {
                    driver::chgrp_descendants(&entry.path, spec.owning_gid())?;
                    driver::setgid_descendant_dirs(&entry.path)?;
                    driver::setfacl_descendants(&entry.path, &dir_entries, &file_entries)?;
                }
            }
            Ok(())
        }
        EntryKind::Symlink { target } => ensure_symlink(&entry.path, target),
    }
}

fn ensure_symlink(path: &Path, target: &Path) -> FsResult<()> {
    if driver::is_symlink_to(path, target) {
        return Ok(());
    }
    // A non-symlink in the way makes this fail; it is never replaced.
    driver::symlink(target, path)?;
    info!("Created symlink `{}`.", path.display());
    Ok(())
}

/// Collects the plan's expected child names per parent directory directly
/// below `subroot`: symlink names when `symlinks` is set, else dir names.
/// Parents with no expected children are included so cleanup still runs
/// for them.
fn expected_children(
    plan: &[Entry],
    subroot: &Path,
    symlinks: bool,
) -> BTreeMap<PathBuf, BTreeSet<String>> {
    let mut expected: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();

    for entry in plan {
        if entry.path.parent() == Some(subroot) && !entry.is_symlink() {
            expected.entry(entry.path.clone()).or_default();
        }
    }

    for entry in plan {
        if entry.is_symlink() != symlinks {
            continue;
        }
        let Some(parent) = entry.path.parent() else {
            continue;
        };
        if parent.parent() != Some(subroot) {
            continue;
        }
        let Some(name) = entry.path.file_name() else {
            continue;
        };
        if let Some(names) = expected.get_mut(parent) {
            names.insert(name.to_string_lossy().into_owned());
        }
    }

    expected
}

/// Removes unplanned symlinks below each org-unit dir.  Non-symlink
/// children are left untouched.
fn remove_unexpected_ou_links(expected: &BTreeMap<PathBuf, BTreeSet<String>>) -> FsResult<()> {
    for (ou_dir, names) in expected {
        for (name, file_type) in driver::list_dir(ou_dir)? {
            if !file_type.is_symlink() {
                continue;
            }
            if names.contains(&name) {
                continue;
            }
            let path = ou_dir.join(&name);
            driver::remove(&path)?;
            info!("Removed `{}`.", path.display());
        }
    }
    Ok(())
}

/// Removes unplanned directories below each service dir.  Non-empty dirs
/// are kept with a warning; they may hold user data.
fn remove_unexpected_service_subdirs(
    expected: &BTreeMap<PathBuf, BTreeSet<String>>,
) -> FsResult<()> {
    for (srv_dir, names) in expected {
        for (name, file_type) in driver::list_dir(srv_dir)? {
            if !file_type.is_dir() {
                continue;
            }
            if names.contains(&name) {
                continue;
            }
            let path = srv_dir.join(&name);
            match driver::remove(&path) {
                Ok(()) => info!("Removed `{}`.", path.display()),
                Err(FsError::Io { ref source, .. }) if driver::is_not_empty(source) => {
                    warn!("Kept unexpected directory `{}`.", path.display());
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
