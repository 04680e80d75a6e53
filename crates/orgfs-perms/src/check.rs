//! Verifier.
//!
//! Recomputes the plan from `(config, groups)` and reads the filesystem
//! back: unexpected paths, symlink targets, and byte-exact ACL
//! comparisons.  The verifier accumulates every failure instead of
//! stopping early, so operators get the complete picture, and it never
//! mutates the filesystem.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use orgfs_core::filter::DecidersFilter;
use orgfs_core::plan::{plan_tree, EntryKind};
use orgfs_core::{Config, Organization};
use tracing::error;

use crate::driver;
use crate::error::{FsError, FsResult};

/// The outcome of a verification run: the names of failed checks.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub failures: Vec<String>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Verifies the toplevel filesystem structure against a freshly computed
/// plan.  Returns the failing check names; an `Err` means a check could
/// not run at all.
pub fn check_permissions(
    cfg: &Config,
    org: &Organization,
    filter: &DecidersFilter,
) -> FsResult<CheckReport> {
    let plan = plan_tree(cfg, org, filter);
    let service_root = cfg.root_dir.join(&cfg.service_dir);
    let ou_root = cfg.root_dir.join(&cfg.org_unit_dir);

    let explicit: HashMap<PathBuf, PathBuf> = cfg
        .symlinks
        .iter()
        .map(|l| (cfg.root_dir.join(&l.path), PathBuf::from(&l.target)))
        .collect();

    let mut report = CheckReport::default();

    let path_set: HashSet<&Path> = plan
        .iter()
        .map(|e| e.path.as_path())
        .chain(explicit.keys().map(|p| p.as_path()))
        .collect();

    if !check_no_unexpected(&service_root, &path_set)? {
        report.failures.push("no-unexpected-srv".to_string());
    }
    if !check_no_unexpected(&ou_root, &path_set)? {
        report.failures.push("no-unexpected-ou".to_string());
    }

    let mut symlinks_ok = true;
    for entry in &plan {
        let EntryKind::Symlink { target } = &entry.kind else {
            continue;
        };
        if explicit.contains_key(&entry.path) {
            continue;
        }
        if let Some(reason) = check_symlink(&entry.path, target)? {
            symlinks_ok = false;
            error!(
                "symlink `{}` failure; expected target `{}`: {}",
                entry.path.display(),
                target.display(),
                reason
            );
        }
    }
    if !symlinks_ok {
        report.failures.push("symlinks".to_string());
    }

    let mut explicit_ok = true;
    for (path, target) in &explicit {
        if let Some(reason) = check_symlink(path, target)? {
            explicit_ok = false;
            error!(
                "explicit symlink `{}` failure; expected target `{}`: {}",
                path.display(),
                target.display(),
                reason
            );
        }
    }
    if !explicit_ok {
        report.failures.push("explicit-symlinks".to_string());
    }

    let mut acls_ok = true;
    for entry in &plan {
        let EntryKind::Dir(spec) = &entry.kind else {
            continue;
        };
        let facl = match driver::getfacl_numeric(&entry.path) {
            Ok(text) => text,
            Err(e) => {
                acls_ok = false;
                error!("failed to getfacl `{}`: {}", entry.path.display(), e);
                continue;
            }
        };

        // Ignore named group entries owned by other components before the
        // byte-exact comparison.
        let facl = reject_other_named_group_entries(&facl, &spec.named_gids());
        let expected = format!("# file: {}\n{}", entry.path.display(), spec.facl_string());
        if facl != expected {
            acls_ok = false;
            error!(
                "wrong ACL; expected `{}`; got `{}`.",
                expected.replace('\n', ", "),
                facl.replace('\n', ", ")
            );
        }
    }
    if !acls_ok {
        report.failures.push("acls".to_string());
    }

    Ok(report)
}

/// Enumerates `subroot` to depth 2 and reports paths outside the plan.
fn check_no_unexpected(subroot: &Path, path_set: &HashSet<&Path>) -> FsResult<bool> {
    let paths = driver::find_paths_depth2(subroot)
        .map_err(|e| e.context(format!("failed to list `{}`", subroot.display())))?;

    let mut ok = true;
    for p in &paths {
        if path_set.contains(Path::new(p.as_str())) {
            continue;
        }
        ok = false;
        error!("Unexpected path `{p}`");
    }
    Ok(ok)
}

/// Returns a failure reason, or `None` when `path` is a symlink to
/// `target`.  A missing path reads as a failure reason, not an error.
fn check_symlink(path: &Path, target: &Path) -> FsResult<Option<String>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) => return Ok(Some(e.to_string())),
    };
    if !meta.file_type().is_symlink() {
        return Ok(Some("not a symlink".to_string()));
    }
    let actual = fs::read_link(path).map_err(|e| FsError::io("readlink", path, e))?;
    if actual != target {
        return Ok(Some(format!("got `{}`", actual.display())));
    }
    Ok(None)
}

/// Filters out named group ACL lines whose gid is not in `gids`.
fn reject_other_named_group_entries(facl: &str, gids: &[u32]) -> String {
    facl.lines()
        .filter(|line| !is_other_named_group_entry(line, gids))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_other_named_group_entry(line: &str, gids: &[u32]) -> bool {
    if !is_named_group_entry(line) {
        return false;
    }
    !gids
        .iter()
        .any(|gid| line.contains(&format!("group:{gid}:")))
}

fn is_named_group_entry(line: &str) -> bool {
    if line.contains("# ") {
        return false;
    }
    if line.contains("group::") {
        return false;
    }
    line.contains("group:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_symlink() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("mic1");
        std::os::unix::fs::symlink("../../srv/mic1/alice", &link).unwrap();

        assert_eq!(
            check_symlink(&link, Path::new("../../srv/mic1/alice")).unwrap(),
            None
        );
        assert_eq!(
            check_symlink(&link, Path::new("../../srv/mic1")).unwrap(),
            Some("got `../../srv/mic1/alice`".to_string())
        );

        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(
            check_symlink(&file, Path::new("anything")).unwrap(),
            Some("not a symlink".to_string())
        );

        assert!(check_symlink(&tmp.path().join("absent"), Path::new("x"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_reject_other_named_group_entries() {
        let facl = "\
# file: /fs/srv/mic1
# owner: 0
# group: 300
user::rwx
group::---
group:300:r-x
group:400:r-x
group:999:--x
mask::r-x
other::---
default:group:300:r-x
default:group:999:--x";
        let filtered = reject_other_named_group_entries(facl, &[300, 400]);
        assert_eq!(
            filtered,
            "\
# file: /fs/srv/mic1
# owner: 0
# group: 300
user::rwx
group::---
group:300:r-x
group:400:r-x
mask::r-x
other::---
default:group:300:r-x"
        );
    }

    #[test]
    fn test_anonymous_group_lines_are_kept() {
        assert!(!is_named_group_entry("group::---"));
        assert!(!is_named_group_entry("default:group::---"));
        assert!(!is_named_group_entry("# group: 300"));
        assert!(is_named_group_entry("group:300:r-x"));
        assert!(is_named_group_entry("default:group:300:r-x"));
    }

    #[test]
    fn test_check_no_unexpected() {
        let tmp = TempDir::new().unwrap();
        let srv = tmp.path().join("srv");
        std::fs::create_dir_all(srv.join("mic1/alice")).unwrap();

        let expected: Vec<PathBuf> = vec![
            srv.clone(),
            srv.join("mic1"),
            srv.join("mic1/alice"),
        ];
        let path_set: HashSet<&Path> = expected.iter().map(|p| p.as_path()).collect();
        assert!(check_no_unexpected(&srv, &path_set).unwrap());

        std::fs::create_dir(srv.join("stale")).unwrap();
        assert!(!check_no_unexpected(&srv, &path_set).unwrap());
    }
}
