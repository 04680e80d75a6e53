//! Sharing reconciler.
//!
//! Applies the compiled sharing specification: named-group ACLs on real
//! share paths, traversal `--x` entries on ancestors, and the
//! `<ou>/shared` symlink forests.  All operations converge: re-running on
//! an already-correct filesystem changes nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use orgfs_core::acl::{FileAcl, FsAce};
use orgfs_core::sharing::{ExportEntry, FsLayout, ShareTree};
use tracing::info;

use crate::driver;
use crate::error::{FsError, FsResult};

/// Applies the filesystem ACLs for the real shares.  Paths missing on disk
/// are skipped.
pub fn ensure_real_shares(layout: &FsLayout, real_shares: &[ExportEntry]) -> FsResult<()> {
    let root = &layout.root_dir;
    let paths: Vec<String> = real_shares.iter().map(|r| r.path.clone()).collect();
    let facls = driver::getfacl_paths(root, &paths)?;
    if facls.is_empty() {
        return Ok(());
    }

    let by_path: HashMap<&str, &FileAcl> =
        facls.iter().map(|f| (f.path.as_str(), f)).collect();

    for rs in real_shares {
        let Some(actual) = by_path.get(rs.path.as_str()) else {
            continue;
        };
        let desired = rs.acl.as_fs_aces(layout);
        let managing = layout.fs_groups(&rs.managing_groups);
        ensure_facl(root, &rs.path, actual, &desired, &managing)?;
    }

    Ok(())
}

fn ensure_facl(
    root: &Path,
    path: &str,
    actual: &FileAcl,
    desired: &[FsAce],
    managing_groups: &[String],
) -> FsResult<()> {
    if facl_need_modify(actual, desired) {
        let mut dir_entries = Vec::with_capacity(2 * desired.len());
        let mut file_entries = Vec::with_capacity(desired.len());
        for ace in desired {
            let s = ace.to_string();
            dir_entries.push(s.clone());
            dir_entries.push(format!("default:{s}"));
            file_entries.push(ace.without_x().to_string());
        }
        driver::setfacl_tree_modify(root, path, &dir_entries, &file_entries)?;
        info!(
            "Updated sharing ACL {}/{} {}",
            root.display(),
            path,
            dir_entries.join(",")
        );
    }

    let remove_groups = facl_groups_to_remove(actual, desired, managing_groups);
    if !remove_groups.is_empty() {
        let mut entries = Vec::with_capacity(2 * remove_groups.len());
        for g in &remove_groups {
            entries.push(format!("group:{g}"));
            entries.push(format!("default:group:{g}"));
        }
        driver::setfacl_tree_remove(root, path, &entries)?;
        info!(
            "Removed sharing ACL {}/{} {}",
            root.display(),
            path,
            entries.join(",")
        );
    }

    Ok(())
}

/// Whether the actual ACL is missing any desired named-group entry, normal
/// or default.
fn facl_need_modify(actual: &FileAcl, desired: &[FsAce]) -> bool {
    let have: HashSet<String> = actual
        .named_group_entries()
        .iter()
        .map(|a| a.to_string())
        .collect();

    desired.iter().any(|ace| {
        let s = ace.to_string();
        !have.contains(&s) || !have.contains(&format!("default:{s}"))
    })
}

/// Actual named groups minus desired groups minus the managing groups,
/// sorted.  Excluding the managing groups keeps the sharing reconciler
/// from stripping the core's own ACL entries.
fn facl_groups_to_remove(
    actual: &FileAcl,
    desired: &[FsAce],
    managing_groups: &[String],
) -> Vec<String> {
    let mut groups: std::collections::BTreeSet<String> = actual
        .named_group_entries()
        .iter()
        .filter_map(|a| a.group_name().map(|g| g.to_string()))
        .collect();
    for ace in desired {
        if let Some(g) = ace.group_name() {
            groups.remove(g);
        }
    }
    for g in managing_groups {
        groups.remove(g);
    }
    groups.into_iter().collect()
}

/// Adds missing traversal `--x` entries, one `setfacl` batch per group.
pub fn ensure_traversal(layout: &FsLayout, traversal: &[ExportEntry]) -> FsResult<()> {
    let root = &layout.root_dir;
    let paths: Vec<String> = traversal.iter().map(|t| t.path.clone()).collect();
    let facls = driver::getfacl_paths(root, &paths)?;
    let by_path: HashMap<&str, &FileAcl> =
        facls.iter().map(|f| (f.path.as_str(), f)).collect();

    // Gather paths per group so each group is applied with a single
    // `xargs | setfacl` child.
    let mut paths_by_group: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for tr in traversal {
        let Some(actual) = by_path.get(tr.path.as_str()) else {
            continue;
        };
        let have: HashSet<String> = actual
            .named_group_normal_entries()
            .iter()
            .map(|a| a.to_string())
            .collect();

        for ace in &tr.acl.0 {
            let fs_group = layout.fs_group_org_unit(&ace.group);
            let ace_str = format!("group:{fs_group}:--x");
            if !have.contains(&ace_str) {
                paths_by_group.entry(fs_group).or_default().push(tr.path.clone());
            }
        }
    }

    for (group, paths) in &paths_by_group {
        driver::setfacl_paths_traversal(root, paths, group)?;
        for p in paths {
            info!(
                "Added sharing traversal ACL group {}/{} {}",
                root.display(),
                p,
                group
            );
        }
    }

    Ok(())
}

/// Applies the `<ou>/shared` trees.
pub fn ensure_share_trees(layout: &FsLayout, share_trees: &[ShareTree]) -> FsResult<()> {
    for tree in share_trees {
        ensure_share_tree(layout, tree)?;
    }
    Ok(())
}

fn ensure_share_tree(layout: &FsLayout, tree: &ShareTree) -> FsResult<()> {
    let expected: HashMap<&str, Option<&str>> = tree
        .files
        .iter()
        .map(|f| (f.path.as_str(), f.target.as_deref()))
        .collect();

    let tree_root = layout
        .root_dir
        .join(&layout.org_unit_dir)
        .join(&tree.org_unit)
        .join("shared");

    // Gather unexpected files in `rm` and expected existing files in
    // `existing`.
    let mut rm: Vec<PathBuf> = Vec::new();
    let mut existing: HashSet<String> = HashSet::new();
    walk_tree(&tree_root, &mut |path, file_type| {
        let relpath = path
            .strip_prefix(&layout.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        match expected.get(relpath.as_str()) {
            None => rm.push(path.to_path_buf()),
            Some(None) => {
                if file_type.is_dir() {
                    existing.insert(relpath);
                } else {
                    rm.push(path.to_path_buf());
                }
            }
            Some(Some(target)) => {
                if file_type.is_symlink()
                    && fs::read_link(path)
                        .map(|t| t == Path::new(target))
                        .unwrap_or(false)
                {
                    existing.insert(relpath);
                } else {
                    rm.push(path.to_path_buf());
                }
            }
        }
        Ok(())
    })?;

    // Remove unexpected files depth-first: children disappear before their
    // parents.
    rm.sort();
    rm.reverse();
    for path in &rm {
        driver::remove(path)?;
        info!("Removed unexpected sharing file {}", path.display());
    }

    // Create missing files in path order.
    for f in &tree.files {
        if existing.contains(&f.path) {
            continue;
        }
        let path = layout.root_dir.join(&f.path);
        match &f.target {
            None => {
                fs::create_dir(&path).map_err(|e| FsError::io("mkdir", &path, e))?;
                info!("Created sharing directory {}", path.display());
            }
            Some(target) => {
                driver::symlink(Path::new(target), &path)?;
                info!("Created sharing symlink {}", path.display());
            }
        }
    }

    Ok(())
}

/// Depth-first walk below `dir` (the dir itself is not visited).  Visits
/// every entry, descending into directories, including unexpected ones so
/// their children can be scheduled for removal first.
fn walk_tree(
    dir: &Path,
    visit: &mut impl FnMut(&Path, fs::FileType) -> FsResult<()>,
) -> FsResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| FsError::io("read dir", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io("read dir", dir, e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| FsError::io("read dir", dir, e))?;
        let path = entry.path();
        visit(&path, file_type)?;
        if file_type.is_dir() {
            walk_tree(&path, visit)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgfs_core::acl::AceMode;
    use orgfs_core::sharing::ShareFile;
    use orgfs_core::Config;
    use tempfile::TempDir;

    fn layout_at(root: &Path) -> FsLayout {
        let cfg = Config::parse(&format!(
            r#"
rootDir = "{}"
serviceDir = "srv"
orgUnitDir = "org"
orgUnitPrefix = "og"
servicePrefix = "sv"
"#,
            root.display()
        ))
        .unwrap();
        FsLayout::new(&cfg)
    }

    fn file_acl(path: &str, entries: &[&str]) -> FileAcl {
        FileAcl {
            path: path.to_string(),
            aces: entries.iter().map(|e| FsAce::parse(e).unwrap()).collect(),
        }
    }

    #[test]
    fn test_facl_need_modify() {
        let desired = vec![FsAce::named_group("og_bob", AceMode::r_x())];

        let complete = file_acl(
            "srv/mic1/alice/foo",
            &[
                "user::rwx",
                "group:og_bob:r-x",
                "default:group:og_bob:r-x",
            ],
        );
        assert!(!facl_need_modify(&complete, &desired));

        let missing_default = file_acl("srv/mic1/alice/foo", &["group:og_bob:r-x"]);
        assert!(facl_need_modify(&missing_default, &desired));

        let wrong_mode = file_acl(
            "srv/mic1/alice/foo",
            &["group:og_bob:r--", "default:group:og_bob:r--"],
        );
        assert!(facl_need_modify(&wrong_mode, &desired));
    }

    #[test]
    fn test_facl_groups_to_remove_spares_managing_groups() {
        let actual = file_acl(
            "srv/mic1/alice/foo",
            &[
                "group:og_alice:rwx",
                "group:sv_em-ops:rwx",
                "group:og_bob:r-x",
                "group:og_stale:r-x",
                "default:group:og_stale:r-x",
            ],
        );
        let desired = vec![FsAce::named_group("og_bob", AceMode::r_x())];
        let managing = vec!["og_alice".to_string(), "sv_em-ops".to_string()];
        assert_eq!(
            facl_groups_to_remove(&actual, &desired, &managing),
            vec!["og_stale"]
        );
    }

    #[test]
    fn test_ensure_share_tree_creates_and_converges() {
        let tmp = TempDir::new().unwrap();
        let layout = layout_at(tmp.path());
        fs::create_dir_all(tmp.path().join("org/alice/shared")).unwrap();

        let tree = ShareTree {
            org_unit: "alice".to_string(),
            files: vec![
                ShareFile {
                    path: "org/alice/shared/alice".to_string(),
                    target: None,
                },
                ShareFile {
                    path: "org/alice/shared/alice/mic1".to_string(),
                    target: None,
                },
                ShareFile {
                    path: "org/alice/shared/alice/mic1/foo".to_string(),
                    target: Some("../../../../alice/mic1/foo".to_string()),
                },
            ],
        };

        ensure_share_tree(&layout, &tree).unwrap();
        let link = tmp.path().join("org/alice/shared/alice/mic1/foo");
        assert!(link.is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("../../../../alice/mic1/foo")
        );

        // A second run changes nothing and succeeds.
        ensure_share_tree(&layout, &tree).unwrap();
        assert!(link.is_symlink());
    }

    #[test]
    fn test_ensure_share_tree_removes_unexpected_depth_first() {
        let tmp = TempDir::new().unwrap();
        let layout = layout_at(tmp.path());
        let shared = tmp.path().join("org/alice/shared");
        fs::create_dir_all(shared.join("stale/deep")).unwrap();
        std::os::unix::fs::symlink("nowhere", shared.join("stale/deep/link")).unwrap();

        let tree = ShareTree {
            org_unit: "alice".to_string(),
            files: vec![],
        };
        ensure_share_tree(&layout, &tree).unwrap();
        assert!(!shared.join("stale").exists());
        assert!(shared.is_dir());
    }

    #[test]
    fn test_ensure_share_tree_replaces_wrong_target() {
        let tmp = TempDir::new().unwrap();
        let layout = layout_at(tmp.path());
        let shared = tmp.path().join("org/alice/shared");
        fs::create_dir_all(shared.join("alice")).unwrap();
        std::os::unix::fs::symlink("../../wrong", shared.join("alice/foo")).unwrap();

        let tree = ShareTree {
            org_unit: "alice".to_string(),
            files: vec![
                ShareFile {
                    path: "org/alice/shared/alice".to_string(),
                    target: None,
                },
                ShareFile {
                    path: "org/alice/shared/alice/foo".to_string(),
                    target: Some("../../../alice/foo".to_string()),
                },
            ],
        };
        ensure_share_tree(&layout, &tree).unwrap();
        assert_eq!(
            fs::read_link(shared.join("alice/foo")).unwrap(),
            PathBuf::from("../../../alice/foo")
        );
    }

    #[test]
    fn test_ensure_share_tree_fails_without_shared_dir() {
        let tmp = TempDir::new().unwrap();
        let layout = layout_at(tmp.path());
        let tree = ShareTree {
            org_unit: "alice".to_string(),
            files: vec![],
        };
        assert!(ensure_share_tree(&layout, &tree).is_err());
    }
}
