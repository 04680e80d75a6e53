//! Tree planner.
//!
//! Enumerates the desired filesystem entries for the service tree and the
//! org tree: directories with their ACL shapes, and symlinks with their
//! targets.  The plan is consumed by the reconciler (mutating) and the
//! verifier (read-only); both must see the same entries, so the planner is
//! pure and deterministic.

use std::path::PathBuf;

use crate::acl::AceMode;
use crate::config::{Config, DirPolicy};
use crate::filter::DecidersFilter;
use crate::org::{AccessPolicy, OrgUnit, Organization, Service};

/// The ACL shape of a planned directory.
///
/// One variant per directory kind; `facl_string` is the single canonical
/// formatter for all of them, so the verifier and the reconciler cannot
/// drift apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirAclSpec {
    /// Traditional `rwxr-xr-x` owned `root:root`; the toplevel dirs.
    Simple,
    /// `<serviceDir>/<service>`.
    Service {
        service_gid: u32,
        ops_gid: u32,
        super_gid: Option<u32>,
        access: AccessPolicy,
    },
    /// `<serviceDir>/<service>/<ou>`.
    ServiceOrgUnit {
        ou_gid: u32,
        service_gid: u32,
        ops_gid: u32,
        super_gid: Option<u32>,
    },
    /// `<orgUnitDir>/<ou>`.
    OrgUnit { gid: u32 },
    /// `<orgUnitDir>/<ou>/<subdir>`.
    Subdir { gid: u32, policy: DirPolicy },
}

/// Named-group entries plus mask for one half (normal or default) of a
/// directory ACL.  The anonymous entries are fixed: `user::rwx`,
/// `group::---`, `other::---`.
#[derive(Clone)]
struct AclShape {
    named: Vec<(u32, AceMode)>,
    mask: AceMode,
}

impl AclShape {
    fn lines(&self) -> Vec<String> {
        let mut named = self.named.clone();
        named.sort_by_key(|(gid, _)| *gid);

        let mut lines = vec!["user::rwx".to_string(), "group::---".to_string()];
        for (gid, mode) in named {
            lines.push(format!("group:{gid}:{mode}"));
        }
        lines.push(format!("mask::{}", self.mask));
        lines.push("other::---".to_string());
        lines
    }
}

impl DirAclSpec {
    fn normal_shape(&self) -> Option<AclShape> {
        match self {
            DirAclSpec::Simple => None,
            DirAclSpec::Service {
                service_gid,
                ops_gid,
                super_gid,
                access,
            } => Some(match access {
                AccessPolicy::PerService => AclShape {
                    named: vec![(*service_gid, AceMode::r_x()), (*ops_gid, AceMode::r_x())],
                    mask: AceMode::r_x(),
                },
                // The builder rejects `allOrgUnits` without a super group.
                AccessPolicy::AllOrgUnits => AclShape {
                    named: vec![((*super_gid).unwrap_or(0), AceMode::r_x())],
                    mask: AceMode::r_x(),
                },
            }),
            DirAclSpec::ServiceOrgUnit {
                ou_gid, ops_gid, ..
            } => Some(AclShape {
                named: vec![(*ou_gid, AceMode::rwx()), (*ops_gid, AceMode::rwx())],
                mask: AceMode::rwx(),
            }),
            DirAclSpec::OrgUnit { gid } => Some(AclShape {
                named: vec![(*gid, AceMode::r_x())],
                mask: AceMode::r_x(),
            }),
            DirAclSpec::Subdir { gid, policy } => Some(match policy {
                DirPolicy::Group | DirPolicy::Owner => AclShape {
                    named: vec![(*gid, AceMode::rwx())],
                    mask: AceMode::rwx(),
                },
                DirPolicy::Manager => AclShape {
                    named: vec![(*gid, AceMode::r_x())],
                    mask: AceMode::r_x(),
                },
            }),
        }
    }

    /// The normal and default halves of the ACL.  The `owner` policy is
    /// the sole case where the default differs from the normal shape: new
    /// children default to read-only for the org unit.
    fn shapes(&self) -> Option<(AclShape, AclShape)> {
        let normal = self.normal_shape()?;
        let default = match self {
            DirAclSpec::Subdir {
                gid,
                policy: DirPolicy::Owner,
            } => AclShape {
                named: vec![(*gid, AceMode::r_x())],
                mask: AceMode::r_x(),
            },
            _ => normal.clone(),
        };
        Some((normal, default))
    }

    /// The owning group installed with `chgrp`.
    pub fn owning_gid(&self) -> u32 {
        match self {
            DirAclSpec::Simple => 0,
            DirAclSpec::Service { service_gid, .. } => *service_gid,
            DirAclSpec::ServiceOrgUnit { ou_gid, .. } => *ou_gid,
            DirAclSpec::OrgUnit { gid } => *gid,
            DirAclSpec::Subdir { gid, .. } => *gid,
        }
    }

    /// Whether the directory carries the setgid bit.
    pub fn setgid(&self) -> bool {
        !matches!(self, DirAclSpec::Simple | DirAclSpec::Service { .. })
    }

    /// The gids whose named ACL entries belong to this directory kind.
    /// The verifier ignores named entries outside this set, so unrelated
    /// entries such as sharing traversal ACEs do not fail the check.
    pub fn named_gids(&self) -> Vec<u32> {
        match self {
            DirAclSpec::Simple => vec![],
            DirAclSpec::Service {
                service_gid,
                ops_gid,
                super_gid,
                ..
            } => {
                let mut gids = vec![*service_gid, *ops_gid];
                gids.extend(super_gid.iter());
                gids
            }
            DirAclSpec::ServiceOrgUnit {
                ou_gid,
                service_gid,
                ops_gid,
                super_gid,
            } => {
                let mut gids = vec![*ou_gid, *service_gid, *ops_gid];
                gids.extend(super_gid.iter());
                gids
            }
            DirAclSpec::OrgUnit { gid } => vec![*gid],
            DirAclSpec::Subdir { gid, .. } => vec![*gid],
        }
    }

    /// Entries for `setfacl -M -`.  Modifying, not replacing, preserves
    /// named entries owned by other components.
    pub fn modify_entries(&self) -> Vec<String> {
        let Some((normal, default)) = self.shapes() else {
            return vec![
                "user::rwx".to_string(),
                "group::r-x".to_string(),
                "other::r-x".to_string(),
            ];
        };

        let mut entries = normal.lines();
        for line in default.lines() {
            entries.push(format!("default:{line}"));
        }
        entries
    }

    /// Entries for `setfacl -X -`: named groups that must not remain on
    /// this directory, typically inherited from the parent's default ACL.
    pub fn remove_entries(&self) -> Vec<String> {
        let gids: Vec<u32> = match self {
            DirAclSpec::Service {
                service_gid,
                ops_gid,
                super_gid,
                access,
            } => match access {
                AccessPolicy::PerService => super_gid.iter().copied().collect(),
                AccessPolicy::AllOrgUnits => vec![*service_gid, *ops_gid],
            },
            DirAclSpec::ServiceOrgUnit {
                service_gid,
                super_gid,
                ..
            } => {
                let mut gids = vec![*service_gid];
                gids.extend(super_gid.iter());
                gids
            }
            _ => vec![],
        };

        let mut entries: Vec<String> = gids.iter().map(|g| format!("group:{g}")).collect();
        entries.extend(gids.iter().map(|g| format!("default:group:{g}")));
        entries
    }

    /// The entries propagated to descendants under `--recursive`: the
    /// default ACL becomes the normal ACL of every descendant directory,
    /// and descendant files get the normal entries with the user, mask,
    /// and other x-bits cleared (group x-bits stay, so effective
    /// permissions remain mask-limited).
    ///
    /// Only the per-org-unit directory kinds propagate; toplevel and
    /// service dirs do not.
    pub fn recursive_entries(&self) -> Option<(Vec<String>, Vec<String>)> {
        match self {
            DirAclSpec::ServiceOrgUnit { .. } | DirAclSpec::Subdir { .. } => {}
            _ => return None,
        }
        let (_, shape) = self.shapes()?;

        let mut dir_entries = shape.lines();
        for line in shape.lines() {
            dir_entries.push(format!("default:{line}"));
        }

        let mut named = shape.named.clone();
        named.sort_by_key(|(gid, _)| *gid);
        let mut file_entries = vec!["user::rw-".to_string(), "group::---".to_string()];
        for (gid, mode) in named {
            file_entries.push(format!("group:{gid}:{mode}"));
        }
        file_entries.push(format!("mask::{}", shape.mask.without_x()));
        file_entries.push("other::---".to_string());

        Some((dir_entries, file_entries))
    }

    /// Canonical `getfacl -pEn` text without the `# file:` line: owner and
    /// group headers, `# flags: -s-` for setgid dirs, then the ACE lines
    /// with numeric ids and group entries sorted ascending by gid.
    pub fn facl_string(&self) -> String {
        let mut out = format!("# owner: 0\n# group: {}\n", self.owning_gid());
        if self.setgid() {
            out.push_str("# flags: -s-\n");
        }

        match self.shapes() {
            None => {
                out.push_str("user::rwx\ngroup::r-x\nother::r-x");
            }
            Some((normal, default)) => {
                for line in normal.lines() {
                    out.push_str(&line);
                    out.push('\n');
                }
                for line in default.lines() {
                    out.push_str("default:");
                    out.push_str(&line);
                    out.push('\n');
                }
                while out.ends_with('\n') {
                    out.pop();
                }
            }
        }
        out
    }
}

/// A desired filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir(DirAclSpec),
    Symlink { target: PathBuf },
}

impl Entry {
    fn dir(path: PathBuf, spec: DirAclSpec) -> Self {
        Entry {
            path,
            kind: EntryKind::Dir(spec),
        }
    }

    fn symlink(path: PathBuf, target: PathBuf) -> Self {
        Entry {
            path,
            kind: EntryKind::Symlink { target },
        }
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }
}

fn service_is_of_facility(ou: &OrgUnit, s: &Service) -> bool {
    ou.is_facility && ou.facility.as_deref() == Some(s.facility.as_str())
}

/// Enumerates the desired plan: toplevel dirs, the service tree, the org
/// tree, and the explicit config symlinks, in that order.  Deterministic
/// for a given `(config, organization)`.
pub fn plan_tree(cfg: &Config, org: &Organization, filter: &DecidersFilter) -> Vec<Entry> {
    let root = &cfg.root_dir;
    let service_root = root.join(&cfg.service_dir);
    let ou_root = root.join(&cfg.org_unit_dir);

    let mut entries = vec![
        Entry::dir(root.clone(), DirAclSpec::Simple),
        Entry::dir(service_root.clone(), DirAclSpec::Simple),
        Entry::dir(ou_root.clone(), DirAclSpec::Simple),
    ];

    for s in &org.services {
        entries.push(Entry::dir(
            service_root.join(&s.name),
            DirAclSpec::Service {
                service_gid: s.service_group.gid,
                ops_gid: s.service_ops_group.gid,
                super_gid: s.super_group.as_ref().map(|g| g.gid),
                access: s.access,
            },
        ));
    }

    for s in &org.services {
        for ou in &org.org_units {
            let (ok, _) = filter.accept(s, ou);
            if !ok {
                continue;
            }
            entries.push(Entry::dir(
                service_root.join(&s.name).join(&ou.name),
                DirAclSpec::ServiceOrgUnit {
                    ou_gid: ou.ou_group.gid,
                    service_gid: s.service_group.gid,
                    ops_gid: s.service_ops_group.gid,
                    super_gid: s.super_group.as_ref().map(|g| g.gid),
                },
            ));
        }
    }

    for ou in &org.org_units {
        entries.push(Entry::dir(
            ou_root.join(&ou.name),
            DirAclSpec::OrgUnit {
                gid: ou.ou_group.gid,
            },
        ));
    }

    for ou in &org.org_units {
        for s in &org.services {
            let (ok, _) = filter.accept(s, ou);
            if !ok {
                continue;
            }
            let mut target = PathBuf::from("../..");
            target.push(&cfg.service_dir);
            target.push(&s.name);
            if !service_is_of_facility(ou, s) {
                target.push(&ou.name);
            }
            entries.push(Entry::symlink(ou_root.join(&ou.name).join(&s.name), target));
        }
    }

    for ou in &org.org_units {
        for d in &ou.subdirs {
            entries.push(Entry::dir(
                ou_root.join(&ou.name).join(&d.name),
                DirAclSpec::Subdir {
                    gid: ou.ou_group.gid,
                    policy: d.policy,
                },
            ));
        }
    }

    for link in &cfg.symlinks {
        entries.push(Entry::symlink(
            root.join(&link.path),
            PathBuf::from(&link.target),
        ));
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::filter::compile_filter;
    use crate::groups::Group;
    use crate::org::Organization;

    fn group(name: &str, gid: u32) -> Group {
        Group {
            name: name.to_string(),
            gid,
        }
    }

    fn basic_groups() -> Vec<Group> {
        vec![
            group("og_alice", 100),
            group("og_em-facility", 200),
            group("sv_mic1", 300),
            group("sv_em-ops", 400),
            group("all", 10),
        ]
    }

    fn plan_for(config: &str) -> Vec<Entry> {
        let cfg = Config::parse(config).unwrap();
        let (org, unconfigured) = Organization::build(&basic_groups(), &cfg).unwrap();
        assert!(unconfigured.is_empty());
        let filter = compile_filter(&cfg).unwrap();
        plan_tree(&cfg, &org, &filter)
    }

    fn basic_config(access: &str, tail: &str) -> String {
        format!(
            r#"
rootDir = "/fs"
serviceDir = "srv"
orgUnitDir = "org"
orgUnitPrefix = "og"
servicePrefix = "sv"
superGroup = "all"

[[facilities]]
name = "em"
services = ["mic1"]
access = "{access}"
{tail}
"#
        )
    }

    fn find<'a>(entries: &'a [Entry], path: &str) -> &'a Entry {
        entries
            .iter()
            .find(|e| e.path == PathBuf::from(path))
            .unwrap_or_else(|| panic!("no entry for `{path}`"))
    }

    #[test]
    fn test_basic_plan_entries() {
        let entries = plan_for(&basic_config("perService", ""));

        assert_eq!(
            find(&entries, "/fs").kind,
            EntryKind::Dir(DirAclSpec::Simple)
        );
        assert_eq!(
            find(&entries, "/fs/srv").kind,
            EntryKind::Dir(DirAclSpec::Simple)
        );

        assert_eq!(
            find(&entries, "/fs/srv/mic1").kind,
            EntryKind::Dir(DirAclSpec::Service {
                service_gid: 300,
                ops_gid: 400,
                super_gid: Some(10),
                access: AccessPolicy::PerService,
            })
        );
        assert_eq!(
            find(&entries, "/fs/srv/mic1/alice").kind,
            EntryKind::Dir(DirAclSpec::ServiceOrgUnit {
                ou_gid: 100,
                service_gid: 300,
                ops_gid: 400,
                super_gid: Some(10),
            })
        );
        assert_eq!(
            find(&entries, "/fs/srv/mic1/em-facility").kind,
            EntryKind::Dir(DirAclSpec::ServiceOrgUnit {
                ou_gid: 200,
                service_gid: 300,
                ops_gid: 400,
                super_gid: Some(10),
            })
        );

        assert_eq!(
            find(&entries, "/fs/org/alice").kind,
            EntryKind::Dir(DirAclSpec::OrgUnit { gid: 100 })
        );
        assert_eq!(
            find(&entries, "/fs/org/em-facility").kind,
            EntryKind::Dir(DirAclSpec::OrgUnit { gid: 200 })
        );

        assert_eq!(
            find(&entries, "/fs/org/alice/mic1").kind,
            EntryKind::Symlink {
                target: PathBuf::from("../../srv/mic1/alice"),
            }
        );
        // Facility shortcut: the owning facility links to the service
        // toplevel.
        assert_eq!(
            find(&entries, "/fs/org/em-facility/mic1").kind,
            EntryKind::Symlink {
                target: PathBuf::from("../../srv/mic1"),
            }
        );
    }

    #[test]
    fn test_planner_is_deterministic() {
        let a = plan_for(&basic_config("perService", ""));
        let b = plan_for(&basic_config("perService", ""));
        assert_eq!(a, b);
    }

    #[test]
    fn test_filter_reject_omits_pair() {
        let entries = plan_for(&basic_config(
            "perService",
            r#"
[[filter]]
services = ["mic1"]
orgUnits = ["alice"]
action = "reject"
"#,
        ));
        assert!(!entries
            .iter()
            .any(|e| e.path == PathBuf::from("/fs/srv/mic1/alice")));
        assert!(!entries
            .iter()
            .any(|e| e.path == PathBuf::from("/fs/org/alice/mic1")));
        // The facility pair is still accepted by the same-facility decider.
        assert!(entries
            .iter()
            .any(|e| e.path == PathBuf::from("/fs/srv/mic1/em-facility")));
    }

    #[test]
    fn test_subdir_policies() {
        let entries = plan_for(&basic_config(
            "perService",
            r#"
[[orgUnits]]
name = "alice"
subdirs = [
    { name = "shared", policy = "owner" },
    { name = "projects", policy = "group" },
    { name = "archive", policy = "manager" },
]
"#,
        ));
        assert_eq!(
            find(&entries, "/fs/org/alice/shared").kind,
            EntryKind::Dir(DirAclSpec::Subdir {
                gid: 100,
                policy: DirPolicy::Owner,
            })
        );
        assert_eq!(
            find(&entries, "/fs/org/alice/projects").kind,
            EntryKind::Dir(DirAclSpec::Subdir {
                gid: 100,
                policy: DirPolicy::Group,
            })
        );
        assert_eq!(
            find(&entries, "/fs/org/alice/archive").kind,
            EntryKind::Dir(DirAclSpec::Subdir {
                gid: 100,
                policy: DirPolicy::Manager,
            })
        );
    }

    #[test]
    fn test_explicit_symlinks_appended() {
        let entries = plan_for(&basic_config(
            "perService",
            r#"
[[symlinks]]
path = "legacy"
target = "org/alice"
"#,
        ));
        assert_eq!(
            entries.last().unwrap(),
            &Entry::symlink(PathBuf::from("/fs/legacy"), PathBuf::from("org/alice"))
        );
    }

    #[test]
    fn test_service_facl_string_per_service() {
        let spec = DirAclSpec::Service {
            service_gid: 300,
            ops_gid: 400,
            super_gid: Some(10),
            access: AccessPolicy::PerService,
        };
        assert_eq!(
            spec.facl_string(),
            "\
# owner: 0
# group: 300
user::rwx
group::---
group:300:r-x
group:400:r-x
mask::r-x
other::---
default:user::rwx
default:group::---
default:group:300:r-x
default:group:400:r-x
default:mask::r-x
default:other::---"
        );
        assert_eq!(spec.remove_entries(), vec!["group:10", "default:group:10"]);
        assert_eq!(spec.named_gids(), vec![300, 400, 10]);
        assert!(!spec.setgid());
        assert!(spec.recursive_entries().is_none());
    }

    #[test]
    fn test_service_facl_string_all_org_units() {
        let spec = DirAclSpec::Service {
            service_gid: 300,
            ops_gid: 400,
            super_gid: Some(10),
            access: AccessPolicy::AllOrgUnits,
        };
        assert_eq!(
            spec.facl_string(),
            "\
# owner: 0
# group: 300
user::rwx
group::---
group:10:r-x
mask::r-x
other::---
default:user::rwx
default:group::---
default:group:10:r-x
default:mask::r-x
default:other::---"
        );
        assert_eq!(
            spec.remove_entries(),
            vec!["group:300", "group:400", "default:group:300", "default:group:400"]
        );
    }

    #[test]
    fn test_service_org_unit_facl_string() {
        let spec = DirAclSpec::ServiceOrgUnit {
            ou_gid: 100,
            service_gid: 300,
            ops_gid: 400,
            super_gid: Some(10),
        };
        assert_eq!(
            spec.facl_string(),
            "\
# owner: 0
# group: 100
# flags: -s-
user::rwx
group::---
group:100:rwx
group:400:rwx
mask::rwx
other::---
default:user::rwx
default:group::---
default:group:100:rwx
default:group:400:rwx
default:mask::rwx
default:other::---"
        );
        assert_eq!(
            spec.remove_entries(),
            vec!["group:300", "group:10", "default:group:300", "default:group:10"]
        );
        assert!(spec.setgid());
        assert_eq!(spec.owning_gid(), 100);
    }

    #[test]
    fn test_subdir_owner_default_differs_from_normal() {
        let spec = DirAclSpec::Subdir {
            gid: 100,
            policy: DirPolicy::Owner,
        };
        assert_eq!(
            spec.facl_string(),
            "\
# owner: 0
# group: 100
# flags: -s-
user::rwx
group::---
group:100:rwx
mask::rwx
other::---
default:user::rwx
default:group::---
default:group:100:r-x
default:mask::r-x
default:other::---"
        );
    }

    #[test]
    fn test_group_and_manager_normal_equals_default() {
        for policy in [DirPolicy::Group, DirPolicy::Manager] {
            let spec = DirAclSpec::Subdir { gid: 100, policy };
            let text = spec.facl_string();
            let normal: Vec<&str> = text
                .lines()
                .filter(|l| !l.starts_with('#') && !l.starts_with("default:"))
                .collect();
            let default: Vec<String> = text
                .lines()
                .filter_map(|l| l.strip_prefix("default:"))
                .map(|l| l.to_string())
                .collect();
            assert_eq!(normal, default);
        }
    }

    #[test]
    fn test_recursive_entries() {
        let spec = DirAclSpec::ServiceOrgUnit {
            ou_gid: 100,
            service_gid: 300,
            ops_gid: 400,
            super_gid: None,
        };
        let (dirs, files) = spec.recursive_entries().unwrap();
        assert!(dirs.contains(&"group:100:rwx".to_string()));
        assert!(dirs.contains(&"default:group:100:rwx".to_string()));
        assert_eq!(
            files,
            vec![
                "user::rw-",
                "group::---",
                "group:100:rwx",
                "group:400:rwx",
                "mask::rw-",
                "other::---",
            ]
        );

        let owner = DirAclSpec::Subdir {
            gid: 100,
            policy: DirPolicy::Owner,
        };
        let (dirs, files) = owner.recursive_entries().unwrap();
        // The default shape becomes the normal descendant ACL.
        assert!(dirs.contains(&"group:100:r-x".to_string()));
        assert!(files.contains(&"mask::r--".to_string()));
    }

    #[test]
    fn test_simple_spec() {
        let spec = DirAclSpec::Simple;
        assert_eq!(
            spec.facl_string(),
            "# owner: 0\n# group: 0\nuser::rwx\ngroup::r-x\nother::r-x"
        );
        assert_eq!(
            spec.modify_entries(),
            vec!["user::rwx", "group::r-x", "other::r-x"]
        );
        assert!(spec.remove_entries().is_empty());
        assert!(spec.named_gids().is_empty());
    }
}
