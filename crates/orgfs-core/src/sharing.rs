//! Logical sharing compiler.
//!
//! Org units export paths with group ACLs; other org units import them.
//! `compile_sharing` turns the declarative sharing block into three
//! reconcilable artifacts: ACLs on real filesystem paths (union-merged when
//! several logical paths alias one real path), traversal `--x` ACLs on
//! ancestor directories, and `<ou>/shared` symlink forests.
//!
//! Paths come in two flavors.  A *logical* path is what an org unit writes
//! in the config, rooted at an org-unit name (`alice/mic1/foo` or
//! `em-facility/mic1/alice/foo`).  A *real* path is the on-disk location
//! relative to the root dir (`srv/mic1/alice/foo`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use regex::Regex;

use crate::acl::{AceMode, FsAce};
use crate::config::{Config, SharingConfig};
use crate::error::{ModelError, ModelResult};

/// Maps logical paths and group names to real filesystem paths and groups.
#[derive(Debug, Clone)]
pub struct FsLayout {
    pub root_dir: PathBuf,
    pub service_dir: String,
    pub org_unit_dir: String,
    service_prefix: String,
    org_unit_prefix: String,
    ops_suffix: String,
    facility_suffix: String,
    facility_by_service: HashMap<String, String>,
    facility_dirs: HashSet<String>,
}

/// A group that manages a shared path and must keep its ACL entries when
/// the sharing reconciler strips foreign groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagingGroup {
    pub kind: ManagingGroupKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagingGroupKind {
    /// The org-unit component of the path.
    Ou,
    /// The ops group of the owning facility, for service paths.
    Ops,
}

impl ManagingGroup {
    fn ou(name: &str) -> Self {
        ManagingGroup {
            kind: ManagingGroupKind::Ou,
            name: name.to_string(),
        }
    }

    fn ops(name: &str) -> Self {
        ManagingGroup {
            kind: ManagingGroupKind::Ops,
            name: name.to_string(),
        }
    }
}

impl FsLayout {
    pub fn new(cfg: &Config) -> Self {
        let mut facility_by_service = HashMap::new();
        let mut facility_dirs = HashSet::new();
        for fac in &cfg.facilities {
            for srv in &fac.services {
                facility_by_service.insert(srv.clone(), fac.name.clone());
            }
            facility_dirs.insert(format!("{}-{}", fac.name, cfg.facility_suffix));
        }
        FsLayout {
            root_dir: cfg.root_dir.clone(),
            service_dir: cfg.service_dir.clone(),
            org_unit_dir: cfg.org_unit_dir.clone(),
            service_prefix: cfg.service_prefix.clone(),
            org_unit_prefix: cfg.org_unit_prefix.clone(),
            ops_suffix: cfg.ops_suffix.clone(),
            facility_suffix: cfg.facility_suffix.clone(),
            facility_by_service,
            facility_dirs,
        }
    }

    /// The filesystem group of an org unit.
    pub fn fs_group_org_unit(&self, ou: &str) -> String {
        format!("{}_{}", self.org_unit_prefix, ou)
    }

    /// Filesystem group names for managing groups.
    pub fn fs_groups(&self, groups: &[ManagingGroup]) -> Vec<String> {
        groups
            .iter()
            .map(|g| match g.kind {
                ManagingGroupKind::Ou => self.fs_group_org_unit(&g.name),
                ManagingGroupKind::Ops => {
                    format!("{}_{}-{}", self.service_prefix, g.name, self.ops_suffix)
                }
            })
            .collect()
    }

    fn facility_of_service_path(&self, path: &str) -> Option<&str> {
        let mut parts = path.split('/');
        let _first = parts.next()?;
        let maybe_srv = parts.next()?;
        self.facility_by_service.get(maybe_srv).map(|s| s.as_str())
    }

    /// Whether the second component of the logical path is a known service.
    pub fn is_service_path(&self, path: &str) -> bool {
        self.facility_of_service_path(path).is_some()
    }

    /// The facility org-unit directory name owning the service of a
    /// service path, e.g. `em-facility`.
    pub fn facility_dir_of_service_path(&self, path: &str) -> Option<String> {
        let fac = self.facility_of_service_path(path)?;
        Some(format!("{fac}-{}", self.facility_suffix))
    }

    /// Whether a real path lies under the service dir.
    pub fn is_service_realpath(&self, path: &str) -> bool {
        path.split('/').next() == Some(self.service_dir.as_str())
    }

    /// Whether the first component of a logical path is a facility dir.
    pub fn is_facility_path(&self, path: &str) -> bool {
        match path.split('/').next() {
            Some(first) => self.facility_dirs.contains(first),
            None => false,
        }
    }

    /// The groups that manage `path` and must retain their ACL entries.
    pub fn managing_groups_of_path(&self, path: &str) -> ModelResult<Vec<ManagingGroup>> {
        let parts: Vec<&str> = path.split('/').collect();

        // Only the ou manages non-service paths.
        if !self.is_service_path(path) {
            return Ok(vec![ManagingGroup::ou(parts[0])]);
        }

        let ou = if self.is_facility_path(path) {
            // `<fac>/<srv>/<ou>`; <fac> and <ou> may be equal.
            *parts.get(2).ok_or_else(|| {
                ModelError::SharingInvalid(format!("service path `{path}` too short"))
            })?
        } else {
            // `<ou>/<srv>`.
            parts[0]
        };
        let srv = parts[1];
        let fac = self
            .facility_by_service
            .get(srv)
            .map(|s| s.as_str())
            .unwrap_or_default();

        Ok(vec![ManagingGroup::ou(ou), ManagingGroup::ops(fac)])
    }

    /// Maps a logical path to a real path relative to the root dir.
    pub fn realpath(&self, path: &str) -> String {
        if !self.is_service_path(path) {
            return join_parts(&[&self.org_unit_dir, path]);
        }

        let parts: Vec<&str> = path.split('/').collect();
        if self.is_facility_path(path) {
            let mut out = vec![self.service_dir.as_str()];
            out.extend(&parts[1..]);
            return out.join("/");
        }

        let ou = parts[0];
        let srv = parts[1];
        let mut out = vec![self.service_dir.as_str(), srv, ou];
        out.extend(&parts[2..]);
        out.join("/")
    }
}

fn join_parts(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// One grantee entry of a logical share ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareAce {
    pub group: String,
    pub mode: AceMode,
}

/// A logical share ACL: grantee org-unit groups with modes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShareAcl(pub Vec<ShareAce>);

impl ShareAcl {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn groups(&self) -> Vec<String> {
        self.0.iter().map(|a| a.group.clone()).collect()
    }

    /// Per-group union; groups unique to either side are kept, in order.
    pub fn union(&self, other: &ShareAcl) -> ShareAcl {
        let mut merged = self.0.clone();
        let mut by_group: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, a)| (a.group.clone(), i))
            .collect();
        for ace in &other.0 {
            match by_group.get(&ace.group) {
                Some(&i) => merged[i].mode = merged[i].mode.union(ace.mode),
                None => {
                    by_group.insert(ace.group.clone(), merged.len());
                    merged.push(ace.clone());
                }
            }
        }
        ShareAcl(merged)
    }

    /// Maps the logical grantee groups to filesystem named-group entries.
    pub fn as_fs_aces(&self, layout: &FsLayout) -> Vec<FsAce> {
        self.0
            .iter()
            .map(|a| FsAce::named_group(&layout.fs_group_org_unit(&a.group), a.mode))
            .collect()
    }

    fn traversal_for_groups(groups: &[String]) -> ShareAcl {
        ShareAcl(
            groups
                .iter()
                .map(|g| ShareAce {
                    group: g.clone(),
                    mode: AceMode::x_only(),
                })
                .collect(),
        )
    }
}

/// One export, logical or real depending on context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub path: String,
    pub acl: ShareAcl,
    pub managing_groups: Vec<ManagingGroup>,
}

/// A file in a shared tree.  `target == None` is a directory; `Some` is a
/// symlink with a relative target.  `path` is a real path relative to the
/// root dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareFile {
    pub path: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareTree {
    pub org_unit: String,
    pub files: Vec<ShareFile>,
}

/// The compiled sharing specification.
#[derive(Debug, Clone)]
pub struct Sharing {
    pub layout: FsLayout,
    /// Active exports, that is exports that were also imported.  Logical
    /// paths.
    pub shares: Vec<ExportEntry>,
    /// ACLs on real paths relative to the root dir.
    pub real_shares: Vec<ExportEntry>,
    /// `--x` ACLs on ancestor directories, real paths.
    pub traversal: Vec<ExportEntry>,
    /// `<orgUnitDir>/<ou>/shared` tree specifications.
    pub share_trees: Vec<ShareTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamingAction {
    Allow,
    Deny,
}

struct NamingRule {
    action: NamingAction,
    rgx: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportAction {
    Accept,
    Reject,
}

struct ImportRule {
    group: String,
    rgx: Regex,
    action: ImportAction,
}

/// Compiles the sharing block of `cfg`.  Fails with `SharingInvalid` on the
/// first violated rule; no partial specification leaks.
pub fn compile_sharing(cfg: &Config) -> ModelResult<Sharing> {
    let sharing = cfg
        .sharing
        .as_ref()
        .ok_or_else(|| ModelError::SharingInvalid("missing `sharing` block".to_string()))?;
    let layout = FsLayout::new(cfg);

    let imports = compile_imports(sharing)?;
    let exports = compile_exports(&layout, sharing)?;
    let policy = compile_naming_policy(sharing)?;

    check_export_paths(&exports, &policy)?;
    check_export_acl_scopes(&layout, &exports)?;
    check_no_nesting(&exports)?;
    check_no_realpath_nesting(&layout, &exports)?;

    let shares = select_imported_exports(exports, &imports);
    let real_shares = compile_real_shares(&layout, &shares);
    let traversal = compile_traversal(&layout, &shares, &real_shares);
    let share_trees = compile_share_trees(&layout, &shares);

    Ok(Sharing {
        layout,
        shares,
        real_shares,
        traversal,
        share_trees,
    })
}

fn compile_anchored(pattern: &str, what: &str) -> ModelResult<Regex> {
    Regex::new(&format!("^{pattern}$"))
        .map_err(|e| ModelError::SharingInvalid(format!("failed to compile {what}: {e}")))
}

fn compile_imports(sharing: &SharingConfig) -> ModelResult<Vec<ImportRule>> {
    sharing
        .imports
        .iter()
        .map(|imp| {
            Ok(ImportRule {
                group: imp.group.clone(),
                rgx: compile_anchored(&imp.pattern, "import match")?,
                action: match imp.action.as_str() {
                    "accept" => ImportAction::Accept,
                    _ => ImportAction::Reject,
                },
            })
        })
        .collect()
}

fn compile_naming_policy(sharing: &SharingConfig) -> ModelResult<Vec<NamingRule>> {
    sharing
        .naming_policies
        .iter()
        .map(|pol| {
            Ok(NamingRule {
                rgx: compile_anchored(&pol.pattern, "naming policy match")?,
                action: match pol.action.as_str() {
                    "allow" => NamingAction::Allow,
                    _ => NamingAction::Deny,
                },
            })
        })
        .collect()
}

fn compile_exports(layout: &FsLayout, sharing: &SharingConfig) -> ModelResult<Vec<ExportEntry>> {
    let mut exports = Vec::with_capacity(sharing.exports.len());
    for exp in &sharing.exports {
        let acl = parse_share_acl(&exp.acl)?;
        let path = exp.path.trim_matches('/').to_string();
        let managing_groups = layout.managing_groups_of_path(&path)?;
        exports.push(ExportEntry {
            path,
            acl,
            managing_groups,
        });
    }
    Ok(exports)
}

fn parse_share_acl(entries: &[String]) -> ModelResult<ShareAcl> {
    let mut aces = Vec::with_capacity(entries.len());
    for entry in entries {
        let malformed =
            || ModelError::SharingInvalid(format!("malformed ACL entry `{entry}`"));
        let rest = entry.strip_prefix("group:").ok_or_else(malformed)?;
        let (group, mode_str) = rest.split_once(':').ok_or_else(malformed)?;
        if group.is_empty()
            || !group
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(malformed());
        }
        let mode = AceMode::parse(mode_str).map_err(|_| malformed())?;
        aces.push(ShareAce {
            group: group.to_string(),
            mode,
        });
    }
    Ok(ShareAcl(aces))
}

/// Verifies that exported paths are allowed by the naming policy: first
/// matching rule decides; default deny.
fn check_export_paths(exports: &[ExportEntry], policy: &[NamingRule]) -> ModelResult<()> {
    'exports: for exp in exports {
        for rule in policy {
            if !rule.rgx.is_match(&exp.path) {
                continue;
            }
            match rule.action {
                NamingAction::Allow => continue 'exports,
                NamingAction::Deny => {
                    return Err(ModelError::SharingInvalid(format!(
                        "naming policy: rule denied export path `{}`",
                        exp.path
                    )))
                }
            }
        }
        return Err(ModelError::SharingInvalid(format!(
            "naming policy: default deny export path `{}`",
            exp.path
        )));
    }
    Ok(())
}

/// Verifies that exports do not grant to the groups whose ACLs the core
/// reconciler manages: the path's own org unit and, for service paths, the
/// owning facility.
fn check_export_acl_scopes(layout: &FsLayout, exports: &[ExportEntry]) -> ModelResult<()> {
    for exp in exports {
        let groups: HashSet<&str> = exp.acl.0.iter().map(|a| a.group.as_str()).collect();

        let ou = exp.path.split('/').next().unwrap_or_default();
        if groups.contains(ou) {
            return Err(ModelError::SharingInvalid(format!(
                "self export `{}`",
                exp.path
            )));
        }

        if let Some(fac_dir) = layout.facility_dir_of_service_path(&exp.path) {
            if groups.contains(fac_dir.as_str()) {
                return Err(ModelError::SharingInvalid(format!(
                    "export to owning facility `{}`",
                    exp.path
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeType {
    Inner,
    Leaf,
}

fn check_no_nesting(exports: &[ExportEntry]) -> ModelResult<()> {
    let mut tree: HashMap<String, NodeType> = HashMap::new();

    'exports: for exp in exports {
        let path = &exp.path;
        match tree.get(path) {
            Some(NodeType::Leaf) => {
                return Err(ModelError::SharingInvalid(format!(
                    "duplicate export `{path}`"
                )))
            }
            Some(NodeType::Inner) => {
                return Err(ModelError::SharingInvalid(format!(
                    "nested export prefix `{path}`"
                )))
            }
            None => {}
        }
        tree.insert(path.clone(), NodeType::Leaf);

        let parts: Vec<&str> = path.split('/').collect();
        for i in (1..parts.len()).rev() {
            let prefix = parts[..i].join("/");
            match tree.get(&prefix) {
                Some(NodeType::Leaf) => {
                    return Err(ModelError::SharingInvalid(format!(
                        "nested export suffix `{path}`"
                    )))
                }
                Some(NodeType::Inner) => continue 'exports,
                None => {
                    tree.insert(prefix, NodeType::Inner);
                }
            }
        }
    }
    Ok(())
}

fn check_no_realpath_nesting(layout: &FsLayout, exports: &[ExportEntry]) -> ModelResult<()> {
    let mut tree: HashMap<String, NodeType> = HashMap::new();

    'exports: for exp in exports {
        let path = layout.realpath(&exp.path);
        match tree.get(&path) {
            // Duplicate realpaths are allowed; they union-merge later.
            Some(NodeType::Leaf) => continue 'exports,
            Some(NodeType::Inner) => {
                return Err(ModelError::SharingInvalid(format!(
                    "nested realpath prefix `{path}`"
                )))
            }
            None => {}
        }
        tree.insert(path.clone(), NodeType::Leaf);

        let parts: Vec<&str> = path.split('/').collect();
        for i in (1..parts.len()).rev() {
            let prefix = parts[..i].join("/");
            match tree.get(&prefix) {
                Some(NodeType::Leaf) => {
                    return Err(ModelError::SharingInvalid(format!(
                        "nested realpath suffix `{path}`"
                    )))
                }
                Some(NodeType::Inner) => continue 'exports,
                None => {
                    tree.insert(prefix, NodeType::Inner);
                }
            }
        }
    }
    Ok(())
}

/// Returns exports that are also imported.
///
/// An export with an empty ACL is retained as an *unexport*: the reconciler
/// strips the path's sharing ACLs even though no import selects it.
/// Exports whose ACLs are fully filtered out are dropped.
fn select_imported_exports(
    exports: Vec<ExportEntry>,
    imports: &[ImportRule],
) -> Vec<ExportEntry> {
    let mut selected = Vec::with_capacity(exports.len());
    for exp in exports {
        if exp.acl.is_empty() {
            selected.push(exp);
            continue;
        }

        let aces: Vec<ShareAce> = exp
            .acl
            .0
            .into_iter()
            .filter(|ace| filter_path_ace(imports, &exp.path, ace) == ImportAction::Accept)
            .collect();
        if !aces.is_empty() {
            selected.push(ExportEntry {
                path: exp.path,
                acl: ShareAcl(aces),
                managing_groups: exp.managing_groups,
            });
        }
    }
    selected
}

/// The first import rule matching both group and path decides; default
/// reject.
fn filter_path_ace(imports: &[ImportRule], path: &str, ace: &ShareAce) -> ImportAction {
    for imp in imports {
        if imp.group != ace.group {
            continue;
        }
        if !imp.rgx.is_match(path) {
            continue;
        }
        return imp.action;
    }
    ImportAction::Reject
}

/// Maps shares to realpaths.  Multiple logical paths may map to the same
/// realpath; the realpath ACL is the union of the contributing ACLs.
fn compile_real_shares(layout: &FsLayout, shares: &[ExportEntry]) -> Vec<ExportEntry> {
    let mut reals: Vec<ExportEntry> = Vec::with_capacity(shares.len());
    let mut by_realpath: HashMap<String, usize> = HashMap::new();
    for share in shares {
        let rp = layout.realpath(&share.path);
        match by_realpath.get(&rp) {
            Some(&idx) => {
                reals[idx].acl = reals[idx].acl.union(&share.acl);
            }
            None => {
                by_realpath.insert(rp.clone(), reals.len());
                reals.push(ExportEntry {
                    path: rp,
                    acl: share.acl.clone(),
                    managing_groups: share.managing_groups.clone(),
                });
            }
        }
    }
    reals
}

/// Computes `--x` ACLs on ancestor directories so symlinks from the shared
/// trees can be resolved.
fn compile_traversal(
    layout: &FsLayout,
    shares: &[ExportEntry],
    reals: &[ExportEntry],
) -> Vec<ExportEntry> {
    let mut travs: Vec<ExportEntry> = Vec::new();
    let mut by_realpath: HashMap<String, usize> = HashMap::new();

    let mut merge = |path: String, acl: ShareAcl, managing: Vec<ManagingGroup>| {
        match by_realpath.get(&path) {
            Some(&idx) => travs[idx].acl = travs[idx].acl.union(&acl),
            None => {
                by_realpath.insert(path.clone(), travs.len());
                travs.push(ExportEntry {
                    path,
                    acl,
                    managing_groups: managing,
                });
            }
        }
    };

    // Allow directory traversal along realpaths.  Do not add `--x` to
    // `<serviceDir>/<srv>` itself, only to subdirs, so that service group
    // membership remains required to reach the realpath.
    for r in reals {
        let acl = ShareAcl::traversal_for_groups(&r.acl.groups());
        let parts: Vec<&str> = r.path.split('/').collect();
        let begin = if layout.is_service_realpath(&r.path) {
            3
        } else {
            2
        };
        for i in begin..parts.len() {
            merge(
                parts[..i].join("/"),
                acl.clone(),
                r.managing_groups.clone(),
            );
        }
    }

    // Allow traversal of ou toplevel directories to reach the symlinks.
    for share in shares {
        let acl = ShareAcl::traversal_for_groups(&share.acl.groups());
        let ou = share.path.split('/').next().unwrap_or_default();
        let path = join_parts(&[&layout.org_unit_dir, ou]);
        merge(path, acl, vec![]);
    }

    travs
}

/// Builds the `<orgUnitDir>/<ou>/shared` trees: one tree for every
/// exporting ou and every grantee ou, with relative symlinks to the shared
/// content.  Emission is deterministic: trees sorted by org unit, files by
/// path.
fn compile_share_trees(layout: &FsLayout, shares: &[ExportEntry]) -> Vec<ShareTree> {
    // ou => path => target; None indicates a directory.
    let mut trees: BTreeMap<String, BTreeMap<String, Option<String>>> = BTreeMap::new();

    let tree_path = |ou: &str, parts: &[&str]| -> String {
        let mut all = vec![layout.org_unit_dir.as_str(), ou, "shared"];
        all.extend(parts);
        all.join("/")
    };

    let mut add_share = |ou: &str, path: &str| {
        let parts: Vec<&str> = path.split('/').collect();
        let tree = trees.entry(ou.to_string()).or_default();
        for i in 1..parts.len() {
            tree.insert(tree_path(ou, &parts[..i]), None);
        }

        // The target is relative so the forest stays portable: up past
        // `shared` and the ou dir, then down the logical path.
        let up_levels = parts.len() + 1;
        let mut target_parts = vec![".."; up_levels];
        target_parts.extend(&parts);
        tree.insert(tree_path(ou, &parts), Some(target_parts.join("/")));
    };

    // Shares to self.
    for share in shares {
        let ou = share.path.split('/').next().unwrap_or_default();
        add_share(ou, &share.path);
    }

    // Shares from others.
    for share in shares {
        for ou in share.acl.groups() {
            add_share(&ou, &share.path);
        }
    }

    trees
        .into_iter()
        .map(|(org_unit, files)| ShareTree {
            org_unit,
            files: files
                .into_iter()
                .map(|(path, target)| ShareFile { path, target })
                .collect(),
        })
        .collect()
}
