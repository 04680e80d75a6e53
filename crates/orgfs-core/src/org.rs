//! Organization builder.
//!
//! Combines the Unix groups with the configuration to derive the
//! organization: org units, facilities, and services, each with its
//! resolved owning, ops, and super groups.  Use [`Organization::build`].

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::config::{Config, DirPolicy};
use crate::error::{ModelError, ModelResult};
use crate::groups::Group;

/// Access policy of a service directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessPolicy {
    /// Access is granted per `(service, org unit)` directory.
    #[serde(rename = "perService")]
    PerService,
    /// The whole super group reads the service toplevel.
    #[serde(rename = "allOrgUnits")]
    AllOrgUnits,
}

impl AccessPolicy {
    /// Parses the config spelling.  The empty string defaults to
    /// `PerService`.
    pub fn from_config(name: &str) -> ModelResult<Self> {
        match name {
            "perService" | "" => Ok(AccessPolicy::PerService),
            "allOrgUnits" => Ok(AccessPolicy::AllOrgUnits),
            other => Err(ModelError::ConfigInvalid(format!(
                "invalid access name `{other}`"
            ))),
        }
    }
}

/// A directory below an org unit with its access policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirWithPolicy {
    pub name: String,
    pub policy: DirPolicy,
}

/// An organizational unit, such as a lab or a collaboration project.
///
/// `name` is the group name without the org-unit prefix.  If the org unit
/// is a facility, `facility` carries the name without the facility suffix;
/// example: `name = "em-facility"`, `facility = Some("em")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUnit {
    pub name: String,
    pub subdirs: Vec<DirWithPolicy>,
    pub extra_dirs: Vec<String>,
    pub is_facility: bool,
    pub facility: Option<String>,
    pub ou_group: Group,
}

/// A facility service, such as a microscope.  Every service is owned by a
/// single facility and carries the facility's access policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub facility: String,
    pub access: AccessPolicy,
    pub super_group: Option<Group>,
    pub service_group: Group,
    pub service_ops_group: Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Facility {
    pub name: String,
}

/// The derived organization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub org_units: Vec<OrgUnit>,
    pub facilities: Vec<Facility>,
    pub services: Vec<Service>,
}

/// Group lookup keyed by the configured name conventions.
struct GroupMap<'a> {
    by_name: HashMap<&'a str, &'a Group>,
    org_unit_prefix: &'a str,
    service_prefix: &'a str,
    ops_suffix: &'a str,
}

impl<'a> GroupMap<'a> {
    fn new(groups: &'a [Group], cfg: &'a Config) -> Self {
        GroupMap {
            by_name: groups.iter().map(|g| (g.name.as_str(), g)).collect(),
            org_unit_prefix: &cfg.org_unit_prefix,
            service_prefix: &cfg.service_prefix,
            ops_suffix: &cfg.ops_suffix,
        }
    }

    fn get(&self, name: &str) -> Option<&'a Group> {
        self.by_name.get(name).copied()
    }

    fn org_unit_group(&self, ou: &str) -> Option<&'a Group> {
        self.get(&format!("{}_{}", self.org_unit_prefix, ou))
    }

    fn service_group(&self, service: &str) -> Option<&'a Group> {
        self.get(&format!("{}_{}", self.service_prefix, service))
    }

    fn service_ops_group(&self, facility: &str) -> Option<&'a Group> {
        self.get(&format!(
            "{}_{}-{}",
            self.service_prefix, facility, self.ops_suffix
        ))
    }
}

/// Name sets parsed from the group table.
struct Names {
    org_units: Vec<String>,
    services: Vec<String>,
    facilities: Vec<String>,
}

impl Organization {
    /// Derives the organization from the selected, deduplicated groups and
    /// the configuration.
    ///
    /// Returns the organization and a list of messages about service groups
    /// whose facility is not declared in the config.  Whether unconfigured
    /// services are fatal is the caller's decision.
    pub fn build(groups: &[Group], cfg: &Config) -> ModelResult<(Organization, Vec<String>)> {
        let names = parse_group_names(groups, cfg);
        let gm = GroupMap::new(groups, cfg);

        let org_units = parse_org_units(&names, cfg, &gm)?;
        let (services, unconfigured) = parse_services(&names, cfg, &gm)?;
        let facilities = names
            .facilities
            .iter()
            .map(|f| Facility { name: f.clone() })
            .collect();

        Ok((
            Organization {
                org_units,
                facilities,
                services,
            },
            unconfigured,
        ))
    }
}

fn parse_group_names(groups: &[Group], cfg: &Config) -> Names {
    let ou_prefix = format!("{}_", cfg.org_unit_prefix);
    let srv_prefix = format!("{}_", cfg.service_prefix);
    let ops_suffix = format!("-{}", cfg.ops_suffix);
    let facility_suffix = format!("-{}", cfg.facility_suffix);

    let mut names = Names {
        org_units: Vec::new(),
        services: Vec::new(),
        facilities: Vec::new(),
    };

    for g in groups {
        if let Some(rest) = g.name.strip_prefix(&ou_prefix) {
            names.org_units.push(rest.to_string());
            if let Some(fac) = rest.strip_suffix(&facility_suffix) {
                names.facilities.push(fac.to_string());
            }
        }
        if let Some(rest) = g.name.strip_prefix(&srv_prefix) {
            if !rest.ends_with(&ops_suffix) {
                names.services.push(rest.to_string());
            }
        }
    }

    names
}

fn parse_org_units(names: &Names, cfg: &Config, gm: &GroupMap) -> ModelResult<Vec<OrgUnit>> {
    // Fold `extraDirs` into `subdirs` with policy `group` for backward
    // compatibility; the returned `subdirs` and `extra_dirs` both carry the
    // complete list.
    let mut subdirs_by_ou: HashMap<&str, Vec<DirWithPolicy>> = HashMap::new();
    let mut extra_dirs_by_ou: HashMap<&str, Vec<String>> = HashMap::new();
    for cou in &cfg.org_units {
        let mut used: HashSet<&str> = HashSet::new();
        let mut subdirs = Vec::new();
        let mut extra_dirs = Vec::new();

        for d in &cou.subdirs {
            if !used.insert(&d.name) {
                return Err(ModelError::ConfigInvalid(format!(
                    "duplicate ou `{}` dir `{}`",
                    cou.name, d.name
                )));
            }
            subdirs.push(DirWithPolicy {
                name: d.name.clone(),
                policy: d.policy,
            });
            extra_dirs.push(d.name.clone());
        }

        for xd in &cou.extra_dirs {
            if !used.insert(xd) {
                return Err(ModelError::ConfigInvalid(format!(
                    "duplicate ou `{}` dir `{}`",
                    cou.name, xd
                )));
            }
            subdirs.push(DirWithPolicy {
                name: xd.clone(),
                policy: DirPolicy::Group,
            });
            extra_dirs.push(xd.clone());
        }

        subdirs_by_ou.insert(&cou.name, subdirs);
        extra_dirs_by_ou.insert(&cou.name, extra_dirs);
    }

    let facility_suffix = format!("-{}", cfg.facility_suffix);

    let mut ous = Vec::new();
    for name in &names.org_units {
        let facility = name
            .strip_suffix(&facility_suffix)
            .map(|fac| fac.to_string());
        let ou_group = gm.org_unit_group(name).ok_or_else(|| {
            ModelError::GroupsInconsistent(format!("missing group for org unit `{name}`"))
        })?;
        ous.push(OrgUnit {
            name: name.clone(),
            subdirs: subdirs_by_ou.get(name.as_str()).cloned().unwrap_or_default(),
            extra_dirs: extra_dirs_by_ou
                .get(name.as_str())
                .cloned()
                .unwrap_or_default(),
            is_facility: facility.is_some(),
            facility,
            ou_group: ou_group.clone(),
        });
    }
    Ok(ous)
}

fn parse_services(
    names: &Names,
    cfg: &Config,
    gm: &GroupMap,
) -> ModelResult<(Vec<Service>, Vec<String>)> {
    let have_facility: HashSet<&str> = names.facilities.iter().map(|f| f.as_str()).collect();
    for f in &cfg.facilities {
        if !have_facility.contains(f.name.as_str()) {
            return Err(ModelError::GroupsInconsistent(format!(
                "missing group for facility `{}`",
                f.name
            )));
        }
    }

    let mut facility_by_service: HashMap<&str, &crate::config::FacilityConfig> = HashMap::new();
    for f in &cfg.facilities {
        for s in &f.services {
            facility_by_service.insert(s.as_str(), f);
        }
    }

    let mut unconfigured = Vec::new();
    let mut services = Vec::new();
    for name in &names.services {
        let Some(fac) = facility_by_service.get(name.as_str()) else {
            unconfigured.push(format!("Missing facility for service `{name}`."));
            continue;
        };

        let access = AccessPolicy::from_config(&fac.access).map_err(|e| {
            ModelError::ConfigInvalid(format!("{e} in service `{name}`"))
        })?;

        if access == AccessPolicy::AllOrgUnits && cfg.super_group.is_empty() {
            return Err(ModelError::ConfigInvalid(format!(
                "service `{name}`: can't apply `allOrgUnits` without `superGroup`"
            )));
        }

        let service_group = gm.service_group(name).ok_or_else(|| {
            ModelError::GroupsInconsistent(format!("missing group for service `{name}`"))
        })?;

        let super_group = if cfg.super_group.is_empty() {
            None
        } else {
            Some(
                gm.get(&cfg.super_group)
                    .ok_or_else(|| {
                        ModelError::GroupsInconsistent(format!(
                            "missing group for superGroup `{}`",
                            cfg.super_group
                        ))
                    })?
                    .clone(),
            )
        };

        let service_ops_group = gm.service_ops_group(&fac.name).ok_or_else(|| {
            ModelError::GroupsInconsistent(format!("missing ops group for service `{name}`"))
        })?;

        services.push(Service {
            name: name.clone(),
            facility: fac.name.clone(),
            access,
            super_group,
            service_group: service_group.clone(),
            service_ops_group: service_ops_group.clone(),
        });
    }

    Ok((services, unconfigured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

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

    fn basic_config(access: &str) -> Config {
        Config::parse(&format!(
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
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_build_basic_org() {
        let cfg = basic_config("perService");
        let (org, unconfigured) = Organization::build(&basic_groups(), &cfg).unwrap();
        assert!(unconfigured.is_empty());

        assert_eq!(org.org_units.len(), 2);
        let alice = &org.org_units[0];
        assert_eq!(alice.name, "alice");
        assert!(!alice.is_facility);
        assert_eq!(alice.ou_group, group("og_alice", 100));
        let em = &org.org_units[1];
        assert_eq!(em.name, "em-facility");
        assert!(em.is_facility);
        assert_eq!(em.facility.as_deref(), Some("em"));

        assert_eq!(org.facilities, vec![Facility { name: "em".to_string() }]);

        assert_eq!(org.services.len(), 1);
        let mic1 = &org.services[0];
        assert_eq!(mic1.name, "mic1");
        assert_eq!(mic1.facility, "em");
        assert_eq!(mic1.access, AccessPolicy::PerService);
        assert_eq!(mic1.service_group, group("sv_mic1", 300));
        assert_eq!(mic1.service_ops_group, group("sv_em-ops", 400));
        assert_eq!(mic1.super_group, Some(group("all", 10)));
    }

    #[test]
    fn test_ops_groups_are_not_services() {
        let cfg = basic_config("perService");
        let (org, _) = Organization::build(&basic_groups(), &cfg).unwrap();
        assert!(org.services.iter().all(|s| s.name != "em-ops"));
    }

    #[test]
    fn test_unconfigured_service_is_reported_not_fatal() {
        let cfg = basic_config("perService");
        let mut groups = basic_groups();
        groups.push(group("sv_orphan", 500));
        let (org, unconfigured) = Organization::build(&groups, &cfg).unwrap();
        assert_eq!(org.services.len(), 1);
        assert_eq!(
            unconfigured,
            vec!["Missing facility for service `orphan`.".to_string()]
        );
    }

    #[test]
    fn test_missing_facility_group_is_fatal() {
        let cfg = basic_config("perService");
        let groups = vec![
            group("og_alice", 100),
            group("sv_mic1", 300),
            group("sv_em-ops", 400),
            group("all", 10),
        ];
        let err = Organization::build(&groups, &cfg).unwrap_err();
        assert!(err.to_string().contains("missing group for facility `em`"));
    }

    #[test]
    fn test_missing_ops_group_is_fatal() {
        let cfg = basic_config("perService");
        let groups = vec![
            group("og_alice", 100),
            group("og_em-facility", 200),
            group("sv_mic1", 300),
            group("all", 10),
        ];
        let err = Organization::build(&groups, &cfg).unwrap_err();
        assert!(err.to_string().contains("missing ops group"));
    }

    #[test]
    fn test_all_org_units_requires_super_group() {
        let mut cfg = basic_config("allOrgUnits");
        cfg.super_group = String::new();
        let err = Organization::build(&basic_groups(), &cfg).unwrap_err();
        assert!(err.to_string().contains("without `superGroup`"));
    }

    #[test]
    fn test_missing_super_group_entry_is_fatal() {
        let cfg = basic_config("perService");
        let groups = vec![
            group("og_alice", 100),
            group("og_em-facility", 200),
            group("sv_mic1", 300),
            group("sv_em-ops", 400),
        ];
        let err = Organization::build(&groups, &cfg).unwrap_err();
        assert!(err.to_string().contains("superGroup"));
    }

    #[test]
    fn test_empty_super_group_is_none() {
        let mut cfg = basic_config("perService");
        cfg.super_group = String::new();
        let (org, _) = Organization::build(&basic_groups(), &cfg).unwrap();
        assert_eq!(org.services[0].super_group, None);
    }

    #[test]
    fn test_extra_dirs_fold_into_subdirs() {
        let cfg = Config::parse(
            r#"
rootDir = "/fs"
serviceDir = "srv"
orgUnitDir = "org"
orgUnitPrefix = "og"
servicePrefix = "sv"

[[orgUnits]]
name = "alice"
subdirs = [{ name = "projects", policy = "owner" }]
extraDirs = ["tmp"]
"#,
        )
        .unwrap();
        let groups = vec![group("og_alice", 100)];
        let (org, _) = Organization::build(&groups, &cfg).unwrap();
        let alice = &org.org_units[0];
        assert_eq!(
            alice.subdirs,
            vec![
                DirWithPolicy {
                    name: "projects".to_string(),
                    policy: DirPolicy::Owner,
                },
                DirWithPolicy {
                    name: "tmp".to_string(),
                    policy: DirPolicy::Group,
                },
            ]
        );
        assert_eq!(alice.extra_dirs, vec!["projects", "tmp"]);
    }

    #[test]
    fn test_duplicate_subdir_rejected() {
        let cfg = Config::parse(
            r#"
rootDir = "/fs"
serviceDir = "srv"
orgUnitDir = "org"
orgUnitPrefix = "og"
servicePrefix = "sv"

[[orgUnits]]
name = "alice"
subdirs = [{ name = "projects", policy = "group" }]
extraDirs = ["projects"]
"#,
        )
        .unwrap();
        let groups = vec![group("og_alice", 100)];
        let err = Organization::build(&groups, &cfg).unwrap_err();
        assert!(err.to_string().contains("duplicate ou `alice` dir `projects`"));
    }

    #[test]
    fn test_organization_serializes_for_describe() {
        let cfg = basic_config("perService");
        let (org, _) = Organization::build(&basic_groups(), &cfg).unwrap();
        let value = serde_json::to_value(&org).unwrap();
        assert_eq!(value["services"][0]["access"], "perService");
        assert_eq!(value["services"][0]["serviceGroup"]["gid"], 300);
        assert_eq!(value["orgUnits"][1]["isFacility"], true);
    }

    #[test]
    fn test_access_policy_from_config() {
        assert_eq!(
            AccessPolicy::from_config("").unwrap(),
            AccessPolicy::PerService
        );
        assert_eq!(
            AccessPolicy::from_config("perService").unwrap(),
            AccessPolicy::PerService
        );
        assert_eq!(
            AccessPolicy::from_config("allOrgUnits").unwrap(),
            AccessPolicy::AllOrgUnits
        );
        assert!(AccessPolicy::from_config("other").is_err());
    }
}
