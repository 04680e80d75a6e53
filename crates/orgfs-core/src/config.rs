//! Declarative filesystem configuration.
//!
//! The configuration describes the toplevel layout (`rootDir`, `serviceDir`,
//! `orgUnitDir`), the group-name conventions (`orgUnitPrefix`,
//! `servicePrefix`, `opsSuffix`, `facilitySuffix`, `superGroup`), the
//! facilities and org units, the acceptance filter, explicit symlinks, and
//! the optional sharing block.  Use [`Config::from_file`] to load a TOML
//! file, or [`Config::parse`] for a string.  Both run [`Config::validate`].

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

fn default_ops_suffix() -> String {
    "ops".to_string()
}

fn default_facility_suffix() -> String {
    "facility".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Absolute path of the filesystem root.
    pub root_dir: PathBuf,
    /// Name of the service subtree below the root.
    pub service_dir: String,
    /// Name of the org-unit subtree below the root.
    pub org_unit_dir: String,
    /// Unix group prefix for org units, e.g. `og` for `og_alice`.
    pub org_unit_prefix: String,
    /// Unix group prefix for services, e.g. `sv` for `sv_mic1`.
    pub service_prefix: String,
    /// Suffix of facility ops groups, e.g. `ops` for `sv_em-ops`.
    #[serde(default = "default_ops_suffix")]
    pub ops_suffix: String,
    /// Suffix of facility org units, e.g. `facility` for `em-facility`.
    #[serde(default = "default_facility_suffix")]
    pub facility_suffix: String,
    /// Group containing the members of all org units.  May be empty for
    /// backward compatibility; required for `allOrgUnits` services.
    #[serde(default)]
    pub super_group: String,
    #[serde(default)]
    pub facilities: Vec<FacilityConfig>,
    #[serde(default)]
    pub org_units: Vec<OrgUnitConfig>,
    #[serde(default)]
    pub filter: Vec<FilterRuleConfig>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<SharingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FacilityConfig {
    pub name: String,
    #[serde(default)]
    pub services: Vec<String>,
    /// `perService`, `allOrgUnits`, or empty (defaults to `perService`).
    #[serde(default)]
    pub access: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrgUnitConfig {
    pub name: String,
    #[serde(default)]
    pub subdirs: Vec<SubdirConfig>,
    /// Kept for backward compatibility; prefer `subdirs`.  Entries are
    /// treated as subdirs with policy `group`.
    #[serde(default)]
    pub extra_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubdirConfig {
    pub name: String,
    pub policy: DirPolicy,
}

/// Access policy of an org-unit subdir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirPolicy {
    /// The whole org unit reads and writes, recursively by default.
    Group,
    /// The org unit writes at the toplevel, but new children default to
    /// read-only for the group; only explicit owners grant more.
    Owner,
    /// The org unit reads; only managers (via separate means) write.
    Manager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterRuleConfig {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub org_unit: Option<String>,
    #[serde(default)]
    pub org_units: Vec<String>,
    pub action: String,
}

/// A validated filter rule with the singular and list forms folded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub services: Vec<String>,
    pub org_units: Vec<String>,
    pub action: FilterAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Reject,
}

impl FilterRuleConfig {
    /// Validates the rule and folds `service`/`services` and
    /// `orgUnit`/`orgUnits` into lists.
    pub fn compile(&self) -> ModelResult<FilterRule> {
        let action = match self.action.as_str() {
            "accept" => FilterAction::Accept,
            "reject" => FilterAction::Reject,
            other => {
                return Err(ModelError::ConfigInvalid(format!(
                    "invalid filter action `{other}`"
                )))
            }
        };

        let services = match (&self.service, self.services.is_empty()) {
            (Some(_), false) => {
                return Err(ModelError::ConfigInvalid(
                    "filter rule: use either `service` or `services`".to_string(),
                ))
            }
            (Some(s), true) => vec![s.clone()],
            (None, false) => self.services.clone(),
            (None, true) => {
                return Err(ModelError::ConfigInvalid(
                    "filter rule: no service defined".to_string(),
                ))
            }
        };

        let org_units = match (&self.org_unit, self.org_units.is_empty()) {
            (Some(_), false) => {
                return Err(ModelError::ConfigInvalid(
                    "filter rule: use either `orgUnit` or `orgUnits`".to_string(),
                ))
            }
            (Some(o), true) => vec![o.clone()],
            (None, false) => self.org_units.clone(),
            (None, true) => {
                return Err(ModelError::ConfigInvalid(
                    "filter rule: no orgUnit defined".to_string(),
                ))
            }
        };

        Ok(FilterRule {
            services,
            org_units,
            action,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymlinkConfig {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SharingConfig {
    #[serde(default)]
    pub naming_policies: Vec<NamingPolicyConfig>,
    #[serde(default)]
    pub exports: Vec<ExportConfig>,
    #[serde(default)]
    pub imports: Vec<ImportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamingPolicyConfig {
    /// `allow` or `deny`.
    pub action: String,
    #[serde(rename = "match")]
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    pub path: String,
    #[serde(default)]
    pub acl: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
    /// `accept` or `reject`.
    pub action: String,
    pub group: String,
    #[serde(rename = "match")]
    pub pattern: String,
}

impl Config {
    /// Loads and validates a TOML config file.
    pub fn from_file(path: &Path) -> ModelResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ModelError::ConfigInvalid(format!("failed to read `{}`: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates a TOML config string.
    pub fn parse(contents: &str) -> ModelResult<Self> {
        let cfg: Config = toml::from_str(contents)
            .map_err(|e| ModelError::ConfigInvalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the semantic rules that serde cannot express.
    pub fn validate(&self) -> ModelResult<()> {
        if !self.root_dir.is_absolute() {
            return Err(ModelError::ConfigInvalid(
                "`rootDir` must be absolute".to_string(),
            ));
        }
        for (key, value) in [
            ("serviceDir", &self.service_dir),
            ("orgUnitDir", &self.org_unit_dir),
            ("orgUnitPrefix", &self.org_unit_prefix),
            ("servicePrefix", &self.service_prefix),
            ("opsSuffix", &self.ops_suffix),
            ("facilitySuffix", &self.facility_suffix),
        ] {
            if value.is_empty() {
                return Err(ModelError::ConfigInvalid(format!("missing `{key}`")));
            }
        }

        for f in &self.facilities {
            if f.access != "perService" && f.access != "allOrgUnits" && !f.access.is_empty() {
                return Err(ModelError::ConfigInvalid(format!(
                    "invalid access `{}` in facility `{}`",
                    f.access, f.name
                )));
            }
        }

        for rule in &self.filter {
            rule.compile()?;
        }

        for link in &self.symlinks {
            if link.path.is_empty() {
                return Err(ModelError::ConfigInvalid(
                    "empty `path` in symlink".to_string(),
                ));
            }
            if link.target.is_empty() {
                return Err(ModelError::ConfigInvalid(
                    "empty `target` in symlink".to_string(),
                ));
            }
        }

        if let Some(sharing) = &self.sharing {
            sharing.validate()?;
        }

        Ok(())
    }

    /// Returns the validated filter rules.
    pub fn filter_rules(&self) -> ModelResult<Vec<FilterRule>> {
        self.filter.iter().map(|r| r.compile()).collect()
    }
}

impl SharingConfig {
    fn validate(&self) -> ModelResult<()> {
        let ace = Regex::new(r"^group:[a-z0-9-]+:[r-][w-][x-]$").expect("static regex");

        for pol in &self.naming_policies {
            if pol.action != "allow" && pol.action != "deny" {
                return Err(ModelError::ConfigInvalid(format!(
                    "invalid naming policy action `{}`",
                    pol.action
                )));
            }
        }

        for exp in &self.exports {
            if exp.path.is_empty() {
                return Err(ModelError::ConfigInvalid(
                    "empty `path` in sharing export".to_string(),
                ));
            }
            for entry in &exp.acl {
                if !ace.is_match(entry) {
                    return Err(ModelError::ConfigInvalid(format!(
                        "malformed ACL entry `{entry}` in export `{}`",
                        exp.path
                    )));
                }
            }
        }

        for imp in &self.imports {
            if imp.action != "accept" && imp.action != "reject" {
                return Err(ModelError::ConfigInvalid(format!(
                    "invalid import action `{}`",
                    imp.action
                )));
            }
        }

        Ok(())
    }
}
