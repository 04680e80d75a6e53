//! Acceptance filter for `(service, org unit)` combinations.
//!
//! A filter is an ordered list of deciders.  Each decider returns accept,
//! reject, or pass; the first non-pass decision wins, and the filter
//! rejects by default when every decider passes.  Deciders are evaluated
//! exactly once per combination.

use std::fmt;

use regex::Regex;

use crate::config::{Config, FilterAction, FilterRule};
use crate::error::{ModelError, ModelResult};
use crate::org::{OrgUnit, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    Pass,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "ACCEPT"),
            Action::Reject => write!(f, "REJECT"),
            Action::Pass => write!(f, "PASS"),
        }
    }
}

/// A filter rule.  Returns the action together with a reason for logging.
pub trait Decide {
    fn decide(&self, service: &Service, org_unit: &OrgUnit) -> (Action, String);
}

/// An ordered-decider filter.  `accept` returns whether directories for the
/// combination should exist, and the deciding reason.
pub struct DecidersFilter {
    rules: Vec<Box<dyn Decide>>,
}

impl DecidersFilter {
    pub fn new(rules: Vec<Box<dyn Decide>>) -> Self {
        DecidersFilter { rules }
    }

    pub fn accept(&self, service: &Service, org_unit: &OrgUnit) -> (bool, String) {
        for rule in &self.rules {
            match rule.decide(service, org_unit) {
                (Action::Accept, reason) => return (true, reason),
                (Action::Reject, reason) => return (false, reason),
                (Action::Pass, _) => {}
            }
        }
        (false, "no rule accepted".to_string())
    }
}

/// Passes unless the org unit is a facility; accepts when the facility owns
/// the service and rejects otherwise.
pub struct SameFacilityDecider;

impl Decide for SameFacilityDecider {
    fn decide(&self, service: &Service, org_unit: &OrgUnit) -> (Action, String) {
        if !org_unit.is_facility {
            return (Action::Pass, format!("{} is not a facility", org_unit.name));
        }
        if org_unit.name.starts_with(&service.facility) {
            (
                Action::Accept,
                format!("facility {} owns service {}", org_unit.name, service.name),
            )
        } else {
            (
                Action::Reject,
                format!(
                    "facility {} does not own service {}",
                    org_unit.name, service.name
                ),
            )
        }
    }
}

/// Decides based on a pair of anchored regexes over the service and org-unit
/// names.  Passes when either regex does not match; otherwise returns the
/// configured action.
#[derive(Debug)]
pub struct RegexDecider {
    action: Action,
    service_pattern: String,
    org_unit_pattern: String,
    service_rgx: Regex,
    org_unit_rgx: Regex,
}

impl RegexDecider {
    pub fn new(rule: &FilterRule) -> ModelResult<Self> {
        let action = match rule.action {
            FilterAction::Accept => Action::Accept,
            FilterAction::Reject => Action::Reject,
        };
        let service_pattern = list_pattern(&rule.services);
        let org_unit_pattern = list_pattern(&rule.org_units);
        let service_rgx = compile_pattern(&service_pattern)?;
        let org_unit_rgx = compile_pattern(&org_unit_pattern)?;
        Ok(RegexDecider {
            action,
            service_pattern,
            org_unit_pattern,
            service_rgx,
            org_unit_rgx,
        })
    }
}

impl Decide for RegexDecider {
    fn decide(&self, service: &Service, org_unit: &OrgUnit) -> (Action, String) {
        if !self.service_rgx.is_match(&service.name) {
            return (Action::Pass, format!("service!~/{}/", self.service_pattern));
        }
        if !self.org_unit_rgx.is_match(&org_unit.name) {
            return (Action::Pass, format!("orgUnit!~/{}/", self.org_unit_pattern));
        }
        (
            self.action,
            format!(
                "service=~/{}/ and orgUnit=~/{}/",
                self.service_pattern, self.org_unit_pattern
            ),
        )
    }
}

/// Joins a name list into a single anchored alternation pattern.
fn list_pattern(list: &[String]) -> String {
    if list.len() == 1 {
        return anchored_pattern(&list[0]);
    }
    anchored_pattern(&format!("({})", list.join("|")))
}

fn anchored_pattern(p: &str) -> String {
    if p.is_empty() {
        return "^$".to_string();
    }
    let mut anchored = String::new();
    if !p.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(p);
    if !p.ends_with('$') {
        anchored.push('$');
    }
    anchored
}

fn compile_pattern(p: &str) -> ModelResult<Regex> {
    Regex::new(p).map_err(|e| ModelError::ConfigInvalid(format!("bad filter pattern: {e}")))
}

/// Builds the filter from the config rules, in order, with the
/// same-facility decider appended last.
pub fn compile_filter(cfg: &Config) -> ModelResult<DecidersFilter> {
    let mut rules: Vec<Box<dyn Decide>> = Vec::new();
    for rule in cfg.filter_rules()? {
        rules.push(Box::new(RegexDecider::new(&rule)?));
    }
    rules.push(Box::new(SameFacilityDecider));
    Ok(DecidersFilter::new(rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::Group;
    use crate::org::AccessPolicy;

    fn service(name: &str, facility: &str) -> Service {
        Service {
            name: name.to_string(),
            facility: facility.to_string(),
            access: AccessPolicy::PerService,
            super_group: None,
            service_group: Group {
                name: format!("sv_{name}"),
                gid: 300,
            },
            service_ops_group: Group {
                name: format!("sv_{facility}-ops"),
                gid: 400,
            },
        }
    }

    fn org_unit(name: &str, is_facility: bool) -> OrgUnit {
        OrgUnit {
            name: name.to_string(),
            subdirs: vec![],
            extra_dirs: vec![],
            is_facility,
            facility: if is_facility {
                name.strip_suffix("-facility").map(|s| s.to_string())
            } else {
                None
            },
            ou_group: Group {
                name: format!("og_{name}"),
                gid: 100,
            },
        }
    }

    fn regex_decider(
        services: &[&str],
        org_units: &[&str],
        action: FilterAction,
    ) -> RegexDecider {
        RegexDecider::new(&FilterRule {
            services: services.iter().map(|s| s.to_string()).collect(),
            org_units: org_units.iter().map(|s| s.to_string()).collect(),
            action,
        })
        .unwrap()
    }

    #[test]
    fn test_same_facility_decider() {
        let decider = SameFacilityDecider;

        let (action, _) = decider.decide(&service("micro", "foo"), &org_unit("foo-facility", true));
        assert_eq!(action, Action::Accept);

        let (action, _) = decider.decide(&service("micro", "foo"), &org_unit("bar-facility", true));
        assert_eq!(action, Action::Reject);

        let (action, reason) = decider.decide(&service("micro", "foo"), &org_unit("ag-bar", false));
        assert_eq!(action, Action::Pass);
        assert_eq!(reason, "ag-bar is not a facility");
    }

    #[test]
    fn test_regex_decider_passes_unless_both_match() {
        let decider = regex_decider(&["fake.*"], &[".*fake.*"], FilterAction::Accept);

        let (action, reason) =
            decider.decide(&service("fake-micro", "f"), &org_unit("ag-fake", false));
        assert_eq!(action, Action::Accept);
        assert_eq!(reason, "service=~/^fake.*$/ and orgUnit=~/^.*fake.*$/");

        let (action, reason) =
            decider.decide(&service("fake-micro", "f"), &org_unit("ag-foo", false));
        assert_eq!(action, Action::Pass);
        assert_eq!(reason, "orgUnit!~/^.*fake.*$/");
    }

    #[test]
    fn test_regex_decider_preserves_existing_anchors() {
        // One "^..." and one "...$" to demonstrate automatic anchoring.
        let decider = regex_decider(&["^.*"], &["ag-charly$"], FilterAction::Accept);
        let (action, reason) =
            decider.decide(&service("micro", "foo"), &org_unit("ag-charly", false));
        assert_eq!(action, Action::Accept);
        assert_eq!(reason, "service=~/^.*$/ and orgUnit=~/^ag-charly$/");
    }

    #[test]
    fn test_regex_decider_multi_lists() {
        let decider = regex_decider(
            &["em-micro", "lm-micro1", "lm-micro2"],
            &[".*"],
            FilterAction::Accept,
        );
        let (action, reason) =
            decider.decide(&service("lm-micro1", "lm"), &org_unit("ag-alice", false));
        assert_eq!(action, Action::Accept);
        assert_eq!(
            reason,
            "service=~/^(em-micro|lm-micro1|lm-micro2)$/ and orgUnit=~/^.*$/"
        );

        let (action, _) = decider.decide(&service("ms-micro", "ms"), &org_unit("ag-bob", false));
        assert_eq!(action, Action::Pass);
    }

    #[test]
    fn test_filter_first_decision_wins() {
        let rules: Vec<Box<dyn Decide>> = vec![
            Box::new(regex_decider(&["fake.*"], &["ag-.*"], FilterAction::Reject)),
            Box::new(regex_decider(&["fake.*"], &[".*"], FilterAction::Accept)),
            Box::new(SameFacilityDecider),
        ];
        let filter = DecidersFilter::new(rules);

        let (ok, _) = filter.accept(&service("fake-micro", "f"), &org_unit("ag-foo", false));
        assert!(!ok);

        let (ok, _) = filter.accept(&service("fake-micro", "f"), &org_unit("lab1", false));
        assert!(ok);
    }

    #[test]
    fn test_filter_rejects_by_default() {
        let filter = DecidersFilter::new(vec![Box::new(SameFacilityDecider)]);
        let (ok, reason) = filter.accept(&service("micro", "foo"), &org_unit("ag-bar", false));
        assert!(!ok);
        assert_eq!(reason, "no rule accepted");
    }

    #[test]
    fn test_filter_same_facility_shortcut() {
        let filter = DecidersFilter::new(vec![Box::new(SameFacilityDecider)]);

        let (ok, _) = filter.accept(&service("micro", "foo"), &org_unit("foo-facility", true));
        assert!(ok);

        let (ok, _) = filter.accept(&service("micro", "foo"), &org_unit("bar-facility", true));
        assert!(!ok);
    }

    #[test]
    fn test_compile_filter_orders_rules_before_same_facility() {
        let cfg = crate::config::Config::parse(
            r#"
rootDir = "/fs"
serviceDir = "srv"
orgUnitDir = "org"
orgUnitPrefix = "og"
servicePrefix = "sv"

[[filter]]
services = ["mic1"]
orgUnits = ["alice"]
action = "reject"
"#,
        )
        .unwrap();
        let filter = compile_filter(&cfg).unwrap();

        let (ok, _) = filter.accept(&service("mic1", "em"), &org_unit("alice", false));
        assert!(!ok);
        // The same-facility decider still accepts the owning facility.
        let (ok, _) = filter.accept(&service("mic1", "em"), &org_unit("em-facility", true));
        assert!(ok);
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = RegexDecider::new(&FilterRule {
            services: vec!["(".to_string()],
            org_units: vec![".*".to_string()],
            action: FilterAction::Accept,
        })
        .unwrap_err();
        assert!(err.to_string().contains("bad filter pattern"));
    }
}
