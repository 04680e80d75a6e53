//! Unix group table parsing and selection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// A Unix group row.  Groups are the source of identity for directory
/// ownership and ACL subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

/// Parses `getent group` output.  Rows are `name:password:gid:members`.  The
/// result may contain duplicates, even conflicting ones; see
/// [`dedup_groups`].
pub fn parse_group_table(text: &str) -> ModelResult<Vec<Group>> {
    let mut groups = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(ModelError::GroupsInconsistent(format!(
                "invalid group table line `{line}`"
            )));
        }
        let gid: u32 = fields[2].parse().map_err(|_| {
            ModelError::GroupsInconsistent(format!("invalid gid `{}`", fields[2]))
        })?;
        groups.push(Group {
            name: fields[0].to_string(),
            gid,
        });
    }
    Ok(groups)
}

/// Selects groups whose names begin with any of `prefixes` or equal one of
/// the names in `equals`.  Order is preserved.  Empty strings in `equals`
/// never match.
pub fn select_groups(groups: &[Group], prefixes: &[String], equals: &[String]) -> Vec<Group> {
    groups
        .iter()
        .filter(|g| {
            equals.iter().any(|e| !e.is_empty() && *e == g.name)
                || prefixes.iter().any(|p| g.name.starts_with(p.as_str()))
        })
        .cloned()
        .collect()
}

/// Removes exact duplicate groups, preserving first-seen order.  Two entries
/// that agree on name but disagree on gid, or agree on gid but disagree on
/// name, are a conflict.
pub fn dedup_groups(groups: &[Group]) -> ModelResult<Vec<Group>> {
    let mut by_name: HashMap<&str, &Group> = HashMap::new();
    let mut by_gid: HashMap<u32, &Group> = HashMap::new();
    let mut res = Vec::new();

    let conflict = |a: &Group, b: &Group| {
        ModelError::GroupsInconsistent(format!(
            "conflicting groups {}({}) and {}({})",
            a.gid, a.name, b.gid, b.name
        ))
    };

    for g in groups {
        if let Some(&seen) = by_name.get(g.name.as_str()) {
            if seen != g {
                return Err(conflict(seen, g));
            }
            continue;
        }
        if let Some(&seen) = by_gid.get(&g.gid) {
            if seen != g {
                return Err(conflict(seen, g));
            }
            continue;
        }
        by_name.insert(&g.name, g);
        by_gid.insert(g.gid, g);
        res.push(g.clone());
    }

    Ok(res)
}
