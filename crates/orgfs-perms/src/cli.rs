//! Command-line interface.
//!
//! `orgfs-perms` maintains the toplevel filesystem tree for an organization
//! with service facilities and research units: it creates directories and
//! adjusts ownership, permissions, and POSIX ACLs.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orgfs_core::filter::{compile_filter, DecidersFilter};
use orgfs_core::groups::{dedup_groups, select_groups, Group};
use orgfs_core::{compile_sharing, plan_tree, Config, Organization};
use tracing::{error, info};

use crate::apply::{ensure_permissions, ApplyOptions};
use crate::check::check_permissions;
use crate::driver;
use crate::sharing_apply::{ensure_real_shares, ensure_share_trees, ensure_traversal};

#[derive(Parser)]
#[command(name = "orgfs-perms")]
#[command(about = "Maintains the orgfs toplevel tree: directories, permissions, POSIX ACLs", long_about = None)]
pub struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = "/etc/orgfs.toml")]
    pub config: PathBuf,

    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print resolved state.
    Describe {
        #[command(subcommand)]
        what: DescribeWhat,
    },
    /// Create directories and apply permissions.
    Apply {
        /// Propagate permissions to sub-directories.
        #[arg(long)]
        recursive: bool,
        /// Also apply the sharing configuration.
        #[arg(long)]
        sharing: bool,
    },
    /// Verify directories and permissions; nonzero exit on failure.
    Check,
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum DescribeWhat {
    /// The active config, with defaults inserted.
    Config,
    /// The Unix groups, filtered for the active config.
    Groups {
        /// Fail when there are unconfigured service groups.
        #[arg(long)]
        strict: bool,
    },
    /// The org units, facilities, and services derived from config and
    /// groups.
    Org {
        #[arg(long)]
        strict: bool,
    },
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Version => {
                println!("orgfs-perms-{}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            Command::Describe { ref what } => self.describe(what),
            Command::Apply { recursive, sharing } => self.apply(recursive, sharing),
            Command::Check => self.check(),
        }
    }

    fn load_config(&self) -> Result<Config> {
        Config::from_file(&self.config).context("failed to load config")
    }

    fn describe(&self, what: &DescribeWhat) -> Result<()> {
        let cfg = self.load_config()?;
        match what {
            DescribeWhat::Config => {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            }
            DescribeWhat::Groups { strict } => {
                let (groups, _, unconfigured) = load_groups(&cfg)?;
                fail_on_unconfigured(&unconfigured, *strict)?;
                println!("{}", serde_json::to_string_pretty(&groups)?);
            }
            DescribeWhat::Org { strict } => {
                let (_, org, unconfigured) = load_groups(&cfg)?;
                fail_on_unconfigured(&unconfigured, *strict)?;
                println!("{}", serde_json::to_string_pretty(&org)?);
            }
        }
        Ok(())
    }

    fn apply(&self, recursive: bool, sharing: bool) -> Result<()> {
        let cfg = self.load_config()?;
        let (_, org, unconfigured) = load_groups(&cfg)?;
        fail_on_unconfigured(&unconfigured, true)?;
        let filter = build_filter(&cfg)?;

        let plan = plan_tree(&cfg, &org, &filter);
        ensure_permissions(&cfg, &plan, ApplyOptions { recursive })
            .context("failed to apply permissions")?;

        if sharing {
            if cfg.sharing.is_none() {
                bail!("missing sharing config");
            }
            let compiled = compile_sharing(&cfg).context("failed to compile sharing")?;
            ensure_real_shares(&compiled.layout, &compiled.real_shares)
                .context("failed to apply sharing")?;
            ensure_traversal(&compiled.layout, &compiled.traversal)
                .context("failed to apply sharing traversal")?;
            ensure_share_trees(&compiled.layout, &compiled.share_trees)
                .context("failed to apply sharing trees")?;
        }

        Ok(())
    }

    fn check(&self) -> Result<()> {
        let cfg = self.load_config()?;
        let (_, org, unconfigured) = load_groups(&cfg)?;
        fail_on_unconfigured(&unconfigured, true)?;
        let filter = build_filter(&cfg)?;

        let report = check_permissions(&cfg, &org, &filter).context("check error")?;
        if !report.ok() {
            bail!("checks failed: {:?}", report.failures);
        }
        info!("check ok");
        Ok(())
    }
}

/// Loads the Unix groups, selects and deduplicates the relevant ones, and
/// derives the organization.
fn load_groups(cfg: &Config) -> Result<(Vec<Group>, Organization, Vec<String>)> {
    let all = driver::read_group_table().context("failed to get groups")?;

    let prefixes = vec![
        format!("{}_", cfg.org_unit_prefix),
        format!("{}_", cfg.service_prefix),
    ];
    let equals = vec![cfg.super_group.clone()];
    let mut groups = dedup_groups(&select_groups(&all, &prefixes, &equals))
        .context("failed to select groups")?;
    groups.sort_by(|a, b| a.name.cmp(&b.name));

    let (org, unconfigured) =
        Organization::build(&groups, cfg).context("failed to parse groups")?;
    Ok((groups, org, unconfigured))
}

fn build_filter(cfg: &Config) -> Result<DecidersFilter> {
    compile_filter(cfg).context("invalid filter config")
}

fn fail_on_unconfigured(unconfigured: &[String], fatal: bool) -> Result<()> {
    if !fatal || unconfigured.is_empty() {
        return Ok(());
    }
    for msg in unconfigured {
        error!("{msg}");
    }
    bail!("there are unconfigured services")
}
