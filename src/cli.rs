//! # CLI
//!
//! Command-line interface for the reconciler.
//!
//! The configuration file path resolves from the `--config` flag, the
//! `PG_DIRSYNC_CONFIG` environment variable, or the default path, in that
//! order.

use std::path::PathBuf;

use clap::Parser;

use crate::constants::{CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH};

/// Reconcile PostgreSQL roles, databases and replication slots against a
/// declared state, with group memberships derived from an LDAP directory.
#[derive(Debug, Parser)]
#[command(name = "pg-dirsync", version)]
pub struct Cli {
    /// Path to the desired-state configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Parse and validate the configuration, then exit without connecting
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    /// Resolve the configuration file path.
    pub fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config {
            return path.clone();
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}
