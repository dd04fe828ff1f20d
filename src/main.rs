//! # pg-dirsync
//!
//! Reconciles the access-control state of a PostgreSQL cluster against a
//! declared desired state: roles, role memberships, passwords and expiry,
//! databases with their extensions, and physical replication slots. Group
//! memberships can be derived from an LDAP directory by flattening a nested
//! group hierarchy into grant relationships.
//!
//! Every operation converges: the tool only issues the statements needed to
//! make observed state match declared state, so repeated runs against a
//! converged cluster are no-ops. Destructive operations (drops) only happen
//! under the per-category strict flags; otherwise they are logged and
//! skipped.
//!
//! Any stage error is fatal and the process exits non-zero; the next
//! scheduled run picks up where this one left off.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use pg_dirsync::cli::Cli;
use pg_dirsync::{Config, Reconciler};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config_path();
    let config = Config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pg_dirsync={}", config.general.loglevel).into()),
        )
        .init();

    if cli.check {
        info!(config = %path.display(), "configuration is valid");
        return Ok(());
    }

    info!(config = %path.display(), "starting reconciliation");
    let mut reconciler = Reconciler::new(config);
    reconciler.run().await.context("reconciliation failed")?;
    Ok(())
}
