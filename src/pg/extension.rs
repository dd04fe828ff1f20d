//! # Extension Convergence
//!
//! Creates, upgrades, and drops extensions inside a managed database.
//!
//! Creation is gated on the server's availability catalogs: an unknown
//! extension name, or a version the server cannot install, fails the run
//! with an error naming the offender before any statement is issued. All
//! statements run on a connection scoped to the owning database.

use tracing::info;

use crate::config::{ExtensionConfig, StrictPolicy};
use crate::error::{Result, SyncError};
use crate::pg::{identifier, literal, SqlExecutor};

const EXTENSION_AVAILABLE: &str = "SELECT name FROM pg_available_extensions WHERE name = $1";

const VERSION_AVAILABLE: &str =
    "SELECT name FROM pg_available_extension_versions WHERE name = $1 AND version = $2";

const EXTENSION_INSTALLED: &str = "SELECT extname FROM pg_extension WHERE extname = $1";

const INSTALLED_VERSION: &str = "SELECT extversion FROM pg_extension WHERE extname = $1";

const DATABASE_EXISTS: &str = "SELECT datname FROM pg_database WHERE datname = $1";

/// Create the extension if missing, or upgrade it when installed at a
/// version other than the requested one.
pub(crate) async fn create(
    exec: &dyn SqlExecutor,
    dbname: &str,
    name: &str,
    config: &ExtensionConfig,
) -> Result<()> {
    if !exec
        .exists(Some(dbname), EXTENSION_AVAILABLE, &[name])
        .await?
    {
        return Err(SyncError::ExtensionUnavailable(name.to_string()));
    }
    if let Some(version) = &config.version {
        if !exec
            .exists(Some(dbname), VERSION_AVAILABLE, &[name, version])
            .await?
        {
            return Err(SyncError::ExtensionVersionUnavailable {
                extension: name.to_string(),
                version: version.clone(),
            });
        }
    }

    if !exec
        .exists(Some(dbname), EXTENSION_INSTALLED, &[name])
        .await?
    {
        let mut create = format!("CREATE EXTENSION IF NOT EXISTS {}", identifier(name));
        if let Some(schema) = &config.schema {
            create.push_str(&format!(" SCHEMA {}", identifier(schema)));
        }
        if let Some(version) = &config.version {
            create.push_str(&format!(" VERSION {}", literal(version)));
        }
        exec.execute(Some(dbname), &create, &[]).await?;
        info!(database = %dbname, extension = %name, "created extension");
        return Ok(());
    }

    let Some(version) = &config.version else {
        return Ok(());
    };
    let installed = exec
        .one_field(Some(dbname), INSTALLED_VERSION, &[name])
        .await?;
    if installed.as_deref() != Some(version) {
        exec.execute(
            Some(dbname),
            &format!(
                "ALTER EXTENSION {} UPDATE TO {}",
                identifier(name),
                literal(version)
            ),
            &[],
        )
        .await?;
        info!(database = %dbname, extension = %name, version = %version, "updated extension");
    }
    Ok(())
}

/// Drop the extension if the owning database still exists. Gated by the
/// extensions strict flag.
pub(crate) async fn drop(
    exec: &dyn SqlExecutor,
    strict: StrictPolicy,
    dbname: &str,
    name: &str,
) -> Result<()> {
    if !strict.extensions {
        info!(database = %dbname, extension = %name, "not dropping extension (strict.extensions is not enabled)");
        return Ok(());
    }
    if !exec.exists(None, DATABASE_EXISTS, &[dbname]).await? {
        return Ok(());
    }
    exec.execute(
        Some(dbname),
        &format!("DROP EXTENSION IF EXISTS {}", identifier(name)),
        &[],
    )
    .await?;
    info!(database = %dbname, extension = %name, "dropped extension");
    Ok(())
}
