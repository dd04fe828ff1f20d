//! # Database Reconciler
//!
//! Idempotently converges databases: presence, ownership, declared
//! extensions, and the standing grants every managed database carries.
//!
//! On creation the owner role is granted into the fixed operations role and
//! a derived `<name>_readonly` role is granted into the fixed readonly
//! role; the read-only role is then given `SELECT` on every table in every
//! user schema it does not cover yet, over a connection scoped to the
//! database itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{DatabaseConfig, DesiredState, StrictPolicy};
use crate::constants::{OPERATIONS_ROLE, READONLY_ROLE, READONLY_SUFFIX};
use crate::error::Result;
use crate::pg::role::RoleReconciler;
use crate::pg::{identifier, SqlExecutor};

const DATABASE_EXISTS: &str = "SELECT datname FROM pg_database WHERE datname = $1";

const OWNER_MATCHES: &str = "SELECT datname FROM pg_database db \
     INNER JOIN pg_roles rol ON db.datdba = rol.oid \
     WHERE datname = $1 AND rolname = $2";

const UNGRANTED_SCHEMAS: &str = "SELECT DISTINCT schemaname FROM pg_tables \
     WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
     AND schemaname||'.'||tablename NOT IN (\
         SELECT table_schema||'.'||table_name \
         FROM information_schema.role_table_grants \
         WHERE grantee = $1 AND privilege_type = 'SELECT')";

/// Converges the declared databases and their extensions.
pub struct DatabaseReconciler {
    exec: Arc<dyn SqlExecutor>,
    strict: StrictPolicy,
    databases: BTreeMap<String, DatabaseConfig>,
}

impl std::fmt::Debug for DatabaseReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseReconciler")
            .field("databases", &self.databases.len())
            .finish()
    }
}

impl DatabaseReconciler {
    pub fn new(
        exec: Arc<dyn SqlExecutor>,
        strict: StrictPolicy,
        databases: BTreeMap<String, DatabaseConfig>,
    ) -> Self {
        Self {
            exec,
            strict,
            databases,
        }
    }

    /// Converge every declared database. Owner roles and the standing
    /// grants go through `roles` so its cache and conflict rules apply.
    pub async fn reconcile(&mut self, roles: &mut RoleReconciler) -> Result<()> {
        let names: Vec<String> = self.databases.keys().cloned().collect();
        for name in names {
            let config = self.databases[&name].clone();
            match config.state {
                DesiredState::Absent => self.drop_database(&name).await?,
                DesiredState::Present => self.create_database(&name, &config, roles).await?,
            }
        }
        Ok(())
    }

    /// Drop the database if it exists. Gated by the databases strict flag.
    async fn drop_database(&mut self, name: &str) -> Result<()> {
        if !self.strict.databases {
            info!(database = %name, "not dropping database (strict.databases is not enabled)");
            return Ok(());
        }
        if self.exec.exists(None, DATABASE_EXISTS, &[name]).await? {
            self.exec
                .execute(None, &format!("DROP DATABASE {}", identifier(name)), &[])
                .await?;
            info!(database = %name, "dropped database");
        }
        if let Some(config) = self.databases.get_mut(name) {
            config.state = DesiredState::Absent;
        }
        Ok(())
    }

    async fn create_database(
        &self,
        name: &str,
        config: &DatabaseConfig,
        roles: &mut RoleReconciler,
    ) -> Result<()> {
        let owner = config.owner.clone().unwrap_or_else(|| name.to_string());

        if !self.exec.exists(None, DATABASE_EXISTS, &[name]).await? {
            self.exec
                .execute(None, &format!("CREATE DATABASE {}", identifier(name)), &[])
                .await?;
            info!(database = %name, "created database");
        }

        if !self
            .exec
            .exists(None, OWNER_MATCHES, &[name, &owner])
            .await?
        {
            roles
                .reconcile(&owner, Default::default(), DesiredState::Present)
                .await?;
            self.exec
                .execute(
                    None,
                    &format!(
                        "ALTER DATABASE {} OWNER TO {}",
                        identifier(name),
                        identifier(&owner)
                    ),
                    &[],
                )
                .await?;
            info!(database = %name, owner = %owner, "altered database owner");
        }

        for (ext_name, ext) in &config.extensions {
            match ext.state {
                DesiredState::Present => {
                    super::extension::create(self.exec.as_ref(), name, ext_name, ext).await?;
                }
                DesiredState::Absent => {
                    super::extension::drop(self.exec.as_ref(), self.strict, name, ext_name)
                        .await?;
                }
            }
        }

        roles.grant(OPERATIONS_ROLE, &owner).await?;
        let readonly_role = format!("{name}{READONLY_SUFFIX}");
        roles.grant(READONLY_ROLE, &readonly_role).await?;

        self.set_readonly_grants(name, &readonly_role).await
    }

    /// Give the read-only role `SELECT` on all tables in every user schema
    /// not already covered, one grant per schema, on the database's own
    /// connection.
    async fn set_readonly_grants(&self, name: &str, readonly_role: &str) -> Result<()> {
        let schemas = self
            .exec
            .rows(Some(name), UNGRANTED_SCHEMAS, &[readonly_role])
            .await?;
        for row in schemas {
            let Some(schema) = row.first() else { continue };
            self.exec
                .execute(
                    Some(name),
                    &format!(
                        "GRANT SELECT ON ALL TABLES IN SCHEMA {} TO {}",
                        identifier(schema),
                        identifier(readonly_role)
                    ),
                    &[],
                )
                .await?;
            info!(database = %name, schema = %schema, role = %readonly_role, "granted read-only access");
        }
        Ok(())
    }
}
