//! # Role Reconciler
//!
//! Idempotently converges PostgreSQL roles: presence, attribute options,
//! memberships, passwords, and expiry.
//!
//! Roles reconciled during a run are cached by name; a second declaration
//! merges its options into the first instead of repeating server calls, and
//! redeclaring a cached role with a different desired state is a conflict
//! while the users strict flag is active. Every server-side change is
//! guarded by a catalog check, so a converged cluster produces zero
//! statements.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{DesiredState, StrictPolicy};
use crate::constants::MD5_PASSWORD_LEN;
use crate::error::{Result, SyncError};
use crate::pg::{identifier, literal, SqlExecutor};

const ROLE_EXISTS: &str = "SELECT rolname FROM pg_roles WHERE rolname = $1";

const ROLE_EXISTS_NOT_SELF: &str =
    "SELECT rolname FROM pg_roles WHERE rolname = $1 AND rolname != CURRENT_USER";

const DATABASE_OWNERS: &str = "SELECT db.datname, o.rolname FROM pg_database db \
     INNER JOIN pg_roles o ON db.datdba = o.oid WHERE db.datname != 'template0'";

const GRANT_EXISTS: &str = "SELECT granted.rolname FROM pg_auth_members auth \
     INNER JOIN pg_roles granted ON auth.roleid = granted.oid \
     INNER JOIN pg_roles grantee ON auth.member = grantee.oid \
     WHERE granted.rolname = $1 AND grantee.rolname = $2";

const GRANT_EXISTS_NOT_SELF: &str = "SELECT granted.rolname FROM pg_auth_members auth \
     INNER JOIN pg_roles granted ON auth.roleid = granted.oid \
     INNER JOIN pg_roles grantee ON auth.member = grantee.oid \
     WHERE granted.rolname = $1 AND grantee.rolname = $2 \
     AND grantee.rolname != CURRENT_USER";

const PASSWORD_DIFFERS: &str = "SELECT usename FROM pg_shadow WHERE usename = $1 \
     AND COALESCE(passwd, '') != $2";

const PASSWORD_SET_NOT_SELF: &str = "SELECT usename FROM pg_shadow WHERE usename = $1 \
     AND passwd IS NOT NULL AND usename != CURRENT_USER";

const EXPIRY_DIFFERS: &str = "SELECT usename FROM pg_user WHERE usename = $1 \
     AND COALESCE(valuntil, 'infinity') != $2::timestamptz";

const EXPIRY_FINITE: &str = "SELECT usename FROM pg_user WHERE usename = $1 \
     AND valuntil IS NOT NULL AND valuntil != 'infinity'";

/// A role attribute option.
///
/// The supported set is closed: each variant knows its `ALTER ROLE` clause,
/// the `pg_roles` column it reflects, and the predicate testing whether it
/// is already in effect. Unknown names never get past [`RoleOption::parse_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoleOption {
    Superuser,
    NoSuperuser,
    CreateDb,
    NoCreateDb,
    CreateRole,
    NoCreateRole,
    Inherit,
    NoInherit,
    Login,
    NoLogin,
    Replication,
    NoReplication,
}

impl RoleOption {
    pub fn all() -> &'static [RoleOption] {
        use RoleOption::*;
        &[
            Superuser,
            NoSuperuser,
            CreateDb,
            NoCreateDb,
            CreateRole,
            NoCreateRole,
            Inherit,
            NoInherit,
            Login,
            NoLogin,
            Replication,
            NoReplication,
        ]
    }

    /// Parse one option name, case-insensitively. `CREATEUSER` and
    /// `NOCREATEUSER` are accepted as aliases of the role-creation pair.
    pub fn parse(name: &str) -> Option<RoleOption> {
        match name.to_uppercase().as_str() {
            "SUPERUSER" => Some(RoleOption::Superuser),
            "NOSUPERUSER" => Some(RoleOption::NoSuperuser),
            "CREATEDB" => Some(RoleOption::CreateDb),
            "NOCREATEDB" => Some(RoleOption::NoCreateDb),
            "CREATEROLE" | "CREATEUSER" => Some(RoleOption::CreateRole),
            "NOCREATEROLE" | "NOCREATEUSER" => Some(RoleOption::NoCreateRole),
            "INHERIT" => Some(RoleOption::Inherit),
            "NOINHERIT" => Some(RoleOption::NoInherit),
            "LOGIN" => Some(RoleOption::Login),
            "NOLOGIN" => Some(RoleOption::NoLogin),
            "REPLICATION" => Some(RoleOption::Replication),
            "NOREPLICATION" => Some(RoleOption::NoReplication),
            _ => None,
        }
    }

    /// Parse a whole declaration, collecting every unknown name into one
    /// error naming the role.
    pub fn parse_all(role: &str, names: &[String]) -> Result<BTreeSet<RoleOption>> {
        let mut options = BTreeSet::new();
        let mut invalid = Vec::new();
        for name in names {
            match RoleOption::parse(name) {
                Some(option) => {
                    options.insert(option);
                }
                None => invalid.push(name.clone()),
            }
        }
        if !invalid.is_empty() {
            return Err(SyncError::InvalidRoleOptions {
                role: role.to_string(),
                options: invalid.join(", "),
            });
        }
        Ok(options)
    }

    /// The `ALTER ROLE … WITH` clause.
    pub fn sql_clause(self) -> &'static str {
        match self {
            RoleOption::Superuser => "SUPERUSER",
            RoleOption::NoSuperuser => "NOSUPERUSER",
            RoleOption::CreateDb => "CREATEDB",
            RoleOption::NoCreateDb => "NOCREATEDB",
            RoleOption::CreateRole => "CREATEROLE",
            RoleOption::NoCreateRole => "NOCREATEROLE",
            RoleOption::Inherit => "INHERIT",
            RoleOption::NoInherit => "NOINHERIT",
            RoleOption::Login => "LOGIN",
            RoleOption::NoLogin => "NOLOGIN",
            RoleOption::Replication => "REPLICATION",
            RoleOption::NoReplication => "NOREPLICATION",
        }
    }

    /// The `pg_roles` column this option reflects.
    pub fn catalog_column(self) -> &'static str {
        match self {
            RoleOption::Superuser | RoleOption::NoSuperuser => "rolsuper",
            RoleOption::CreateDb | RoleOption::NoCreateDb => "rolcreatedb",
            RoleOption::CreateRole | RoleOption::NoCreateRole => "rolcreaterole",
            RoleOption::Inherit | RoleOption::NoInherit => "rolinherit",
            RoleOption::Login | RoleOption::NoLogin => "rolcanlogin",
            RoleOption::Replication | RoleOption::NoReplication => "rolreplication",
        }
    }

    /// Whether this option sets its column true.
    pub fn enables(self) -> bool {
        matches!(
            self,
            RoleOption::Superuser
                | RoleOption::CreateDb
                | RoleOption::CreateRole
                | RoleOption::Inherit
                | RoleOption::Login
                | RoleOption::Replication
        )
    }

    /// Predicate over `pg_roles` testing whether the option is in effect.
    pub fn is_set_predicate(self) -> &'static str {
        match self {
            RoleOption::Superuser => "rolsuper",
            RoleOption::NoSuperuser => "not rolsuper",
            RoleOption::CreateDb => "rolcreatedb",
            RoleOption::NoCreateDb => "not rolcreatedb",
            RoleOption::CreateRole => "rolcreaterole",
            RoleOption::NoCreateRole => "not rolcreaterole",
            RoleOption::Inherit => "rolinherit",
            RoleOption::NoInherit => "not rolinherit",
            RoleOption::Login => "rolcanlogin",
            RoleOption::NoLogin => "not rolcanlogin",
            RoleOption::Replication => "rolreplication",
            RoleOption::NoReplication => "not rolreplication",
        }
    }
}

/// In-memory handle to a role reconciled during this run.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub options: BTreeSet<RoleOption>,
    pub state: DesiredState,
}

/// Converges roles, memberships, passwords, and expiry.
pub struct RoleReconciler {
    exec: Arc<dyn SqlExecutor>,
    strict: StrictPolicy,
    roles: HashMap<String, Role>,
}

impl std::fmt::Debug for RoleReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleReconciler")
            .field("roles", &self.roles.len())
            .finish()
    }
}

impl RoleReconciler {
    pub fn new(exec: Arc<dyn SqlExecutor>, strict: StrictPolicy) -> Self {
        Self {
            exec,
            strict,
            roles: HashMap::new(),
        }
    }

    /// Converge the named role to the desired presence and option set,
    /// returning its in-memory handle.
    pub async fn reconcile(
        &mut self,
        name: &str,
        options: BTreeSet<RoleOption>,
        state: DesiredState,
    ) -> Result<Role> {
        if let Some(cached) = self.roles.get_mut(name) {
            cached.options.extend(options.iter().copied());
            if cached.state != state && self.strict.users {
                return Err(SyncError::RoleStateConflict {
                    role: name.to_string(),
                    declared: state.to_string(),
                    existing: cached.state.to_string(),
                });
            }
            return Ok(cached.clone());
        }

        match state {
            DesiredState::Absent => self.drop_role(name).await?,
            DesiredState::Present => self.create_role(name, &options).await?,
        }

        let role = Role {
            name: name.to_string(),
            options,
            state,
        };
        self.roles.insert(name.to_string(), role.clone());
        Ok(role)
    }

    async fn create_role(&self, name: &str, options: &BTreeSet<RoleOption>) -> Result<()> {
        if !self.exec.exists(None, ROLE_EXISTS, &[name]).await? {
            self.exec
                .execute(None, &format!("CREATE ROLE {}", identifier(name)), &[])
                .await?;
            info!(role = %name, "created role");
        }
        for option in options {
            self.apply_option(name, *option).await?;
        }
        Ok(())
    }

    async fn apply_option(&self, name: &str, option: RoleOption) -> Result<()> {
        let check = format!("{ROLE_EXISTS} AND {}", option.is_set_predicate());
        if self.exec.exists(None, &check, &[name]).await? {
            return Ok(());
        }
        debug!(role = %name, option = option.sql_clause(), "applying role option");
        self.exec
            .execute(
                None,
                &format!(
                    "ALTER ROLE {} WITH {}",
                    identifier(name),
                    option.sql_clause()
                ),
                &[],
            )
            .await
    }

    /// Drop the role, first handing each database's objects owned by it to
    /// that database's owner. Gated by the users strict flag; never drops
    /// the connection's own user.
    async fn drop_role(&self, name: &str) -> Result<()> {
        if !self.strict.users {
            info!(role = %name, "not dropping role (strict.users is not enabled)");
            return Ok(());
        }
        if !self.exec.exists(None, ROLE_EXISTS_NOT_SELF, &[name]).await? {
            return Ok(());
        }
        for row in self.exec.rows(None, DATABASE_OWNERS, &[]).await? {
            let [dbname, new_owner] = row.as_slice() else {
                continue;
            };
            self.exec
                .execute(
                    Some(dbname.as_str()),
                    &format!(
                        "REASSIGN OWNED BY {} TO {}",
                        identifier(name),
                        identifier(new_owner)
                    ),
                    &[],
                )
                .await?;
        }
        self.exec
            .execute(None, &format!("DROP ROLE {}", identifier(name)), &[])
            .await?;
        info!(role = %name, "dropped role");
        Ok(())
    }

    /// Make `grantee` a member of `granted`, creating both roles if needed.
    /// A second call is a no-op.
    pub async fn grant(&mut self, grantee: &str, granted: &str) -> Result<()> {
        self.reconcile(grantee, BTreeSet::new(), DesiredState::Present)
            .await?;
        self.reconcile(granted, BTreeSet::new(), DesiredState::Present)
            .await?;

        if !self
            .exec
            .exists(None, GRANT_EXISTS, &[granted, grantee])
            .await?
        {
            self.exec
                .execute(
                    None,
                    &format!("GRANT {} TO {}", identifier(granted), identifier(grantee)),
                    &[],
                )
                .await?;
            info!(granted = %granted, grantee = %grantee, "granted role");
        }
        Ok(())
    }

    /// Remove `grantee`'s membership of `granted` if it exists. Refuses to
    /// revoke the connection's own membership.
    pub async fn revoke(&mut self, grantee: &str, granted: &str) -> Result<()> {
        if self
            .exec
            .exists(None, GRANT_EXISTS_NOT_SELF, &[granted, grantee])
            .await?
        {
            self.exec
                .execute(
                    None,
                    &format!(
                        "REVOKE {} FROM {}",
                        identifier(granted),
                        identifier(grantee)
                    ),
                    &[],
                )
                .await?;
            info!(granted = %granted, grantee = %grantee, "revoked role");
        }
        Ok(())
    }

    /// Set the role's password, hashing with the salted-MD5 convention
    /// unless the value is already a hash. An empty password resets instead.
    pub async fn set_password(&self, name: &str, password: &str) -> Result<()> {
        if password.is_empty() {
            return self.reset_password(name).await;
        }
        let hashed = hash_password(name, password);
        if self
            .exec
            .exists(None, PASSWORD_DIFFERS, &[name, &hashed])
            .await?
        {
            self.exec
                .execute(
                    None,
                    &format!(
                        "ALTER ROLE {} WITH ENCRYPTED PASSWORD {}",
                        identifier(name),
                        literal(&hashed)
                    ),
                    &[],
                )
                .await?;
            info!(role = %name, "set password");
        }
        Ok(())
    }

    /// Clear the role's password if one is set. Never clears the
    /// connection's own password.
    pub async fn reset_password(&self, name: &str) -> Result<()> {
        if self.exec.exists(None, PASSWORD_SET_NOT_SELF, &[name]).await? {
            self.exec
                .execute(
                    None,
                    &format!("ALTER ROLE {} WITH PASSWORD NULL", identifier(name)),
                    &[],
                )
                .await?;
            info!(role = %name, "reset password to NULL");
        }
        Ok(())
    }

    /// Converge the role's `VALID UNTIL`: a set expiry is applied when it
    /// differs from the current value, an unset expiry resets a finite
    /// value back to infinity.
    pub async fn set_expiry(&self, name: &str, expiry: Option<DateTime<Utc>>) -> Result<()> {
        match expiry {
            Some(expiry) => {
                let formatted = expiry.format("%Y-%m-%d %H:%M:%S+00").to_string();
                if self
                    .exec
                    .exists(None, EXPIRY_DIFFERS, &[name, &formatted])
                    .await?
                {
                    self.exec
                        .execute(
                            None,
                            &format!(
                                "ALTER ROLE {} VALID UNTIL {}",
                                identifier(name),
                                literal(&formatted)
                            ),
                            &[],
                        )
                        .await?;
                    info!(role = %name, until = %formatted, "set expiry");
                }
            }
            None => {
                if self.exec.exists(None, EXPIRY_FINITE, &[name]).await? {
                    self.exec
                        .execute(
                            None,
                            &format!("ALTER ROLE {} VALID UNTIL 'infinity'", identifier(name)),
                            &[],
                        )
                        .await?;
                    info!(role = %name, "reset expiry to infinity");
                }
            }
        }
        Ok(())
    }
}

/// `"md5" + md5(password + rolename)`, the PostgreSQL salted-MD5 convention.
/// A value already in that 35-character form is returned verbatim.
pub fn hash_password(name: &str, password: &str) -> String {
    if password.len() == MD5_PASSWORD_LEN && password.starts_with("md5") {
        return password.to_string();
    }
    format!("md5{:x}", md5::compute(format!("{password}{name}")))
}
