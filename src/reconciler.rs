//! # Reconciler
//!
//! Top-level orchestration of one reconciliation pass.
//!
//! The reconciler owns the directory client and the three object
//! reconcilers, which share one connection manager and one strict-mode
//! policy. A pass is strictly sequential:
//!
//! 1. Declared roles (options and static memberships)
//! 2. Declared users, including directory-derived group grants
//! 3. Databases, which create owner and read-only roles as a side effect
//! 4. Replication slots
//!
//! The first error aborts the pass; the next scheduled run converges
//! whatever was left behind.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{AuthMethod, Config, UserConfig};
use crate::error::{Result, SyncError};
use crate::ldap::DirectoryClient;
use crate::pg::{
    ConnectionManager, DatabaseReconciler, RoleOption, RoleReconciler, SlotReconciler, SqlExecutor,
};

/// One reconciliation pass over the whole declared state.
pub struct Reconciler {
    config: Config,
    directory: DirectoryClient,
    roles: RoleReconciler,
    databases: DatabaseReconciler,
    slots: SlotReconciler,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(config: Config) -> Self {
        let exec: Arc<dyn SqlExecutor> =
            Arc::new(ConnectionManager::new(config.postgresql.dsn.clone()));
        Self::with_executor(config, exec)
    }

    /// Build against an explicit executor. Tests use this to count the
    /// statements a pass issues.
    pub fn with_executor(config: Config, exec: Arc<dyn SqlExecutor>) -> Self {
        let strict = config.strict;
        Self {
            directory: DirectoryClient::new(config.ldap.clone()),
            roles: RoleReconciler::new(exec.clone(), strict),
            databases: DatabaseReconciler::new(exec.clone(), strict, config.databases.clone()),
            slots: SlotReconciler::new(exec, strict, config.slots.clone()),
            config,
        }
    }

    /// Run one pass: roles, users, databases, replication slots.
    pub async fn run(&mut self) -> Result<()> {
        let delay = self.config.general.run_delay;
        if delay > 0 {
            debug!(seconds = delay, "delaying run start");
            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
        }

        self.reconcile_roles().await?;
        self.reconcile_users().await?;
        self.databases.reconcile(&mut self.roles).await?;
        self.slots.reconcile().await?;
        info!("reconciliation pass complete");
        Ok(())
    }

    async fn reconcile_roles(&mut self) -> Result<()> {
        for (name, declared) in &self.config.roles {
            let options = RoleOption::parse_all(name, &declared.options)?;
            self.roles.reconcile(name, options, declared.state).await?;
            if declared.state.is_present() {
                for group in &declared.memberof {
                    self.roles.grant(name, group).await?;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_users(&mut self) -> Result<()> {
        let users = self.config.users.clone();
        for (name, declared) in &users {
            match declared.auth {
                AuthMethod::LdapGroup => self.reconcile_group_user(name, declared).await?,
                AuthMethod::LdapUser | AuthMethod::ClientCert => {
                    self.reconcile_external_user(name, declared).await?;
                }
                AuthMethod::Password | AuthMethod::Md5 => {
                    self.reconcile_password_user(name, declared).await?;
                }
            }
        }
        Ok(())
    }

    /// A directory-backed group: reconcile the group's role, then walk the
    /// flattened membership edges granting each member its group.
    async fn reconcile_group_user(&mut self, name: &str, declared: &UserConfig) -> Result<()> {
        let (Some(base_dn), Some(filter)) = (&declared.ldapbasedn, &declared.ldapfilter) else {
            return Err(SyncError::MissingSearchBase(name.to_string()));
        };
        debug!(user = %name, base_dn = %base_dn, "deriving role from directory group");

        let options = RoleOption::parse_all(name, &declared.options)?;
        let root = self.directory.base_group_members(base_dn, filter).await?;

        let graph = self.directory.graph();
        let root_name = graph.name(root).to_string();
        let edges: Vec<(String, String)> = graph
            .flatten(root)
            .into_iter()
            .map(|edge| {
                (
                    graph.name(edge.member).to_string(),
                    graph.name(edge.member_of).to_string(),
                )
            })
            .collect();

        self.roles
            .reconcile(&root_name, options, declared.state)
            .await?;
        self.roles.reset_password(&root_name).await?;

        for (member, member_of) in edges {
            self.roles
                .reconcile(&member, login_only(), declared.state)
                .await?;
            if declared.state.is_present() {
                self.roles.grant(&member, &member_of).await?;
            }
        }
        Ok(())
    }

    /// Authentication happens outside the cluster (directory bind or client
    /// certificate): login role, no managed password.
    async fn reconcile_external_user(&mut self, name: &str, declared: &UserConfig) -> Result<()> {
        let mut options = RoleOption::parse_all(name, &declared.options)?;
        options.insert(RoleOption::Login);
        self.roles.reconcile(name, options, declared.state).await?;
        self.roles.reset_password(name).await?;
        if declared.state.is_present() {
            for group in &declared.memberof {
                self.roles.grant(name, group).await?;
            }
        }
        Ok(())
    }

    /// Password-authenticated user: login role with managed password and
    /// expiry. An absent or empty password resets the stored one.
    async fn reconcile_password_user(&mut self, name: &str, declared: &UserConfig) -> Result<()> {
        let mut options = RoleOption::parse_all(name, &declared.options)?;
        options.insert(RoleOption::Login);
        self.roles.reconcile(name, options, declared.state).await?;
        self.roles
            .set_password(name, declared.password.as_deref().unwrap_or_default())
            .await?;
        self.roles.set_expiry(name, declared.expiry).await?;
        Ok(())
    }
}

fn login_only() -> BTreeSet<RoleOption> {
    BTreeSet::from([RoleOption::Login])
}
