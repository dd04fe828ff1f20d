//! # Directory Client
//!
//! Connects to the directory service and builds the membership graph.
//!
//! One session is established lazily and reused for the whole run. The
//! connect loop walks the configured server list in order, once per retry
//! round; bind credentials are resolved through the credential resolver on
//! every attempt so rotated secrets are picked up between retries. Each
//! invocation of [`DirectoryClient::base_group_members`] issues exactly one
//! subtree search and records what it finds in the graph; nothing is ever
//! written to the directory.

use ldap3::{Ldap, LdapConnAsync, Scope, SearchEntry};
use tracing::{debug, info, warn};

use crate::config::DirectoryConfig;
use crate::error::{Result, SyncError};
use crate::ldap::members::{MemberGraph, MemberId};

/// Directory session plus the membership graph it populates.
pub struct DirectoryClient {
    config: DirectoryConfig,
    session: Option<Ldap>,
    graph: MemberGraph,
}

impl std::fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("servers", &self.config.servers)
            .field("bound", &self.session.is_some())
            .finish()
    }
}

impl DirectoryClient {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            session: None,
            graph: MemberGraph::new(),
        }
    }

    pub fn graph(&self) -> &MemberGraph {
        &self.graph
    }

    /// Get the cached session, or bind a new one.
    ///
    /// Tries each server once per round, up to the configured number of
    /// rounds; the first successful bind wins. A connect or bind failure on
    /// one server only moves the loop on to the next.
    async fn connect(&mut self) -> Result<Ldap> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }

        for round in 0..self.config.retry_rounds() {
            for server in &self.config.servers {
                let bind_dn = self.config.user.resolve().await?;
                let bind_password = self.config.password.resolve().await?;

                debug!(server = %server, round, "connecting to directory server");
                let (conn, mut ldap) = match LdapConnAsync::new(server).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(server = %server, error = %e, "directory connect failed");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = conn.drive().await {
                        warn!(error = %e, "directory connection driver error");
                    }
                });

                match ldap.simple_bind(&bind_dn, &bind_password).await {
                    Ok(result) if result.rc == 0 => {
                        info!(server = %server, "directory bind established");
                        self.session = Some(ldap.clone());
                        return Ok(ldap);
                    }
                    Ok(result) => {
                        warn!(server = %server, rc = result.rc, text = %result.text, "directory bind refused");
                    }
                    Err(e) => {
                        warn!(server = %server, error = %e, "directory bind failed");
                    }
                }
            }
        }
        Err(SyncError::NoDirectoryServer)
    }

    /// Run one subtree search under `base_dn` and fold the results into the
    /// graph. Returns the base group's member id; the flattened edge list is
    /// available from [`MemberGraph::flatten`].
    pub async fn base_group_members(&mut self, base_dn: &str, filter: &str) -> Result<MemberId> {
        let mut ldap = self.connect().await?;
        let base_group = self.graph.resolve(base_dn)?;

        let member_attribute = self.config.member_attribute().to_string();
        let attrs = vec!["dn".to_string(), "cn".to_string(), member_attribute.clone()];
        let (entries, _result) = ldap
            .search(base_dn, Scope::Subtree, filter, attrs)
            .await?
            .success()?;

        for entry in entries {
            let entry = SearchEntry::construct(entry);
            let group = self.graph.resolve(&entry.dn)?;
            self.graph.add_parent(group, base_group);

            for value in entry.attrs.get(&member_attribute).into_iter().flatten() {
                let member = self.graph.resolve(value)?;
                self.graph.mark_user(member);
                self.graph.add_parent(member, group);
                debug!(
                    member = %self.graph.name(member),
                    group = %self.graph.name(group),
                    "membership discovered"
                );
            }
        }
        Ok(base_group)
    }
}
