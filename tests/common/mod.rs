//! Shared test harness: a mock [`SqlExecutor`] over an in-memory catalog.
//!
//! The mock records every issued statement and emulates just enough of the
//! server catalogs (`pg_roles`, `pg_auth_members`, `pg_shadow`, `pg_user`,
//! `pg_database`, `pg_extension`, `pg_replication_slots`) for the
//! existence checks the reconcilers run. Statements mutate the catalog the
//! way the real server would, which is what makes second-run idempotence
//! observable: a converged catalog answers every check positively and the
//! statement log stays empty.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use pg_dirsync::pg::{RoleOption, SqlExecutor};
use pg_dirsync::Result;

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub db: Option<String>,
    pub sql: String,
    pub params: Vec<String>,
}

/// Emulated server-side state.
#[derive(Debug, Default)]
pub struct Catalog {
    pub current_user: String,
    pub roles: HashSet<String>,
    /// (role, pg_roles column) → flag value; unset means false.
    pub role_flags: HashMap<(String, String), bool>,
    /// (granted, grantee) membership edges.
    pub grants: HashSet<(String, String)>,
    /// Explicit pg_shadow rows: usename → passwd. Login roles created
    /// during the test appear implicitly with a NULL password.
    pub shadow: HashMap<String, Option<String>>,
    /// pg_user rows: usename → valuntil (textual, "infinity" for none).
    pub expiries: HashMap<String, Option<String>>,
    pub databases: HashSet<String>,
    pub db_owners: HashMap<String, String>,
    pub available_extensions: HashSet<String>,
    pub available_versions: HashSet<(String, String)>,
    /// database → extension → installed version.
    pub installed_extensions: HashMap<String, HashMap<String, String>>,
    pub slots: HashSet<String>,
    /// database → schemas with tables not yet covered by the read-only grant.
    pub ungranted_schemas: HashMap<String, Vec<String>>,
    /// Rows served for the database-owner listing used before a role drop.
    pub owned_databases: Vec<(String, String)>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            current_user: "postgres".to_string(),
            ..Self::default()
        }
    }

    fn flag(&self, role: &str, column: &str) -> bool {
        self.role_flags
            .get(&(role.to_string(), column.to_string()))
            .copied()
            .unwrap_or(false)
    }

    fn in_shadow(&self, name: &str) -> bool {
        self.shadow.contains_key(name) || self.flag(name, "rolcanlogin")
    }

    fn password_of(&self, name: &str) -> Option<String> {
        self.shadow.get(name).cloned().flatten()
    }

    fn valuntil_of(&self, name: &str) -> Option<String> {
        self.expiries.get(name).cloned().flatten()
    }
}

#[derive(Debug, Default)]
struct Inner {
    catalog: Catalog,
    log: Vec<Statement>,
}

/// Statement-recording executor backed by [`Catalog`].
#[derive(Debug)]
pub struct MockExecutor {
    inner: Mutex<Inner>,
}

impl MockExecutor {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: Mutex::new(Inner {
                catalog,
                log: Vec::new(),
            }),
        }
    }

    /// Every statement issued so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Number of statements issued so far.
    pub fn statement_count(&self) -> usize {
        self.inner.lock().unwrap().log.len()
    }

    /// Statements whose SQL contains `needle`.
    pub fn statements_matching(&self, needle: &str) -> Vec<Statement> {
        self.statements()
            .into_iter()
            .filter(|s| s.sql.contains(needle))
            .collect()
    }

    /// Forget the log, keeping the catalog. Call between "runs".
    pub fn clear_log(&self) {
        self.inner.lock().unwrap().log.clear();
    }

    pub fn with_catalog<T>(&self, f: impl FnOnce(&mut Catalog) -> T) -> T {
        f(&mut self.inner.lock().unwrap().catalog)
    }
}

/// Contents of every double-quoted identifier in `sql`, in order.
fn quoted_identifiers(sql: &str) -> Vec<String> {
    sql.split('"')
        .enumerate()
        .filter_map(|(i, part)| (i % 2 == 1).then(|| part.to_string()))
        .collect()
}

/// Contents of the first single-quoted literal in `sql`, if any.
fn first_literal(sql: &str) -> Option<String> {
    let mut parts = sql.split('\'');
    parts.next()?;
    parts.next().map(|s| s.to_string())
}

fn apply(catalog: &mut Catalog, db: Option<&str>, sql: &str, params: &[&str]) {
    let idents = quoted_identifiers(sql);
    let db_key = db.unwrap_or("").to_string();

    if sql.starts_with("CREATE ROLE") {
        if let Some(role) = idents.first() {
            catalog.roles.insert(role.clone());
        }
    } else if sql.starts_with("DROP ROLE") {
        if let Some(role) = idents.first() {
            catalog.roles.remove(role);
        }
    } else if sql.starts_with("ALTER ROLE") && sql.contains("ENCRYPTED PASSWORD") {
        if let (Some(role), Some(hash)) = (idents.first(), first_literal(sql)) {
            catalog.shadow.insert(role.clone(), Some(hash));
        }
    } else if sql.starts_with("ALTER ROLE") && sql.ends_with("PASSWORD NULL") {
        if let Some(role) = idents.first() {
            catalog.shadow.insert(role.clone(), None);
        }
    } else if sql.starts_with("ALTER ROLE") && sql.contains("VALID UNTIL") {
        if let (Some(role), Some(until)) = (idents.first(), first_literal(sql)) {
            catalog.expiries.insert(role.clone(), Some(until));
        }
    } else if sql.starts_with("ALTER ROLE") && sql.contains(" WITH ") {
        if let Some(role) = idents.first() {
            for option in RoleOption::all() {
                if sql.ends_with(&format!("WITH {}", option.sql_clause())) {
                    catalog.role_flags.insert(
                        (role.clone(), option.catalog_column().to_string()),
                        option.enables(),
                    );
                    break;
                }
            }
        }
    } else if sql.starts_with("GRANT SELECT ON ALL TABLES IN SCHEMA") {
        if let Some(schema) = idents.first() {
            if let Some(schemas) = catalog.ungranted_schemas.get_mut(&db_key) {
                schemas.retain(|s| s != schema);
            }
        }
    } else if sql.starts_with("GRANT ") {
        if let [granted, grantee] = idents.as_slice() {
            catalog.grants.insert((granted.clone(), grantee.clone()));
        }
    } else if sql.starts_with("REVOKE ") {
        if let [granted, grantee] = idents.as_slice() {
            catalog.grants.remove(&(granted.clone(), grantee.clone()));
        }
    } else if sql.starts_with("CREATE DATABASE") {
        if let Some(name) = idents.first() {
            catalog.databases.insert(name.clone());
        }
    } else if sql.starts_with("DROP DATABASE") {
        if let Some(name) = idents.first() {
            catalog.databases.remove(name);
            catalog.db_owners.remove(name);
        }
    } else if sql.starts_with("ALTER DATABASE") && sql.contains("OWNER TO") {
        if let [name, owner] = idents.as_slice() {
            catalog.db_owners.insert(name.clone(), owner.clone());
        }
    } else if sql.starts_with("CREATE EXTENSION") {
        if let Some(name) = idents.first() {
            let version = first_literal(sql).unwrap_or_else(|| "1.0".to_string());
            catalog
                .installed_extensions
                .entry(db_key)
                .or_default()
                .insert(name.clone(), version);
        }
    } else if sql.starts_with("ALTER EXTENSION") && sql.contains("UPDATE TO") {
        if let (Some(name), Some(version)) = (idents.first(), first_literal(sql)) {
            catalog
                .installed_extensions
                .entry(db_key)
                .or_default()
                .insert(name.clone(), version);
        }
    } else if sql.starts_with("DROP EXTENSION") {
        if let Some(name) = idents.first() {
            if let Some(installed) = catalog.installed_extensions.get_mut(&db_key) {
                installed.remove(name);
            }
        }
    } else if sql.contains("pg_create_physical_replication_slot") {
        if let Some(name) = params.first() {
            catalog.slots.insert((*name).to_string());
        }
    } else if sql.contains("pg_drop_physical_replication_slot") {
        if let Some(name) = params.first() {
            catalog.slots.remove(*name);
        }
    }
}

fn answer_exists(catalog: &Catalog, db: Option<&str>, sql: &str, params: &[&str]) -> bool {
    let p = |i: usize| params.get(i).copied().unwrap_or("");

    if sql.contains("pg_auth_members") {
        let edge = (p(0).to_string(), p(1).to_string());
        let mut found = catalog.grants.contains(&edge);
        if sql.contains("CURRENT_USER") {
            found = found && p(1) != catalog.current_user;
        }
        return found;
    }
    if sql.contains("pg_shadow") {
        if sql.contains("passwd IS NOT NULL") {
            return catalog.in_shadow(p(0))
                && catalog.password_of(p(0)).is_some()
                && p(0) != catalog.current_user;
        }
        let stored = catalog.password_of(p(0)).unwrap_or_default();
        return catalog.in_shadow(p(0)) && stored != p(1);
    }
    if sql.contains("pg_user") {
        if sql.contains("valuntil IS NOT NULL") {
            return matches!(catalog.valuntil_of(p(0)), Some(v) if v != "infinity");
        }
        let stored = catalog
            .valuntil_of(p(0))
            .unwrap_or_else(|| "infinity".to_string());
        return catalog.in_shadow(p(0)) && stored != p(1);
    }
    if sql.contains("pg_available_extension_versions") {
        return catalog
            .available_versions
            .contains(&(p(0).to_string(), p(1).to_string()));
    }
    if sql.contains("pg_available_extensions") {
        return catalog.available_extensions.contains(p(0));
    }
    if sql.contains("FROM pg_extension") {
        return catalog
            .installed_extensions
            .get(db.unwrap_or(""))
            .is_some_and(|installed| installed.contains_key(p(0)));
    }
    if sql.contains("pg_replication_slots") {
        return catalog.slots.contains(p(0));
    }
    if sql.contains("INNER JOIN pg_roles rol") {
        return catalog.db_owners.get(p(0)).map(String::as_str) == Some(p(1));
    }
    if sql.contains("pg_database") {
        return catalog.databases.contains(p(0));
    }
    if sql.contains("pg_roles") {
        if !catalog.roles.contains(p(0)) {
            return false;
        }
        if sql.contains("CURRENT_USER") && p(0) == catalog.current_user {
            return false;
        }
        for option in RoleOption::all() {
            if sql.ends_with(&format!("AND {}", option.is_set_predicate())) {
                return catalog.flag(p(0), option.catalog_column()) == option.enables();
            }
        }
        return true;
    }
    panic!("mock executor saw an unexpected exists query: {sql}");
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn execute(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(Statement {
            db: db.map(str::to_string),
            sql: sql.to_string(),
            params: params.iter().map(|p| (*p).to_string()).collect(),
        });
        apply(&mut inner.catalog, db, sql, params);
        Ok(())
    }

    async fn exists(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(answer_exists(&inner.catalog, db, sql, params))
    }

    async fn one_field(
        &self,
        db: Option<&str>,
        sql: &str,
        params: &[&str],
    ) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        if sql.contains("extversion") {
            let db_key = db.unwrap_or("");
            return Ok(inner
                .catalog
                .installed_extensions
                .get(db_key)
                .and_then(|installed| installed.get(params.first().copied().unwrap_or("")))
                .cloned());
        }
        Ok(None)
    }

    async fn rows(
        &self,
        db: Option<&str>,
        sql: &str,
        _params: &[&str],
    ) -> Result<Vec<Vec<String>>> {
        let inner = self.inner.lock().unwrap();
        if sql.contains("datdba") {
            return Ok(inner
                .catalog
                .owned_databases
                .iter()
                .map(|(name, owner)| vec![name.clone(), owner.clone()])
                .collect());
        }
        if sql.contains("pg_tables") {
            return Ok(inner
                .catalog
                .ungranted_schemas
                .get(db.unwrap_or(""))
                .map(|schemas| schemas.iter().map(|s| vec![s.clone()]).collect())
                .unwrap_or_default());
        }
        Ok(Vec::new())
    }
}
