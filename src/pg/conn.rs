//! # Connection Manager
//!
//! Owns one lazily-established connection set per distinct database name.
//!
//! The administrative name resolves from the `dbname` connection parameter,
//! the `PGDATABASE` environment variable, or the connection user, in that
//! order; a database-scoped request for that same name reuses the
//! administrative connection set. Each set is a single-connection pool
//! created lazily and checked before use, so a connection observed closed is
//! re-established transparently.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::pg::SqlExecutor;

/// Lazily-connected statement executor over one set of connection
/// parameters, fanned out per target database name.
#[derive(Debug)]
pub struct ConnectionManager {
    params: BTreeMap<String, String>,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl ConnectionManager {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self {
            params,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Name of the administrative database.
    pub fn admin_db(&self) -> String {
        if let Some(dbname) = self.params.get("dbname") {
            return dbname.clone();
        }
        if let Ok(dbname) = std::env::var("PGDATABASE") {
            if !dbname.is_empty() {
                return dbname;
            }
        }
        self.user_name()
    }

    /// Name of the connection user.
    pub fn user_name(&self) -> String {
        if let Some(user) = self.params.get("user") {
            return user.clone();
        }
        for var in ["PGUSER", "USER"] {
            if let Ok(user) = std::env::var(var) {
                if !user.is_empty() {
                    return user;
                }
            }
        }
        "postgres".to_string()
    }

    /// Translate the parameter map into typed connection options, overriding
    /// the database name. Unknown keys are configuration errors.
    fn connect_options(&self, dbname: &str) -> Result<PgConnectOptions> {
        let mut options = PgConnectOptions::new();
        for (key, value) in &self.params {
            options = match key.as_str() {
                "host" => options.host(value),
                "port" => {
                    let port: u16 = value.parse().map_err(|_| SyncError::ConnectionParam {
                        key: key.clone(),
                        reason: format!("'{value}' is not a port number"),
                    })?;
                    options.port(port)
                }
                "user" => options.username(value),
                "password" => options.password(value),
                "dbname" => options,
                "sslmode" => options.ssl_mode(parse_ssl_mode(value)?),
                "application_name" => options.application_name(value),
                _ => {
                    return Err(SyncError::ConnectionParam {
                        key: key.clone(),
                        reason: "unsupported parameter".to_string(),
                    })
                }
            };
        }
        Ok(options.database(dbname))
    }

    /// Get the pool for `db` (`None` for the administrative database),
    /// creating it lazily on first use.
    async fn pool(&self, db: Option<&str>) -> Result<PgPool> {
        let name = match db {
            Some(name) => name.to_string(),
            None => self.admin_db(),
        };

        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&name) {
                return Ok(pool.clone());
            }
        }

        debug!(database = %name, "opening connection set");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .test_before_acquire(true)
            .connect_lazy_with(self.connect_options(&name)?);

        let mut pools = self.pools.write().await;
        Ok(pools.entry(name).or_insert(pool).clone())
    }
}

fn parse_ssl_mode(value: &str) -> Result<PgSslMode> {
    match value {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        other => Err(SyncError::ConnectionParam {
            key: "sslmode".to_string(),
            reason: format!("unknown mode '{other}'"),
        }),
    }
}

fn bind_all<'q>(
    sql: &'q str,
    params: &'q [&'q str],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = query.bind(*param);
    }
    query
}

#[async_trait]
impl SqlExecutor for ConnectionManager {
    async fn execute(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<()> {
        let pool = self.pool(db).await?;
        bind_all(sql, params).execute(&pool).await?;
        Ok(())
    }

    async fn exists(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<bool> {
        let pool = self.pool(db).await?;
        let row = bind_all(sql, params).fetch_optional(&pool).await?;
        Ok(row.is_some())
    }

    async fn one_field(
        &self,
        db: Option<&str>,
        sql: &str,
        params: &[&str],
    ) -> Result<Option<String>> {
        let pool = self.pool(db).await?;
        let row = bind_all(sql, params).fetch_optional(&pool).await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn rows(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<Vec<Vec<String>>> {
        let pool = self.pool(db).await?;
        let rows = bind_all(sql, params).fetch_all(&pool).await?;
        rows.into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<String, _>(i).map_err(SyncError::from))
                    .collect()
            })
            .collect()
    }
}
