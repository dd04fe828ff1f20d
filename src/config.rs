//! # Configuration
//!
//! The declarative desired-state document.
//!
//! One YAML file declares everything a run converges towards: general run
//! options, the strict-mode policy, directory connection parameters, the
//! PostgreSQL connection parameter set, databases (with extensions), roles,
//! users, and replication slots. Parsing is strict where it matters: unknown
//! auth modes and malformed states are rejected here, before any connection
//! is opened.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::constants::{DEFAULT_MEMBER_ATTRIBUTE, MIN_CONN_RETRIES};
use crate::credential::Credential;
use crate::error::Result;

/// Desired presence of a managed object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

impl DesiredState {
    pub fn is_present(self) -> bool {
        matches!(self, DesiredState::Present)
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredState::Present => write!(f, "present"),
            DesiredState::Absent => write!(f, "absent"),
        }
    }
}

impl<'de> Deserialize<'de> for DesiredState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        match value.to_lowercase().as_str() {
            "present" | "" => Ok(DesiredState::Present),
            "absent" => Ok(DesiredState::Absent),
            other => Err(de::Error::custom(format!(
                "invalid state '{other}' (should be present or absent)"
            ))),
        }
    }
}

/// How a declared user authenticates, which decides how its role is managed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum AuthMethod {
    /// Role and memberships derived from a directory group search.
    #[serde(rename = "ldap-group")]
    LdapGroup,
    /// Login role authenticated by the server against the directory.
    #[serde(rename = "ldap-user")]
    LdapUser,
    /// Login role authenticated by client certificate.
    #[serde(rename = "clientcert")]
    ClientCert,
    /// Login role with a managed password and expiry.
    #[default]
    #[serde(rename = "password")]
    Password,
    /// Alias of `password`; the hash convention is the same.
    #[serde(rename = "md5")]
    Md5,
}

/// General run options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub loglevel: String,
    /// Seconds to sleep before the reconciliation pass starts.
    pub run_delay: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
            run_delay: 0,
        }
    }
}

/// Per-category switches for destructive operations.
///
/// Each flag gates only the corresponding drop path; create and alter paths
/// always run. A drop requested while its flag is off is logged and treated
/// as success.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct StrictPolicy {
    pub users: bool,
    pub databases: bool,
    pub extensions: bool,
    pub slots: bool,
}

/// Directory connection parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Server URLs tried in order, once per retry round.
    pub servers: Vec<String>,
    pub user: Credential,
    pub password: Credential,
    pub conn_retries: u32,
    /// Multivalued attribute holding group member names.
    pub member_attribute: Option<String>,
}

impl DirectoryConfig {
    /// Retry rounds, never less than one.
    pub fn retry_rounds(&self) -> u32 {
        self.conn_retries.max(MIN_CONN_RETRIES)
    }

    pub fn member_attribute(&self) -> &str {
        self.member_attribute
            .as_deref()
            .unwrap_or(DEFAULT_MEMBER_ATTRIBUTE)
    }
}

/// PostgreSQL connection parameters for the administrative connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// libpq-style parameter map (host, port, user, password, dbname, sslmode).
    pub dsn: BTreeMap<String, String>,
}

/// A declared extension inside a database declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub schema: Option<String>,
    pub version: Option<String>,
    pub state: DesiredState,
}

/// A declared database.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Owner role; defaults to the database name.
    pub owner: Option<String>,
    pub extensions: BTreeMap<String, ExtensionConfig>,
    pub state: DesiredState,
}

/// A declared role.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub options: Vec<String>,
    pub memberof: Vec<String>,
    pub state: DesiredState,
}

/// A declared user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub auth: AuthMethod,
    pub ldapbasedn: Option<String>,
    pub ldapfilter: Option<String>,
    pub options: Vec<String>,
    pub memberof: Vec<String>,
    pub password: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub state: DesiredState,
}

/// A declared replication slot: either a bare name or a name/state pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SlotConfig {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        state: DesiredState,
    },
}

impl SlotConfig {
    pub fn name(&self) -> &str {
        match self {
            SlotConfig::Name(name) => name,
            SlotConfig::Detailed { name, .. } => name,
        }
    }

    pub fn state(&self) -> DesiredState {
        match self {
            SlotConfig::Name(_) => DesiredState::Present,
            SlotConfig::Detailed { state, .. } => *state,
        }
    }
}

/// The whole desired-state document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub strict: StrictPolicy,
    pub ldap: DirectoryConfig,
    pub postgresql: PostgresConfig,
    pub databases: BTreeMap<String, DatabaseConfig>,
    pub roles: BTreeMap<String, RoleConfig>,
    pub users: BTreeMap<String, UserConfig>,
    pub slots: Vec<SlotConfig>,
}

impl Config {
    /// Load and parse the document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
