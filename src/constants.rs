//! # Constants
//!
//! Shared constants used throughout the reconciler.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "PG_DIRSYNC_CONFIG";

/// Default configuration file path when neither the CLI flag nor the
/// environment variable is set.
pub const DEFAULT_CONFIG_PATH: &str = "./pg-dirsync.yaml";

/// Fixed role that is granted membership of every managed database owner.
pub const OPERATIONS_ROLE: &str = "opex";

/// Fixed role that is granted membership of every per-database read-only role.
pub const READONLY_ROLE: &str = "readonly";

/// Suffix appended to a database name to derive its read-only role.
pub const READONLY_SUFFIX: &str = "_readonly";

/// Directory attribute holding group member names when none is configured.
pub const DEFAULT_MEMBER_ATTRIBUTE: &str = "memberUid";

/// Minimum number of directory connection retry rounds.
pub const MIN_CONN_RETRIES: u32 = 1;

/// Length of a PostgreSQL salted-MD5 password hash ("md5" + 32 hex digits).
pub const MD5_PASSWORD_LEN: usize = 35;
