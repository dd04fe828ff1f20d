//! # Error Types
//!
//! One error enum for the whole reconciliation engine.
//!
//! Every error is fatal to the run: the process reports it and exits
//! non-zero, relying on idempotent convergence to finish the work on the
//! next scheduled run. Skipped drops under a disabled strict flag are not
//! errors; they are logged and treated as success.

use thiserror::Error;

/// Errors raised while reconciling cluster state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No directory server could be bound after exhausting the retry rounds.
    #[error("none of the directory servers are available")]
    NoDirectoryServer,

    /// A directory identifier contradicts an already-cached member.
    #[error("identity conflict for '{id}': {reason}")]
    IdentityConflict { id: String, reason: String },

    /// A directory-backed user declaration is missing its search parameters.
    #[error("ldapbasedn and ldapfilter must be set for '{0}' (auth: ldap-group)")]
    MissingSearchBase(String),

    /// A credential could not be resolved.
    #[error("credential error: {0}")]
    Credential(String),

    /// One or more role option names are not in the supported set.
    #[error("creating role '{role}' with invalid role options ({options})")]
    InvalidRoleOptions { role: String, options: String },

    /// A role was redeclared with a different desired state.
    #[error("role '{role}' is declared '{declared}' but was already reconciled as '{existing}'")]
    RoleStateConflict {
        role: String,
        declared: String,
        existing: String,
    },

    /// The extension does not appear in `pg_available_extensions`.
    #[error("extension '{0}' is not available")]
    ExtensionUnavailable(String),

    /// The requested version does not appear in `pg_available_extension_versions`.
    #[error("version '{version}' is not available for extension '{extension}'")]
    ExtensionVersionUnavailable { extension: String, version: String },

    /// A connection parameter in the `dsn` map is not understood.
    #[error("invalid connection parameter '{key}': {reason}")]
    ConnectionParam { key: String, reason: String },

    #[error(transparent)]
    Ldap(#[from] ldap3::LdapError),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
