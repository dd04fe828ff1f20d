//! # pg-dirsync Library
//!
//! Reconciles the access-control state of a PostgreSQL cluster against a
//! declared desired state, deriving group memberships from an LDAP
//! directory hierarchy.
//!
//! The pieces, leaves first:
//!
//! - [`credential`]: resolves bind secrets from values, files, or executables
//! - [`ldap`]: directory client plus the membership graph it builds
//! - [`pg`]: connection manager and the role/database/slot reconcilers
//! - [`reconciler`]: sequences one pass (roles → users → databases → slots)
//!
//! Tests for each piece live beside it; statement-level integration tests
//! run against a mock executor under `tests/`.

pub mod cli;
pub mod config;
pub mod constants;
pub mod credential;
pub mod error;
pub mod ldap;
pub mod pg;
pub mod reconciler;

pub use config::{Config, DesiredState, StrictPolicy};
pub use error::{Result, SyncError};
pub use reconciler::Reconciler;
