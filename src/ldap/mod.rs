//! # Directory Module
//!
//! The membership-graph side of the reconciler: a read-only directory
//! client and the arena-backed graph it populates.

pub mod client;
pub mod members;

pub use client::DirectoryClient;
pub use members::{Member, MemberGraph, MemberId, MemberKind, Membership};
