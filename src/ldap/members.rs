//! # Membership Graph
//!
//! In-memory model of the entities discovered while walking a directory
//! group hierarchy.
//!
//! Members live in an arena addressed by stable ids; an index maps every
//! identifier form a member has been seen under (display name, `key=value`
//! pair, full DN) to the same id, so repeated references during a run
//! resolve to one instance. Parent/child relations are stored as id lists in
//! discovery order, which keeps the graph cycle-free at the type level and
//! makes traversal order deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, SyncError};

fn dn_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z]+=[^,=]+,)+[A-Za-z]+=[^,=]+$").unwrap())
}

fn pair_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]+=[^,=]+$").unwrap())
}

/// What a directory entity is, as far as the search has revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Group,
    User,
    Unknown,
}

fn kind_from_key(key: &str) -> MemberKind {
    match key {
        "cn" => MemberKind::Group,
        "uid" => MemberKind::User,
        _ => MemberKind::Unknown,
    }
}

/// Stable handle into the member arena, valid for one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(usize);

/// A directory entity: group, user, or not-yet-classified.
#[derive(Debug)]
pub struct Member {
    dn: Option<String>,
    pair: Option<String>,
    name: String,
    kind: MemberKind,
    parents: Vec<MemberId>,
    children: Vec<MemberId>,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dn(&self) -> Option<&str> {
        self.dn.as_deref()
    }

    pub fn pair(&self) -> Option<&str> {
        self.pair.as_deref()
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn children(&self) -> &[MemberId] {
        &self.children
    }

    pub fn parents(&self) -> &[MemberId] {
        &self.parents
    }
}

/// One flattened "member belongs to group" relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub member: MemberId,
    pub member_of: MemberId,
}

/// The identifier forms carried by one reference string.
struct Identity {
    dn: Option<String>,
    pair: Option<String>,
    name: String,
    kind: MemberKind,
}

fn parse_identity(id: &str) -> Identity {
    if dn_pattern().is_match(id) {
        let pair = id.split(',').next().unwrap_or(id);
        let (key, name) = pair.split_once('=').unwrap_or(("", pair));
        return Identity {
            dn: Some(id.to_string()),
            pair: Some(pair.to_string()),
            name: name.to_string(),
            kind: kind_from_key(key),
        };
    }
    if pair_pattern().is_match(id) {
        let (key, name) = id.split_once('=').unwrap_or(("", id));
        return Identity {
            dn: None,
            pair: Some(id.to_string()),
            name: name.to_string(),
            kind: kind_from_key(key),
        };
    }
    Identity {
        dn: None,
        pair: None,
        name: id.to_string(),
        kind: MemberKind::Unknown,
    }
}

/// Arena of members discovered during one run.
#[derive(Debug, Default)]
pub struct MemberGraph {
    arena: Vec<Member>,
    index: HashMap<String, MemberId>,
}

impl MemberGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(&self, id: MemberId) -> &Member {
        &self.arena[id.0]
    }

    pub fn name(&self, id: MemberId) -> &str {
        &self.arena[id.0].name
    }

    /// Resolve `id` (DN, `key=value` pair, or bare name) to a member,
    /// creating it on first reference.
    ///
    /// A member created from a pair or bare name may later gain DN detail,
    /// never the reverse; an identifier that contradicts the cached pair or
    /// name under the same key is a conflict.
    pub fn resolve(&mut self, id: &str) -> Result<MemberId> {
        let identity = parse_identity(id);

        let found = self
            .index
            .get(id)
            .or_else(|| self.index.get(&identity.name))
            .copied();

        if let Some(mid) = found {
            self.merge(mid, &identity, id)?;
            self.index_forms(mid);
            return Ok(mid);
        }

        let mid = MemberId(self.arena.len());
        self.arena.push(Member {
            dn: identity.dn,
            pair: identity.pair,
            name: identity.name,
            kind: identity.kind,
            parents: Vec::new(),
            children: Vec::new(),
        });
        self.index_forms(mid);
        Ok(mid)
    }

    fn merge(&mut self, mid: MemberId, identity: &Identity, id: &str) -> Result<()> {
        let member = &mut self.arena[mid.0];

        if let Some(pair) = &identity.pair {
            if identity.dn.is_some() {
                if member.dn.is_some() {
                    return Ok(());
                }
                if member.pair.as_deref().is_some_and(|p| p != pair.as_str()) {
                    return Err(SyncError::IdentityConflict {
                        id: id.to_string(),
                        reason: format!("pair is already set to '{}'", member.pair.as_deref().unwrap_or("")),
                    });
                }
                if member.name != identity.name {
                    return Err(SyncError::IdentityConflict {
                        id: id.to_string(),
                        reason: format!("name is already set to '{}'", member.name),
                    });
                }
                member.dn.clone_from(&identity.dn);
                member.pair = Some(pair.clone());
                member.kind = identity.kind;
                return Ok(());
            }

            // Pair form only: pair and name never change once known.
            if member.dn.is_some() || member.pair.is_some() {
                return Ok(());
            }
            if member.name != identity.name {
                return Err(SyncError::IdentityConflict {
                    id: id.to_string(),
                    reason: format!("name is already set to '{}'", member.name),
                });
            }
            member.pair = Some(pair.clone());
            member.kind = identity.kind;
        }
        Ok(())
    }

    fn index_forms(&mut self, mid: MemberId) {
        let member = &self.arena[mid.0];
        let mut keys = vec![member.name.clone()];
        if let Some(pair) = &member.pair {
            keys.push(pair.clone());
        }
        if let Some(dn) = &member.dn {
            keys.push(dn.clone());
        }
        for key in keys {
            self.index.insert(key, mid);
        }
    }

    /// Mark a member as a user unless the search already classified it.
    pub fn mark_user(&mut self, id: MemberId) {
        let member = &mut self.arena[id.0];
        if member.kind == MemberKind::Unknown {
            member.kind = MemberKind::User;
        }
    }

    /// Record that `child` belongs to `parent`.
    ///
    /// A member is never its own parent: the same id, or an identical DN,
    /// is a no-op. Repeated additions are no-ops too.
    pub fn add_parent(&mut self, child: MemberId, parent: MemberId) {
        if child == parent {
            return;
        }
        if let (Some(cdn), Some(pdn)) = (&self.arena[child.0].dn, &self.arena[parent.0].dn) {
            if cdn == pdn {
                return;
            }
        }
        if self.arena[child.0].parents.contains(&parent) {
            return;
        }
        self.arena[child.0].parents.push(parent);
        self.arena[parent.0].children.push(child);
    }

    /// Flatten the tree reachable from `root` into membership edges.
    ///
    /// Depth-first over children in discovery order: each child yields its
    /// edge before any of its descendants' edges. A child already on the
    /// current path is skipped, so cyclic input terminates.
    pub fn flatten(&self, root: MemberId) -> Vec<Membership> {
        let mut edges = Vec::new();
        let mut path = HashSet::from([root]);
        self.walk(root, &mut path, &mut edges);
        edges
    }

    fn walk(&self, id: MemberId, path: &mut HashSet<MemberId>, edges: &mut Vec<Membership>) {
        for &child in &self.arena[id.0].children {
            if path.contains(&child) {
                continue;
            }
            edges.push(Membership {
                member: child,
                member_of: id,
            });
            path.insert(child);
            self.walk(child, path, edges);
            path.remove(&child);
        }
    }
}
