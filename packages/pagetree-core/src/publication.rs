//! Publication scoping and visibility predicates.
//!
//! A [`PublicationContext`] is owned by the calling execution context (one
//! per request, task or test) and decides whether reads see every node or
//! only the ones currently published. Scopes nest LIFO: the innermost scope
//! decides, and leaving it restores the previous mode exactly.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::node::{Bounds, Node};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScopeMode {
    #[default]
    All,
    PublishedOnly,
}

#[derive(Clone, Debug, Default)]
pub struct PublicationContext {
    default_mode: ScopeMode,
    stack: Vec<ScopeMode>,
}

impl PublicationContext {
    pub fn new(default_mode: ScopeMode) -> Self {
        Self {
            default_mode,
            stack: Vec::new(),
        }
    }

    /// Context whose outermost mode is [`ScopeMode::PublishedOnly`], the usual
    /// setting for public-facing requests.
    pub fn published() -> Self {
        Self::new(ScopeMode::PublishedOnly)
    }

    pub fn mode(&self) -> ScopeMode {
        self.stack.last().copied().unwrap_or(self.default_mode)
    }

    pub fn is_published_only(&self) -> bool {
        self.mode() == ScopeMode::PublishedOnly
    }

    /// Number of scopes currently entered.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn enter_scope(&mut self, mode: ScopeMode) {
        self.stack.push(mode);
    }

    /// Leaves the innermost scope and returns its mode.
    pub fn exit_scope(&mut self) -> Result<ScopeMode> {
        self.stack.pop().ok_or(Error::UnbalancedScope)
    }

    /// Enters `mode` for the lifetime of the returned guard. The guard
    /// dereferences to the context so reads and nested scopes go through it.
    pub fn scope(&mut self, mode: ScopeMode) -> ScopeGuard<'_> {
        self.enter_scope(mode);
        let depth = self.stack.len();
        ScopeGuard { ctx: self, depth }
    }

    pub fn select_published(&mut self, published: bool) -> ScopeGuard<'_> {
        self.scope(if published {
            ScopeMode::PublishedOnly
        } else {
            ScopeMode::All
        })
    }

    /// The instant reads should evaluate publication at, or `None` when the
    /// active mode selects everything. Truncated to the minute so results
    /// stay stable within a request.
    pub fn live_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.mode() {
            ScopeMode::All => None,
            ScopeMode::PublishedOnly => Some(truncate_to_minute(now)),
        }
    }
}

/// RAII scope; exits on drop on every path, including unwinding.
pub struct ScopeGuard<'a> {
    ctx: &'a mut PublicationContext,
    depth: usize,
}

impl Deref for ScopeGuard<'_> {
    type Target = PublicationContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // Drops anything entered inside this scope that was never exited.
        self.ctx.stack.truncate(self.depth.saturating_sub(1));
    }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::minutes(1)).unwrap_or(at)
}

/// Set-based form of the visibility rule, evaluated as an anti-join over a
/// loaded table: a node is live when it passes the base predicate and no
/// canonical node strictly containing it (in the same group, or ungrouped)
/// fails it.
pub struct LiveFilter<'a> {
    at: DateTime<Utc>,
    canonical: HashMap<NodeId, Bounds>,
    // canonical nodes failing the base predicate, sorted by left bound
    blockers: Vec<(Bounds, Option<&'a str>)>,
}

impl<'a> LiveFilter<'a> {
    pub fn new<I>(table: I, at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a Node>,
    {
        let mut canonical = HashMap::new();
        let mut blockers = Vec::new();
        for node in table {
            let Some(bounds) = node.bounds() else {
                continue;
            };
            canonical.insert(node.id, bounds);
            if !node.publication.is_publishable(at) {
                blockers.push((bounds, node.group_key.as_deref()));
            }
        }
        blockers.sort_by_key(|(bounds, _)| bounds.left);
        Self {
            at,
            canonical,
            blockers,
        }
    }

    /// Interval used for the ancestor check: a draft stands in for its
    /// owner's current position, never for its own snapshot, unless the owner
    /// is gone.
    pub fn effective_bounds(&self, node: &Node) -> Bounds {
        match node.owner() {
            Some(owner) => self
                .canonical
                .get(&owner)
                .copied()
                .unwrap_or_else(|| node.stored_bounds()),
            None => node.stored_bounds(),
        }
    }

    pub fn is_live(&self, node: &Node) -> bool {
        if !node.publication.is_publishable(self.at) {
            return false;
        }
        let inner = self.effective_bounds(node);
        let group = node.group_key.as_deref();
        !self
            .blockers
            .iter()
            .take_while(|(bounds, _)| bounds.left < inner.left)
            .any(|(bounds, blocker_group)| {
                bounds.right > inner.right && blocker_applies(*blocker_group, group)
            })
    }
}

/// An ancestor only gates a node when it is ungrouped or in the node's group.
pub fn blocker_applies(ancestor_group: Option<&str>, node_group: Option<&str>) -> bool {
    match ancestor_group {
        None => true,
        Some(group) => node_group == Some(group),
    }
}
