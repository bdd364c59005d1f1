//! Access policy model.
//!
//! The tree never enforces a policy itself. A higher layer asks
//! [`AccessPolicy::is_allowed`] before it mutates.

use crate::node::NodeId;
use crate::tree::Tree;
use canopy_core::ReplicaId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica pattern matching every replica.
pub const WILDCARD: &str = "*";

/// A mutation class checked against the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Modify,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Add => "add",
            Action::Modify => "modify",
            Action::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// What a rule grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grant {
    Add,
    Modify,
    Remove,
    #[serde(rename = "*")]
    All,
}

impl Grant {
    pub fn covers(self, action: Action) -> bool {
        matches!(
            (self, action),
            (Grant::All, _)
                | (Grant::Add, Action::Add)
                | (Grant::Modify, Action::Modify)
                | (Grant::Remove, Action::Remove)
        )
    }
}

impl From<Action> for Grant {
    fn from(action: Action) -> Self {
        match action {
            Action::Add => Grant::Add,
            Action::Modify => Grant::Modify,
            Action::Remove => Grant::Remove,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    /// A replica id, or [`WILDCARD`].
    pub replica: String,
    pub grant: Grant,
    pub target: NodeId,
    /// Also cover every descendant of `target`.
    #[serde(default)]
    pub recursive: bool,
}

impl AccessRule {
    fn applies_to(&self, tree: &Tree, replica: &ReplicaId, action: Action, node: &NodeId) -> bool {
        (self.replica == WILDCARD || self.replica == replica.as_str())
            && self.grant.covers(action)
            && (&self.target == node || (self.recursive && tree.is_descendant(&self.target, node)))
    }
}

/// Allow-list of access rules. Anything not granted is denied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    rules: Vec<AccessRule>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `grant` on `target` to `replica` (or [`WILDCARD`]).
    pub fn allow(
        &mut self,
        replica: impl Into<String>,
        grant: Grant,
        target: NodeId,
        recursive: bool,
    ) -> &mut Self {
        let rule = AccessRule {
            replica: replica.into(),
            grant,
            target,
            recursive,
        };
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    /// Remove every rule granting `grant` on `target` to `replica`.
    /// Returns the number of rules removed.
    pub fn revoke(&mut self, replica: &str, grant: Grant, target: &NodeId) -> usize {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.replica == replica && r.grant == grant && &r.target == target));
        before - self.rules.len()
    }

    pub fn rules(&self) -> &[AccessRule] {
        &self.rules
    }

    pub fn is_allowed(&self, tree: &Tree, replica: &ReplicaId, action: Action, node: &NodeId) -> bool {
        let allowed = self
            .rules
            .iter()
            .any(|rule| rule.applies_to(tree, replica, action, node));
        if !allowed {
            tracing::debug!(%replica, %action, node_id = %node, "access denied");
        }
        allowed
    }
}
