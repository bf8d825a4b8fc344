//! Agent identity and execution-context plumbing.
//!
//! Every logical unit of work carries an explicit, read-only
//! `(identity, role)` binding established once at spawn time and cloned into
//! everything the unit calls. Spawning N concurrent children from one parent
//! yields N independent contexts, so a usage-logging call can never attribute
//! cost to a sibling regardless of task interleaving.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identity of one spawned agent instance.
///
/// The identity is the accounting key for budget-cap enforcement. Two
/// instances of the same role always get distinct identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity(String);

impl AgentIdentity {
    /// Mint a fresh identity for an instance of `role` (`<role>-<8 hex>`).
    pub fn spawn(role: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        AgentIdentity(format!("{role}-{}", &suffix[..8]))
    }

    /// Use the role name itself as the identity (role-level aggregation).
    pub fn from_role(role: &str) -> Self {
        AgentIdentity(role.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only `(identity, role)` binding threaded through child tasks.
///
/// Contexts are immutable after construction; `Clone` hands a child its own
/// copy rather than a shared mutable cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    identity: AgentIdentity,
    role: String,
}

impl ExecutionContext {
    pub fn new(identity: AgentIdentity, role: impl Into<String>) -> Self {
        Self {
            identity,
            role: role.into(),
        }
    }

    /// Context for a freshly spawned instance of `role`.
    pub fn spawn(role: &str) -> Self {
        Self::new(AgentIdentity::spawn(role), role)
    }

    /// Fallback context for calls made with no established identity: the
    /// role name itself becomes the accounting key. Never a hard failure.
    pub fn role_level(role: &str) -> Self {
        Self::new(AgentIdentity::from_role(role), role)
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}
