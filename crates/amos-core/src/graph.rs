//! Milestone dependency graph and state machine.
//!
//! The node set is fixed at load time; an edge means "must reach Passed
//! before I can start". States move `NotStarted -> Running -> {Passed |
//! Failed}` via explicit single-step transitions only. The graph itself
//! never detects cycles; it exposes `ready_nodes()` + `incomplete()` and
//! the scheduler's liveness guard turns a stalled graph into a deterministic
//! deadlock report.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::MilestoneSpec;

/// Lifecycle state of one milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MilestoneState {
    NotStarted,
    Running,
    Passed,
    Failed,
}

impl MilestoneState {
    /// Passed and Failed are terminal; a terminal node never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MilestoneState::Passed | MilestoneState::Failed)
    }
}

/// Errors produced by graph construction and state transitions.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown milestone: {0}")]
    UnknownMilestone(String),

    #[error("duplicate milestone id: {0}")]
    DuplicateId(String),

    #[error("milestone {id} depends on unknown milestone {dependency}")]
    UnknownDependency { id: String, dependency: String },

    #[error("illegal transition for milestone {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: MilestoneState,
        to: MilestoneState,
    },
}

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// One milestone node: spec fields plus lifecycle state.
#[derive(Debug, Clone)]
pub struct Milestone {
    pub id: String,
    pub goal: String,
    pub dependencies: Vec<String>,
    state: MilestoneState,
}

impl Milestone {
    pub fn state(&self) -> MilestoneState {
        self.state
    }
}

/// Fixed-node milestone graph with explicit state transitions.
#[derive(Debug)]
pub struct MilestoneGraph {
    nodes: HashMap<String, Milestone>,
    /// Insertion order, for deterministic iteration and reporting.
    order: Vec<String>,
}

impl MilestoneGraph {
    /// Build a graph from milestone definitions.
    ///
    /// Validates unique ids and that every dependency names a known
    /// milestone. An empty spec list yields an empty, already-complete graph.
    /// Cyclic definitions are accepted here; they surface as a scheduler
    /// deadlock, not a silent stall.
    pub fn from_specs(specs: Vec<MilestoneSpec>) -> GraphResult<Self> {
        let known: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        if known.len() != specs.len() {
            let mut seen = HashSet::new();
            for spec in &specs {
                if !seen.insert(spec.id.as_str()) {
                    return Err(GraphError::DuplicateId(spec.id.clone()));
                }
            }
        }
        for spec in &specs {
            for dep in &spec.dependencies {
                if !known.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        id: spec.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();
        let nodes = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.id.clone(),
                    Milestone {
                        id: spec.id,
                        goal: spec.goal,
                        dependencies: spec.dependencies,
                        state: MilestoneState::NotStarted,
                    },
                )
            })
            .collect();

        Ok(Self { nodes, order })
    }

    /// NotStarted nodes whose every dependency is Passed, in definition order.
    pub fn ready_nodes(&self) -> Vec<&Milestone> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| {
                node.state == MilestoneState::NotStarted
                    && node.dependencies.iter().all(|dep| {
                        self.nodes
                            .get(dep)
                            .map(|d| d.state == MilestoneState::Passed)
                            .unwrap_or(false)
                    })
            })
            .collect()
    }

    pub fn mark_running(&mut self, id: &str) -> GraphResult<()> {
        self.transition(id, MilestoneState::Running)
    }

    pub fn mark_passed(&mut self, id: &str) -> GraphResult<()> {
        self.transition(id, MilestoneState::Passed)
    }

    pub fn mark_failed(&mut self, id: &str) -> GraphResult<()> {
        self.transition(id, MilestoneState::Failed)
    }

    /// `true` while any node is non-terminal.
    pub fn incomplete(&self) -> bool {
        self.nodes.values().any(|node| !node.state.is_terminal())
    }

    pub fn state(&self, id: &str) -> Option<MilestoneState> {
        self.nodes.get(id).map(|node| node.state)
    }

    /// All milestones in definition order.
    pub fn milestones(&self) -> impl Iterator<Item = &Milestone> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Ids of nodes that have not reached a terminal state, in definition
    /// order. Used for deadlock diagnostics.
    pub fn non_terminal_ids(&self) -> Vec<String> {
        self.milestones()
            .filter(|node| !node.state.is_terminal())
            .map(|node| node.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Single-step transition with precondition checks. Re-marking a
    /// terminal node or skipping Running is a programmer error, fatal to
    /// the call.
    fn transition(&mut self, id: &str, to: MilestoneState) -> GraphResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownMilestone(id.to_string()))?;

        let legal = matches!(
            (node.state, to),
            (MilestoneState::NotStarted, MilestoneState::Running)
                | (MilestoneState::Running, MilestoneState::Passed)
                | (MilestoneState::Running, MilestoneState::Failed)
        );
        if !legal {
            return Err(GraphError::IllegalTransition {
                id: id.to_string(),
                from: node.state,
                to,
            });
        }
        node.state = to;
        Ok(())
    }
}
