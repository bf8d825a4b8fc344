//! AMOS Core Library
//!
//! Orchestrates many independent automated agents cooperating on a tree of
//! interdependent milestones: a dependency-graph scheduler running work in
//! isolated, mergeable sandboxes under bounded parallelism, a race-safe
//! append-only budget ledger with atomic admission control, and a
//! bounded-round consensus protocol for multi-party decisions.

pub mod config;
pub mod debate;
pub mod graph;
pub mod identity;
pub mod ledger;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod telemetry;
pub mod trace;

pub use config::{
    cap_table, load_milestones, load_roles, ConfigError, ConfigResult, MilestoneSpec, RoleCaps,
    RoleSpec, RoleTable,
};

pub use debate::{
    ensure_odd_panel, Agent, DebateConfig, DebateEngine, DebateError, DebateOutcome, DebateResult,
    DebateRound, DecisionRule, Proposal,
};

pub use graph::{GraphError, GraphResult, Milestone, MilestoneGraph, MilestoneState};

pub use identity::{AgentIdentity, ExecutionContext};

pub use ledger::{BudgetLedger, LedgerError, LedgerResult, UsageRecord, UsageTotals};

pub use registry::{
    AgentKind, MilestoneRunError, MilestoneRunner, RegistryError, RegistryResult, RoleProfile,
    RoleRegistry, ScriptedAgent,
};

pub use sandbox::{create_sandbox, merge_sandbox, remove_sandbox, MergeError, MergeResult};

pub use scheduler::{
    MilestoneOutcome, ParallelScheduler, RunReport, SchedulerConfig, SchedulerError,
    SchedulerResult,
};

pub use telemetry::init_tracing;

pub use trace::{
    emit, FailingTracer, NoopTracer, RecordedEvent, RecordingTracer, SpanId, TraceResult, Tracer,
};

/// AMOS version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
