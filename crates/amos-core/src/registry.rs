//! Role registry, static agent factory, and the debate-backed milestone
//! runner.
//!
//! The registry is an explicitly constructed object, built once at startup
//! from the role table and passed to whoever needs it. There is no ambient
//! global lookup, and no runtime type synthesis: a role name maps to a
//! config record plus a concrete [`Agent`] implementation selected by a
//! static factory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;
use tracing::{debug, instrument};

use crate::config::{RoleCaps, RoleTable};
use crate::debate::{
    ensure_odd_panel, Agent, DebateConfig, DebateEngine, DebateError, DebateRound, DecisionRule,
    Proposal,
};
use crate::identity::ExecutionContext;
use crate::ledger::BudgetLedger;
use crate::trace::{NoopTracer, Tracer};

/// Errors produced by registry lookups and agent construction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("role {role} names unknown agent kind: {kind}")]
    UnknownKind { role: String, kind: String },
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Concrete agent implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Built-in deterministic agent: cycles canned answers (or echoes the
    /// issue) and charges fixed usage per call.
    Scripted,
}

impl AgentKind {
    fn parse(role: &str, kind: &str) -> RegistryResult<Self> {
        match kind {
            "scripted" => Ok(AgentKind::Scripted),
            other => Err(RegistryError::UnknownKind {
                role: role.to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

/// Resolved per-role configuration record.
#[derive(Debug, Clone)]
pub struct RoleProfile {
    pub name: String,
    pub prompt: String,
    pub caps: RoleCaps,
    pub debate_rounds: usize,
    pub kind: AgentKind,
    pub answers: Vec<String>,
    pub tokens_per_call: u64,
    pub cost_per_call: f64,
}

/// Role table resolved against the static agent factory, plus the shared
/// ledger every spawned agent charges against.
#[derive(Debug)]
pub struct RoleRegistry {
    profiles: std::collections::HashMap<String, RoleProfile>,
    ledger: Arc<BudgetLedger>,
}

impl RoleRegistry {
    /// Resolve a loaded role table. Unknown agent kinds fail here, at
    /// startup, rather than at first spawn.
    pub fn from_table(table: &RoleTable, ledger: Arc<BudgetLedger>) -> RegistryResult<Self> {
        let mut profiles = std::collections::HashMap::new();
        for (name, spec) in table {
            let kind = AgentKind::parse(name, &spec.kind)?;
            profiles.insert(
                name.clone(),
                RoleProfile {
                    name: name.clone(),
                    prompt: spec.prompt.clone(),
                    caps: spec.caps,
                    debate_rounds: spec.debate_rounds,
                    kind,
                    answers: spec.answers.clone(),
                    tokens_per_call: spec.tokens_per_call,
                    cost_per_call: spec.cost_per_call,
                },
            );
        }
        Ok(Self { profiles, ledger })
    }

    pub fn profile(&self, role: &str) -> Option<&RoleProfile> {
        self.profiles.get(role)
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Build a live agent instance of `role` with a fresh identity.
    pub fn spawn(&self, role: &str) -> RegistryResult<Arc<dyn Agent>> {
        let profile = self
            .profiles
            .get(role)
            .ok_or_else(|| RegistryError::UnknownRole(role.to_string()))?;

        let ctx = ExecutionContext::spawn(role);
        debug!(role, identity = %ctx.identity(), "agent spawned");
        match profile.kind {
            AgentKind::Scripted => Ok(Arc::new(ScriptedAgent::new(
                ctx,
                profile,
                Arc::clone(&self.ledger),
            ))),
        }
    }
}

/// Deterministic built-in agent.
///
/// Every `propose` call first charges the role's per-call usage against the
/// ledger through this instance's own context, so budget caps bite exactly
/// like they would for a live model call.
pub struct ScriptedAgent {
    ctx: ExecutionContext,
    answers: Vec<String>,
    tokens_per_call: u64,
    cost_per_call: f64,
    ledger: Arc<BudgetLedger>,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(ctx: ExecutionContext, profile: &RoleProfile, ledger: Arc<BudgetLedger>) -> Self {
        Self {
            ctx,
            answers: profile.answers.clone(),
            tokens_per_call: profile.tokens_per_call,
            cost_per_call: profile.cost_per_call,
            ledger,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        self.ctx.identity().as_str()
    }

    async fn propose(&self, issue: &str, _history: &[DebateRound]) -> anyhow::Result<Proposal> {
        self.ledger
            .check_and_append(&self.ctx, self.tokens_per_call, self.cost_per_call, Map::new())
            .await?;

        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if self.answers.is_empty() {
            Ok(issue.to_string())
        } else {
            Ok(self.answers[call % self.answers.len()].clone())
        }
    }
}

/// Errors produced while running one milestone's consensus session.
#[derive(Debug, thiserror::Error)]
pub enum MilestoneRunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Debate(#[from] DebateError),
}

/// Runs one milestone's issue through a debate among freshly spawned
/// panelists. Behavior is composed over the registry, never attached to
/// existing types at runtime.
pub struct MilestoneRunner {
    registry: Arc<RoleRegistry>,
    panel_role: String,
    config: DebateConfig,
    tracer: Arc<dyn Tracer>,
}

impl MilestoneRunner {
    /// `panel_role` is the role spawned for every panelist; its profile
    /// supplies the round budget.
    pub fn new(registry: Arc<RoleRegistry>, panel_role: &str) -> RegistryResult<Self> {
        let profile = registry
            .profile(panel_role)
            .ok_or_else(|| RegistryError::UnknownRole(panel_role.to_string()))?;
        let config = DebateConfig {
            rounds: profile.debate_rounds,
            ..DebateConfig::default()
        };
        Ok(Self {
            registry,
            panel_role: panel_role.to_string(),
            config,
            tracer: Arc::new(NoopTracer),
        })
    }

    pub fn with_rule(mut self, rule: DecisionRule) -> Self {
        self.config.rule = rule;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Debate `issue` among `participant_count` fresh panelists (bumped to
    /// the next odd size) and return the decision, if any.
    #[instrument(skip(self), fields(role = %self.panel_role))]
    pub async fn run_milestone(
        &self,
        issue: &str,
        participant_count: usize,
    ) -> std::result::Result<Option<Proposal>, MilestoneRunError> {
        let count = ensure_odd_panel(participant_count);
        let panel: Vec<Arc<dyn Agent>> = (0..count)
            .map(|_| self.registry.spawn(&self.panel_role))
            .collect::<RegistryResult<_>>()?;

        let engine = DebateEngine::with_tracer(self.config.clone(), Arc::clone(&self.tracer));
        let outcome = engine.run(issue, &panel).await?;
        Ok(outcome.decision)
    }
}
