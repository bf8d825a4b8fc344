//! Bounded-round consensus: reduce a panel's proposals to one decision.
//!
//! Per round every panelist is asked the same issue plus the accumulated
//! history, concurrently. The round completes only once every panelist has
//! answered; the session wall-clock budget is enforced around the fan-in, so
//! a round is all-or-nothing and no individual panelist is ever skipped.
//! Majority always decides within a round; unanimity may take several, and
//! running out of rounds is a normal outcome, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::trace::{emit, NoopTracer, Tracer};

/// A panelist's answer. Compared verbatim by the decision rules.
pub type Proposal = String;

/// External agent capability: anything that can produce a proposal from an
/// issue and the debate so far. The orchestration core depends only on this
/// contract.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable display name, used in diagnostics.
    fn name(&self) -> &str;

    /// Produce a proposal for `issue`, given the accumulated rounds.
    async fn propose(&self, issue: &str, history: &[DebateRound]) -> anyhow::Result<Proposal>;
}

impl std::fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("name", &self.name()).finish()
    }
}

/// One completed round: every panelist's proposal, in panel order.
#[derive(Debug, Clone, Serialize)]
pub struct DebateRound {
    pub proposals: Vec<Proposal>,
}

/// How a round's proposals reduce to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRule {
    /// Most frequent proposal wins; ties break to the first-encountered value.
    Majority,
    /// Decide only when every answer in the round is identical.
    Unanimous,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct DebateConfig {
    /// Maximum rounds before the session returns a null decision. Must be >= 1.
    pub rounds: usize,
    pub rule: DecisionRule,
    /// Wall-clock budget for the whole session.
    pub timeout: Option<Duration>,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            rule: DecisionRule::Majority,
            timeout: None,
        }
    }
}

/// Errors that abort a debate session.
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    /// The session wall-clock budget elapsed before the current round
    /// completed. Fatal to the whole session, never a per-panelist skip.
    #[error("debate session timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    #[error("debate panel is empty")]
    EmptyPanel,

    #[error("invalid debate configuration: {0}")]
    InvalidConfig(String),

    #[error("panelist {name} failed: {source}")]
    PanelistFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Result type for debate operations.
pub type DebateResult<T> = std::result::Result<T, DebateError>;

/// Session outcome. `decision: None` after R rounds without consensus is a
/// normal result, distinct from [`DebateError::Timeout`].
#[derive(Debug, Clone)]
pub struct DebateOutcome {
    pub decision: Option<Proposal>,
    pub history: Vec<DebateRound>,
}

/// Bump an even participant count to the next odd size (minimum 1), so a
/// two-option majority vote cannot top-tie.
pub fn ensure_odd_panel(requested: usize) -> usize {
    if requested % 2 == 0 {
        requested + 1
    } else {
        requested
    }
}

/// Runs debate sessions over a fixed panel.
pub struct DebateEngine {
    config: DebateConfig,
    tracer: Arc<dyn Tracer>,
}

impl DebateEngine {
    pub fn new(config: DebateConfig) -> Self {
        Self {
            config,
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn with_tracer(config: DebateConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self { config, tracer }
    }

    /// Run up to `rounds` rounds over `panel` and reduce to a decision.
    #[instrument(skip(self, panel), fields(panel = panel.len(), rounds = self.config.rounds))]
    pub async fn run(&self, issue: &str, panel: &[Arc<dyn Agent>]) -> DebateResult<DebateOutcome> {
        if panel.is_empty() {
            return Err(DebateError::EmptyPanel);
        }
        if self.config.rounds == 0 {
            return Err(DebateError::InvalidConfig(
                "rounds must be >= 1".to_string(),
            ));
        }

        let started = Instant::now();
        let mut history: Vec<DebateRound> = Vec::new();

        for round in 1..=self.config.rounds {
            let proposals = self.collect_round(issue, panel, &history, started).await?;
            debug!(round, ?proposals, "debate round complete");
            emit::event(
                self.tracer.as_ref(),
                "debate_round",
                json!({ "round": round, "proposals": &proposals }),
                None,
                None,
            );

            let decision = decide(self.config.rule, &proposals);
            history.push(DebateRound { proposals });

            if let Some(decision) = decision {
                info!(round, %decision, "debate reached a decision");
                emit::event(
                    self.tracer.as_ref(),
                    "debate_choice",
                    json!({ "decision": &decision, "rounds_used": round }),
                    None,
                    None,
                );
                return Ok(DebateOutcome {
                    decision: Some(decision),
                    history,
                });
            }
        }

        info!(rounds = self.config.rounds, "debate ended without consensus");
        emit::event(
            self.tracer.as_ref(),
            "debate_no_consensus",
            json!({ "rounds_completed": self.config.rounds }),
            None,
            None,
        );
        Ok(DebateOutcome {
            decision: None,
            history,
        })
    }

    /// Fan out one round to every panelist and fan back in. The remaining
    /// session budget bounds the whole round; on expiry the round is
    /// abandoned wholesale.
    async fn collect_round(
        &self,
        issue: &str,
        panel: &[Arc<dyn Agent>],
        history: &[DebateRound],
        started: Instant,
    ) -> DebateResult<Vec<Proposal>> {
        let fan_in = future::join_all(panel.iter().map(|agent| agent.propose(issue, history)));

        let answers = match self.config.timeout {
            Some(budget) => {
                let timeout_err = || DebateError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    budget_ms: budget.as_millis() as u64,
                };
                let remaining = budget
                    .checked_sub(started.elapsed())
                    .ok_or_else(timeout_err)?;
                tokio::time::timeout(remaining, fan_in)
                    .await
                    .map_err(|_| timeout_err())?
            }
            None => fan_in.await,
        };

        answers
            .into_iter()
            .zip(panel)
            .map(|(answer, agent)| {
                answer.map_err(|source| DebateError::PanelistFailed {
                    name: agent.name().to_string(),
                    source,
                })
            })
            .collect()
    }
}

/// Apply a decision rule to one round's proposals.
fn decide(rule: DecisionRule, proposals: &[Proposal]) -> Option<Proposal> {
    match rule {
        DecisionRule::Majority => {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            let mut first_seen: Vec<&str> = Vec::new();
            for proposal in proposals {
                let count = counts.entry(proposal.as_str()).or_insert(0);
                if *count == 0 {
                    first_seen.push(proposal.as_str());
                }
                *count += 1;
            }
            let best = counts.values().copied().max()?;
            first_seen
                .into_iter()
                .find(|p| counts[p] == best)
                .map(str::to_string)
        }
        DecisionRule::Unanimous => {
            let first = proposals.first()?;
            proposals
                .iter()
                .all(|p| p == first)
                .then(|| first.clone())
        }
    }
}
