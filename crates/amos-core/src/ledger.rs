//! Append-only JSONL budget ledger with atomic admission control.
//!
//! Each record is one UTF-8 line:
//! `{"ts":"2026-08-07T17:34:11Z","role":"technomancer","agent":"technomancer-1a2b3c4d","tokens":579,"cost":0.0023}`
//!
//! The file is created on demand and every admission check runs inside one
//! exclusive critical section scoped to the store, a true compare-and-commit.
//! Two concurrent spenders on the same identity can never both observe a
//! stale total and both succeed past the cap. Diagnostic reads take the
//! shared lock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RoleCaps;
use crate::identity::ExecutionContext;

/// Errors produced by the budget ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The proposed spend would push the identity past its role cap.
    /// Expected and recoverable, never process-fatal.
    #[error(
        "agent {agent} (role {role}) over budget: cumulative ${attempted_cost:.6} / {attempted_tokens} tokens would exceed cap (dollar_cap={dollar_cap:?}, token_cap={token_cap:?})"
    )]
    OverBudget {
        agent: String,
        role: String,
        /// Cumulative cost the rejected call would have reached.
        attempted_cost: f64,
        /// Cumulative tokens the rejected call would have reached.
        attempted_tokens: u64,
        dollar_cap: Option<f64>,
        token_cap: Option<u64>,
    },

    #[error("usage amounts must be non-negative: cost {cost}")]
    NegativeAmount { cost: f64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// One immutable usage record, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// RFC 3339 UTC timestamp with trailing `Z`.
    pub ts: String,
    pub role: String,
    pub agent: String,
    pub tokens: u64,
    pub cost: f64,
    /// Caller-supplied custom fields, flattened into the record.
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Aggregate spend for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug)]
struct LedgerState {
    file: File,
    /// Cumulative spend keyed by agent identity, kept in lockstep with the
    /// file so admission never re-reads the whole log.
    totals: HashMap<String, UsageTotals>,
}

/// Durable, admission-controlled usage ledger.
#[derive(Debug)]
pub struct BudgetLedger {
    path: PathBuf,
    caps: HashMap<String, RoleCaps>,
    state: RwLock<LedgerState>,
}

impl BudgetLedger {
    /// Open (or create) the ledger at `path` with the given role cap table.
    ///
    /// Existing records are replayed to seed the in-memory totals, so caps
    /// carry across restarts. Unparseable lines are skipped with a warning,
    /// matching the append-only promise that one bad line never poisons the
    /// store.
    pub fn open(path: impl AsRef<Path>, caps: HashMap<String, RoleCaps>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut totals: HashMap<String, UsageTotals> = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<UsageRecord>(&line) {
                    Ok(record) => {
                        let entry = totals.entry(record.agent.clone()).or_default();
                        entry.tokens += record.tokens;
                        entry.cost += record.cost;
                    }
                    Err(error) => {
                        warn!(path = %path.display(), lineno, %error, "skipping unparseable ledger line");
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), identities = totals.len(), "ledger opened");

        Ok(Self {
            path,
            caps,
            state: RwLock::new(LedgerState { file, totals }),
        })
    }

    /// Path of the backing JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record unconditionally (for roles with no cap).
    pub async fn append(
        &self,
        ctx: &ExecutionContext,
        tokens: u64,
        cost: f64,
        extra: Map<String, Value>,
    ) -> LedgerResult<()> {
        if cost < 0.0 {
            return Err(LedgerError::NegativeAmount { cost });
        }
        let mut state = self.state.write().await;
        Self::commit(&mut state, ctx, tokens, cost, extra)
    }

    /// Atomic admission check plus append.
    ///
    /// Computes the identity's cumulative spend, adds the proposed amount,
    /// and rejects with [`LedgerError::OverBudget`], writing nothing, if
    /// the post-call total would exceed either of the role's caps. Spending
    /// exactly to a cap succeeds. The entire read-compute-write sequence
    /// holds the store's exclusive lock.
    pub async fn check_and_append(
        &self,
        ctx: &ExecutionContext,
        tokens: u64,
        cost: f64,
        extra: Map<String, Value>,
    ) -> LedgerResult<()> {
        if cost < 0.0 {
            return Err(LedgerError::NegativeAmount { cost });
        }
        let caps = self.caps.get(ctx.role()).copied().unwrap_or_default();

        let mut state = self.state.write().await;

        let current = state
            .totals
            .get(ctx.identity().as_str())
            .copied()
            .unwrap_or_default();
        let attempted_tokens = current.tokens + tokens;
        let attempted_cost = current.cost + cost;

        let over_dollars = caps.dollar_cap.is_some_and(|cap| attempted_cost > cap);
        let over_tokens = caps.token_cap.is_some_and(|cap| attempted_tokens > cap);
        if over_dollars || over_tokens {
            return Err(LedgerError::OverBudget {
                agent: ctx.identity().as_str().to_string(),
                role: ctx.role().to_string(),
                attempted_cost,
                attempted_tokens,
                dollar_cap: caps.dollar_cap,
                token_cap: caps.token_cap,
            });
        }

        Self::commit(&mut state, ctx, tokens, cost, extra)
    }

    /// Diagnostic aggregate read for one identity (shared lock).
    pub async fn totals(&self, agent: &str) -> UsageTotals {
        let state = self.state.read().await;
        state.totals.get(agent).copied().unwrap_or_default()
    }

    /// Write one whole line and update the cached totals. Caller holds the
    /// exclusive lock.
    fn commit(
        state: &mut LedgerState,
        ctx: &ExecutionContext,
        tokens: u64,
        cost: f64,
        extra: Map<String, Value>,
    ) -> LedgerResult<()> {
        let record = UsageRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            role: ctx.role().to_string(),
            agent: ctx.identity().as_str().to_string(),
            tokens,
            cost,
            extra,
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;

        let entry = state
            .totals
            .entry(record.agent)
            .or_default();
        entry.tokens += tokens;
        entry.cost += cost;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capped(role: &str, dollars: Option<f64>, tokens: Option<u64>) -> HashMap<String, RoleCaps> {
        let mut caps = HashMap::new();
        caps.insert(
            role.to_string(),
            RoleCaps {
                dollar_cap: dollars,
                token_cap: tokens,
            },
        );
        caps
    }

    fn open_ledger(dir: &tempfile::TempDir, caps: HashMap<String, RoleCaps>) -> BudgetLedger {
        BudgetLedger::open(dir.path().join("usage.jsonl"), caps).unwrap()
    }

    #[tokio::test]
    async fn test_spending_exactly_to_the_cap_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, capped("worker", Some(10.0), None));
        let ctx = ExecutionContext::spawn("worker");

        ledger
            .check_and_append(&ctx, 100, 10.0, Map::new())
            .await
            .unwrap();
        assert_eq!(ledger.totals(ctx.identity().as_str()).await.cost, 10.0);
    }

    #[tokio::test]
    async fn test_crossing_the_cap_rejects_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, capped("worker", Some(10.0), None));
        let ctx = ExecutionContext::spawn("worker");

        ledger
            .check_and_append(&ctx, 100, 9.99, Map::new())
            .await
            .unwrap();
        let err = ledger
            .check_and_append(&ctx, 10, 0.02, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OverBudget { .. }));

        // The rejected call left no trace: totals and file both unchanged.
        assert_eq!(ledger.totals(ctx.identity().as_str()).await.cost, 9.99);
        let lines = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_any_spend_past_an_exhausted_cap_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, capped("worker", Some(10.0), None));
        let ctx = ExecutionContext::spawn("worker");

        ledger
            .check_and_append(&ctx, 0, 10.0, Map::new())
            .await
            .unwrap();
        let err = ledger
            .check_and_append(&ctx, 0, 0.000001, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OverBudget { .. }));
    }

    #[tokio::test]
    async fn test_token_cap_enforced_independently_of_dollars() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, capped("worker", None, Some(1_000)));
        let ctx = ExecutionContext::spawn("worker");

        ledger
            .check_and_append(&ctx, 1_000, 0.0, Map::new())
            .await
            .unwrap();
        let err = ledger
            .check_and_append(&ctx, 1, 0.0, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OverBudget { .. }));
    }

    #[tokio::test]
    async fn test_uncapped_role_appends_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, HashMap::new());
        let ctx = ExecutionContext::role_level("narrator");

        for _ in 0..3 {
            ledger
                .check_and_append(&ctx, 1_000_000, 100.0, Map::new())
                .await
                .unwrap();
        }
        let totals = ledger.totals("narrator").await;
        assert_eq!(totals.tokens, 3_000_000);
    }

    #[tokio::test]
    async fn test_negative_cost_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, HashMap::new());
        let ctx = ExecutionContext::role_level("worker");

        let err = ledger
            .append(&ctx, 0, -0.5, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeAmount { .. }));
    }

    #[tokio::test]
    async fn test_extra_fields_are_flattened_into_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, HashMap::new());
        let ctx = ExecutionContext::role_level("worker");

        let mut extra = Map::new();
        extra.insert("tool".to_string(), Value::String("web_search".to_string()));
        ledger.append(&ctx, 10, 0.01, extra).await.unwrap();

        let line = std::fs::read_to_string(ledger.path()).unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["tool"], "web_search");
        assert_eq!(value["agent"], "worker");
    }

    #[tokio::test]
    async fn test_reopen_replays_totals_and_keeps_enforcing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        let caps = capped("worker", Some(5.0), None);
        let ctx = ExecutionContext::role_level("worker");

        {
            let ledger = BudgetLedger::open(&path, caps.clone()).unwrap();
            ledger
                .check_and_append(&ctx, 10, 4.0, Map::new())
                .await
                .unwrap();
        }

        let reopened = BudgetLedger::open(&path, caps).unwrap();
        assert_eq!(reopened.totals("worker").await.cost, 4.0);
        let err = reopened
            .check_and_append(&ctx, 10, 2.0, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OverBudget { .. }));
    }

    #[tokio::test]
    async fn test_unparseable_lines_are_skipped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        std::fs::write(&path, "not json at all\n").unwrap();

        let ledger = BudgetLedger::open(&path, HashMap::new()).unwrap();
        let ctx = ExecutionContext::role_level("worker");
        ledger.append(&ctx, 1, 0.0, Map::new()).await.unwrap();
        assert_eq!(ledger.totals("worker").await.tokens, 1);
    }

    #[tokio::test]
    async fn test_over_budget_diagnostic_names_agent_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir, capped("worker", Some(1.0), None));
        let ctx = ExecutionContext::spawn("worker");

        let err = ledger
            .check_and_append(&ctx, 0, 2.0, Map::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains(ctx.identity().as_str()));
        assert!(message.contains("2.0"));
        assert!(message.contains("1.0"));
    }
}
