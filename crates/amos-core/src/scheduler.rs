//! Parallel milestone scheduler.
//!
//! Drives the dependency graph to completion with bounded concurrency,
//! sandbox isolation, and conservative merge. The caller injects the
//! per-milestone worker as an async closure; inject a deterministic stub in
//! tests and the real agent runtime in production.
//!
//! No per-milestone failure kind escapes the control loop: task errors,
//! budget exhaustion, debate timeouts, panics, and merge conflicts all
//! become a Failed transition. The only fatal conditions are a graph that
//! can no longer make progress (deadlock) and illegal state transitions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::graph::{GraphError, Milestone, MilestoneGraph, MilestoneState};
use crate::sandbox::{self, MergeError};

/// Errors that terminate a scheduler run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The graph is incomplete but nothing is ready and nothing is running:
    /// a dependency cycle, or every path forward behind a Failed node.
    /// Reported deterministically instead of hanging.
    #[error("scheduler deadlock: no runnable work while milestones remain incomplete: {remaining:?}")]
    Deadlock { remaining: Vec<String> },

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

fn default_max_parallel() -> usize {
    4
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The shared workspace sandboxes are cloned from and merged into.
    pub root_workspace: PathBuf,
    /// Maximum concurrently running milestone tasks.
    pub max_parallel: usize,
}

impl SchedulerConfig {
    pub fn new(root_workspace: impl Into<PathBuf>) -> Self {
        Self {
            root_workspace: root_workspace.into(),
            max_parallel: default_max_parallel(),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

/// Final state of one milestone after a run.
#[derive(Debug, Clone)]
pub struct MilestoneOutcome {
    pub id: String,
    pub state: MilestoneState,
    /// Diagnostic payload of the originating failure, when the milestone
    /// failed.
    pub failure: Option<String>,
}

/// Per-milestone outcomes for a completed run, in definition order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<MilestoneOutcome>,
}

impl RunReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.state == MilestoneState::Passed)
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == MilestoneState::Passed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == MilestoneState::Failed)
            .count()
    }

    pub fn state_of(&self, id: &str) -> Option<MilestoneState> {
        self.outcomes
            .iter()
            .find(|o| o.id == id)
            .map(|o| o.state)
    }
}

struct TaskOutput {
    id: String,
    sandbox: Option<PathBuf>,
    result: anyhow::Result<()>,
}

/// Drives a [`MilestoneGraph`] to completion under bounded parallelism.
pub struct ParallelScheduler {
    graph: MilestoneGraph,
    config: SchedulerConfig,
    /// Serializes every root-workspace read/write: sandbox creation and the
    /// whole conflict-check-plus-copy of each merge run as atomic regions.
    merge_lock: Arc<Mutex<()>>,
}

impl ParallelScheduler {
    pub fn new(graph: MilestoneGraph, config: SchedulerConfig) -> Self {
        Self {
            graph,
            config,
            merge_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn graph(&self) -> &MilestoneGraph {
        &self.graph
    }

    /// Execute the whole milestone graph, possibly in parallel.
    ///
    /// `worker` runs one milestone inside its sandbox:
    /// `(milestone, sandbox_dir) -> anyhow::Result<()>`. Worker success
    /// triggers merge-or-fail; any worker error (budget exhaustion, debate
    /// timeout, panic, anything) fails just that milestone.
    #[instrument(skip_all, fields(milestones = self.graph.len(), max_parallel = self.config.max_parallel))]
    pub async fn run_all<F, Fut>(mut self, worker: F) -> SchedulerResult<RunReport>
    where
        F: Fn(Milestone, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        std::fs::create_dir_all(&self.config.root_workspace)?;

        let worker = Arc::new(worker);
        let slots = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut failures: HashMap<String, String> = HashMap::new();

        while self.graph.incomplete() || !tasks.is_empty() {
            // Enqueue every ready, not-yet-scheduled milestone.
            let ready: Vec<Milestone> = self
                .graph
                .ready_nodes()
                .into_iter()
                .filter(|m| !scheduled.contains(&m.id))
                .cloned()
                .collect();
            for milestone in ready {
                let id = milestone.id.clone();
                self.graph.mark_running(&id)?;
                scheduled.insert(id.clone());
                tasks.spawn(Self::run_task(
                    milestone,
                    self.config.root_workspace.clone(),
                    Arc::clone(&slots),
                    Arc::clone(&self.merge_lock),
                    Arc::clone(&worker),
                ));
            }

            if tasks.is_empty() {
                if self.graph.incomplete() {
                    let remaining = self.graph.non_terminal_ids();
                    warn!(?remaining, "dependency graph cannot make progress");
                    return Err(SchedulerError::Deadlock { remaining });
                }
                break;
            }

            // Block until at least one outstanding task completes.
            let Some(joined) = tasks.join_next().await else {
                continue;
            };
            let output = match joined {
                Ok(output) => output,
                Err(join_error) => {
                    // The task wrapper converts worker panics itself; this
                    // branch only fires if the wrapper is aborted externally.
                    warn!(error = %join_error, "scheduler task join failed");
                    continue;
                }
            };

            self.settle(output, &mut failures).await?;
        }

        let outcomes = self
            .graph
            .milestones()
            .map(|m| MilestoneOutcome {
                id: m.id.clone(),
                state: m.state(),
                failure: failures.remove(&m.id),
            })
            .collect();
        let report = RunReport { outcomes };
        info!(
            passed = report.passed_count(),
            failed = report.failed_count(),
            "milestone graph complete"
        );
        Ok(report)
    }

    /// One milestone task: acquire a slot, clone the workspace, run the
    /// worker. The worker runs on its own task so a panic surfaces as an
    /// error here instead of poisoning the scheduler loop.
    async fn run_task<F, Fut>(
        milestone: Milestone,
        root: PathBuf,
        slots: Arc<Semaphore>,
        merge_lock: Arc<Mutex<()>>,
        worker: Arc<F>,
    ) -> TaskOutput
    where
        F: Fn(Milestone, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = milestone.id.clone();
        let _slot = slots.acquire_owned().await.ok();

        // Copy-on-start under the merge lock, so the clone never observes a
        // half-applied merge from a sibling.
        let sandbox = {
            let _guard = merge_lock.lock().await;
            sandbox::create_sandbox(&root, &id)
        };
        let sandbox = match sandbox {
            Ok(path) => path,
            Err(error) => {
                return TaskOutput {
                    id,
                    sandbox: None,
                    result: Err(anyhow::Error::new(error).context("sandbox creation failed")),
                }
            }
        };

        let result = match tokio::spawn(worker(milestone, sandbox.clone())).await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!("milestone task panicked: {join_error}")),
        };

        TaskOutput {
            id,
            sandbox: Some(sandbox),
            result,
        }
    }

    /// Convert one completed task into a graph transition. Merge success ⇒
    /// Passed; merge conflict or any task failure ⇒ Failed. Merge
    /// happens-before the Passed transition is recorded.
    async fn settle(
        &mut self,
        output: TaskOutput,
        failures: &mut HashMap<String, String>,
    ) -> SchedulerResult<()> {
        let TaskOutput {
            id,
            sandbox,
            result,
        } = output;

        match (result, sandbox) {
            (Ok(()), Some(sandbox)) => {
                let merged = {
                    let _guard = self.merge_lock.lock().await;
                    sandbox::merge_sandbox(&sandbox, &self.config.root_workspace)
                };
                match merged {
                    Ok(files) => {
                        info!(milestone = %id, files = files.len(), "milestone merged");
                        if let Err(error) = sandbox::remove_sandbox(&sandbox) {
                            warn!(milestone = %id, %error, "failed to remove merged sandbox");
                        }
                        self.graph.mark_passed(&id)?;
                    }
                    Err(MergeError::Conflict { path }) => {
                        warn!(milestone = %id, path = %path.display(), "merge conflict");
                        failures.insert(
                            id.clone(),
                            format!("merge conflict on {}", path.display()),
                        );
                        self.graph.mark_failed(&id)?;
                    }
                    Err(MergeError::Io(error)) => {
                        warn!(milestone = %id, %error, "merge io failure");
                        failures.insert(id.clone(), format!("merge io failure: {error}"));
                        self.graph.mark_failed(&id)?;
                    }
                }
            }
            (Ok(()), None) => {
                // Unreachable by construction: a successful worker implies a
                // sandbox existed. Treat defensively as failure.
                failures.insert(id.clone(), "task succeeded without a sandbox".to_string());
                self.graph.mark_failed(&id)?;
            }
            (Err(error), sandbox) => {
                warn!(milestone = %id, error = %format!("{error:#}"), "milestone task failed");
                if let Some(sandbox) = sandbox {
                    // Keep the sandbox for post-mortem inspection.
                    info!(milestone = %id, sandbox = %sandbox.display(), "failed sandbox retained");
                }
                failures.insert(id.clone(), format!("{error:#}"));
                self.graph.mark_failed(&id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MilestoneSpec;

    fn spec(id: &str, deps: &[&str]) -> MilestoneSpec {
        MilestoneSpec {
            id: id.to_string(),
            goal: format!("goal for {id}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn graph(specs: Vec<MilestoneSpec>) -> MilestoneGraph {
        MilestoneGraph::from_specs(specs).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_is_reported_as_deadlock_not_a_hang() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = ParallelScheduler::new(
            graph(vec![spec("x", &["y"]), spec("y", &["x"])]),
            SchedulerConfig::new(dir.path().join("workspace")),
        );

        let err = scheduler
            .run_all(|_m, _sb| async { Ok(()) })
            .await
            .unwrap_err();
        match err {
            SchedulerError::Deadlock { remaining } => {
                assert_eq!(remaining, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected Deadlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_graph_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = ParallelScheduler::new(
            graph(vec![]),
            SchedulerConfig::new(dir.path().join("workspace")),
        );
        let report = scheduler.run_all(|_m, _sb| async { Ok(()) }).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn test_worker_panic_fails_only_that_milestone() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = ParallelScheduler::new(
            graph(vec![spec("boom", &[]), spec("fine", &[])]),
            SchedulerConfig::new(dir.path().join("workspace")),
        );

        let report = scheduler
            .run_all(|m, _sb| async move {
                if m.id == "boom" {
                    panic!("worker exploded");
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(report.state_of("boom"), Some(MilestoneState::Failed));
        assert_eq!(report.state_of("fine"), Some(MilestoneState::Passed));
        let boom = report.outcomes.iter().find(|o| o.id == "boom").unwrap();
        assert!(boom.failure.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_failed_dependency_deadlocks_its_dependents() {
        // "fail" fails, so "blocked" can never start: deterministic deadlock
        // report instead of an infinite stall.
        let dir = tempfile::tempdir().unwrap();
        let scheduler = ParallelScheduler::new(
            graph(vec![spec("fail", &[]), spec("blocked", &["fail"])]),
            SchedulerConfig::new(dir.path().join("workspace")),
        );

        let err = scheduler
            .run_all(|_m, _sb| async { anyhow::bail!("nope") })
            .await
            .unwrap_err();
        match err {
            SchedulerError::Deadlock { remaining } => {
                assert_eq!(remaining, vec!["blocked".to_string()]);
            }
            other => panic!("expected Deadlock, got {other:?}"),
        }
    }
}
