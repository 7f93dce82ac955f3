//! Periodic reconciliation between waiting workflow runs and access requests.
//!
//! Webhooks and watch streams are at-least-once with gaps: a delivery can be
//! dropped by a full queue, a restart or a broken subscription. The reconciler
//! is the safety net. On a fixed interval it lists, per configured repository,
//! the workflow runs blocked on a deployment protection rule and the access
//! requests filed for that repository, and replays whatever is missing through
//! the dispatcher's public entry points. It never calls a decision handler
//! directly, so replays go through the same dedup path as live events.
//!
//! For each waiting run and each managed environment it is pending on:
//!
//! | access request | action                                      |
//! |----------------|---------------------------------------------|
//! | pending        | nothing, the run is healthy                 |
//! | decided        | replay via `handle_access_request_reviewed` |
//! | absent         | replay a synthesized deployment review event |

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::access::{AccessClient, AccessError, AccessRequestFilter};
use crate::dispatch::{DispatchError, EventSink};
use crate::github::{GitHubApi, GitHubApiError};
use crate::leader::LeaderElection;
use crate::types::labels::{ORGANIZATION_LABEL, REPOSITORY_LABEL};
use crate::types::{AccessRequest, CorrelationLabels, DeploymentReviewEvent, RepoId, WorkflowRunId};

/// Default interval between passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    GitHub(#[from] GitHubApiError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("replay rejected: {0}")]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// One repository the reconciler checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileTarget {
    pub repo: RepoId,
    /// User the repository's access requests are filed as.
    pub user: String,
    /// Environments with a configured role. Runs pending only on other
    /// environments are left alone.
    pub environments: BTreeSet<String>,
}

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Waiting workflow runs seen.
    pub waiting_runs: usize,
    /// (run, environment) pairs that already have a pending request.
    pub healthy: usize,
    pub replayed_decisions: usize,
    pub replayed_events: usize,
    /// Requests without usable correlation labels.
    pub skipped_requests: usize,
    pub failed_repositories: usize,
}

impl ReconcileSummary {
    fn absorb(&mut self, other: ReconcileSummary) {
        self.waiting_runs += other.waiting_runs;
        self.healthy += other.healthy;
        self.replayed_decisions += other.replayed_decisions;
        self.replayed_events += other.replayed_events;
        self.skipped_requests += other.skipped_requests;
        self.failed_repositories += other.failed_repositories;
    }
}

pub struct Reconciler<G, A, S> {
    targets: Vec<ReconcileTarget>,
    github: Arc<G>,
    access: Arc<A>,
    sink: Arc<S>,
    leader: Arc<dyn LeaderElection>,
    interval: Duration,
}

impl<G: GitHubApi, A: AccessClient, S: EventSink> Reconciler<G, A, S> {
    pub fn new(
        targets: Vec<ReconcileTarget>,
        github: Arc<G>,
        access: Arc<A>,
        sink: Arc<S>,
        leader: Arc<dyn LeaderElection>,
    ) -> Self {
        Reconciler {
            targets,
            github,
            access,
            sink,
            leader,
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs a pass immediately and then every interval until `shutdown`.
    ///
    /// Passes are skipped while this process is not the leader. A failed pass
    /// is logged and the loop carries on.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            repositories = self.targets.len(),
            interval = ?self.interval,
            "reconciler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.leader.is_leader() {
                trace!("not the leader, skipping reconciliation pass");
                continue;
            }

            let summary = tokio::select! {
                _ = shutdown.cancelled() => break,
                summary = self.reconcile() => summary,
            };
            if summary.replayed_decisions + summary.replayed_events > 0 {
                info!(?summary, "reconciliation replayed missing work");
            } else {
                debug!(?summary, "reconciliation pass complete");
            }
        }
        info!("reconciler stopped");
    }

    /// One pass over every target. Per-repository failures are logged and
    /// counted in the summary.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for target in &self.targets {
            match self.reconcile_repository(target).await {
                Ok(repo_summary) => summary.absorb(repo_summary),
                Err(e) => {
                    warn!(repo = %target.repo, error = %e, "reconciliation failed for repository");
                    summary.failed_repositories += 1;
                }
            }
        }
        summary
    }

    #[instrument(skip(self, target), fields(repo = %target.repo))]
    async fn reconcile_repository(&self, target: &ReconcileTarget) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let runs = self.github.list_waiting_workflow_runs(&target.repo).await?;
        if runs.is_empty() {
            trace!("no waiting workflow runs");
            return Ok(summary);
        }
        summary.waiting_runs = runs.len();

        let filter = AccessRequestFilter::for_user(target.user.clone())
            .with_label(ORGANIZATION_LABEL, target.repo.organization.clone())
            .with_label(REPOSITORY_LABEL, target.repo.repository.clone());
        let requests = self.access.get_access_requests(&filter).await?;
        let (index, skipped) = index_requests(requests);
        summary.skipped_requests = skipped;

        for run in runs {
            let pending = self
                .github
                .get_pending_deployments(&target.repo, run.id)
                .await?;
            let environments: BTreeSet<String> =
                pending.into_iter().map(|p| p.environment).collect();

            for environment in environments {
                if !target.environments.contains(&environment) {
                    trace!(run_id = %run.id, %environment, "environment not managed here");
                    continue;
                }

                match index.get(&(run.id, environment.clone())) {
                    Some(request) if request.state().is_pending() => {
                        summary.healthy += 1;
                    }
                    Some(request) => {
                        info!(
                            run_id = %run.id,
                            %environment,
                            request = %request.name(),
                            state = %request.state(),
                            "replaying decision for waiting run"
                        );
                        self.sink
                            .handle_access_request_reviewed(request.clone())
                            .await?;
                        summary.replayed_decisions += 1;
                    }
                    None => {
                        info!(run_id = %run.id, %environment, "replaying missing deployment review event");
                        let event = DeploymentReviewEvent::new(
                            target.repo.clone(),
                            environment,
                            run.id,
                            run.requester.clone(),
                        );
                        self.sink
                            .handle_deployment_review_event_received(event)
                            .await?;
                        summary.replayed_events += 1;
                    }
                }
            }
        }

        Ok(summary)
    }
}

/// Indexes requests by (run, environment), keeping the newest per key.
/// Returns the index and the number of requests that could not be correlated.
fn index_requests(
    requests: Vec<AccessRequest>,
) -> (HashMap<(WorkflowRunId, String), AccessRequest>, usize) {
    let mut index: HashMap<(WorkflowRunId, String), AccessRequest> = HashMap::new();
    let mut skipped = 0;

    for request in requests {
        let labels = match CorrelationLabels::read_from(&request) {
            Ok(labels) => labels,
            Err(e) => {
                warn!(request = %request.name(), error = %e, "skipping uncorrelated access request");
                skipped += 1;
                continue;
            }
        };
        let key = (labels.workflow_run_id, labels.environment);
        match index.get(&key) {
            Some(existing) if existing.created() >= request.created() => {}
            _ => {
                index.insert(key, request);
            }
        }
    }

    (index, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryAccessClient;
    use crate::dispatch::{Dispatcher, DispatcherConfig};
    use crate::leader::SingleWriter;
    use crate::test_utils::{
        FakeGitHub, RUN_ID, RecordingSink, deployment_event, registry, repo, wait_until,
    };
    use crate::types::AccessRequestState;

    fn target() -> ReconcileTarget {
        ReconcileTarget {
            repo: repo(),
            user: "github-approver".to_string(),
            environments: BTreeSet::from(["build/prod".to_string(), "build/stage".to_string()]),
        }
    }

    fn recording(
        github: &Arc<FakeGitHub>,
        access: &Arc<MemoryAccessClient>,
        sink: &Arc<RecordingSink>,
    ) -> Reconciler<FakeGitHub, MemoryAccessClient, RecordingSink> {
        Reconciler::new(
            vec![target()],
            github.clone(),
            access.clone(),
            sink.clone(),
            Arc::new(SingleWriter),
        )
    }

    /// A request as the decision handler would have created it.
    fn labelled_request(environment: &str) -> AccessRequest {
        let mut event = deployment_event();
        event.environment = environment.to_string();
        let mut draft = AccessRequest::draft("github-approver", vec!["gha-build-prod".into()]);
        CorrelationLabels::from_event(&event)
            .write_to(&mut draft)
            .unwrap();
        draft
    }

    #[tokio::test]
    async fn no_waiting_runs_is_a_no_op() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary, ReconcileSummary::default());
        assert!(sink.deployments().is_empty());
    }

    #[tokio::test]
    async fn waiting_run_without_requests_replays_one_event_per_environment() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod", "build/stage", "build/prod"]);

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary.waiting_runs, 1);
        assert_eq!(summary.replayed_events, 2);
        let mut environments: Vec<_> = sink
            .deployments()
            .into_iter()
            .map(|e| {
                assert_eq!(e.workflow_run_id, RUN_ID);
                assert_eq!(e.requester, "alice");
                e.environment
            })
            .collect();
        environments.sort();
        assert_eq!(environments, ["build/prod", "build/stage"]);
    }

    #[tokio::test]
    async fn unmanaged_environments_are_left_alone() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/dev"]);

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary.waiting_runs, 1);
        assert_eq!(summary.replayed_events, 0);
        assert!(sink.deployments().is_empty());
    }

    #[tokio::test]
    async fn pending_request_counts_as_healthy() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);
        access
            .create_access_request(labelled_request("build/prod"))
            .await
            .unwrap();

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary.healthy, 1);
        assert!(sink.deployments().is_empty());
        assert!(sink.reviews().is_empty());
    }

    #[tokio::test]
    async fn decided_request_for_waiting_run_is_replayed() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);
        let created = access
            .create_access_request(labelled_request("build/prod"))
            .await
            .unwrap();
        access
            .review(created.name(), "alice", AccessRequestState::Approved, "ok")
            .await
            .unwrap();

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary.replayed_decisions, 1);
        let reviews = sink.reviews();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].name(), created.name());
        assert_eq!(reviews[0].state(), AccessRequestState::Approved);
    }

    #[tokio::test]
    async fn unlabelled_requests_are_skipped() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);

        // Carries the repository labels the listing filters on, but no run id.
        let mut partial = AccessRequest::draft("github-approver", vec!["r".into()]);
        partial.set_label(ORGANIZATION_LABEL, "org");
        partial.set_label(REPOSITORY_LABEL, "repo");
        access.create_access_request(partial).await.unwrap();

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary.skipped_requests, 1);
        assert_eq!(summary.replayed_events, 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_counted_not_fatal() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);
        github.set_failure(Some(503));

        let reconciler = recording(&github, &access, &sink);
        let summary = reconciler.reconcile().await;
        assert_eq!(summary.failed_repositories, 1);

        github.set_failure(None);
        access.set_unavailable(true);
        assert_eq!(reconciler.reconcile().await.failed_repositories, 1);

        access.set_unavailable(false);
        assert_eq!(reconciler.reconcile().await.replayed_events, 1);
    }

    #[tokio::test]
    async fn closed_sink_fails_the_repository() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);
        sink.close();

        let summary = recording(&github, &access, &sink).reconcile().await;

        assert_eq!(summary.failed_repositories, 1);
        assert_eq!(summary.replayed_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_pass_without_external_change_replays_nothing() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod", "build/stage"]);

        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            registry(&github, &access),
        ));
        let shutdown = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };
        let reconciler = Reconciler::new(
            vec![target()],
            github.clone(),
            access.clone(),
            dispatcher.clone(),
            Arc::new(SingleWriter),
        );

        let first = reconciler.reconcile().await;
        assert_eq!(first.replayed_events, 2);
        let access_ref = &access;
        wait_until(|| async move { access_ref.len().await == 2 }).await;

        let second = reconciler.reconcile().await;
        assert_eq!(second.replayed_events, 0);
        assert_eq!(second.replayed_decisions, 0);
        assert_eq!(second.healthy, 2);
        assert_eq!(access.len().await, 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    struct Follower;

    impl LeaderElection for Follower {
        fn is_leader(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_replays_on_first_tick() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);

        let reconciler = Arc::new(recording(&github, &access, &sink));
        let shutdown = CancellationToken::new();
        let task = {
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run(shutdown).await })
        };

        let sink_ref = &sink;
        wait_until(|| async move { !sink_ref.deployments().is_empty() }).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_skips_passes_when_not_leader() {
        let github = Arc::new(FakeGitHub::new());
        let access = Arc::new(MemoryAccessClient::new());
        let sink = Arc::new(RecordingSink::new());
        github.add_waiting_run(repo(), RUN_ID, &["build/prod"]);

        let reconciler = Reconciler::new(
            vec![target()],
            github.clone(),
            access.clone(),
            sink.clone(),
            Arc::new(Follower),
        )
        .with_interval(Duration::from_secs(1));
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.deployments().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
