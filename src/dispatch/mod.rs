//! Event dispatcher.
//!
//! Fans in events from two sources and fans out processing onto tasks:
//!
//! ```text
//!  webhook / reconciler ──► deployment queue ─┐
//!                                             ├─► select loop ──► one task per event
//!  watch / reconciler ────► review queue ─────┘         │
//!                                                        ▼
//!                                       dedupe (EventCache) ──► DecisionHandler
//! ```
//!
//! The entry points only enqueue. Queues are small and bounded: a burst that
//! overflows them waits on the sender, and anything lost to a crash or restart
//! is recovered by the reconciler on its next pass.
//!
//! # Deduplication
//!
//! - Deployment reviews use in-progress exclusion keyed by
//!   `organization/repository/run/environment`, so concurrent deliveries of the
//!   same event never create two access requests, and a cooldown follows.
//! - Review decisions are debounced on the access request's name.
//!
//! A transient upstream failure releases the claim at once instead of leaving
//! it to cool down, so the reconciler's next replay of the same event is not
//! suppressed. Other failures keep the cooldown.
//!
//! Both caches fail closed once the dispatcher has shut down.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::access::AccessClient;
use crate::approval::{DecisionHandler, HandlerError, HandlerRegistry};
use crate::cache::{CacheConfig, CacheError, EventCache};
use crate::github::GitHubApi;
use crate::types::{AccessRequest, CorrelationLabels, DeploymentReviewEvent, WorkflowDispatchEvent};

pub mod key;

pub use key::DedupeKey;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher has stopped accepting work.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("dispatch queue closed")]
    ChannelClosed,

    #[error("{0} events are not supported")]
    Unsupported(&'static str),

    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// The dispatcher's public entry points, as seen by adapters and the
/// reconciler.
pub trait EventSink: Send + Sync + 'static {
    fn handle_deployment_review_event_received(
        &self,
        event: DeploymentReviewEvent,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Always fails with [`DispatchError::Unsupported`].
    fn handle_workflow_dispatch_event_received(
        &self,
        event: WorkflowDispatchEvent,
    ) -> impl Future<Output = Result<()>> + Send;

    fn handle_access_request_reviewed(
        &self,
        request: AccessRequest,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Capacity of each inbound queue.
    pub queue_depth: usize,
    /// TTL of both dedup caches.
    pub dedupe_ttl: Duration,
    /// How long `run` waits for in-flight tasks and cache shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            queue_depth: 1,
            dedupe_ttl: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

struct Receivers {
    deployments: mpsc::Receiver<DeploymentReviewEvent>,
    reviews: mpsc::Receiver<AccessRequest>,
}

/// State shared with processing tasks.
struct DispatchCore<G, A> {
    handlers: HandlerRegistry<G, A>,
    in_flight: EventCache,
    reviewed: EventCache,
}

pub struct Dispatcher<G, A> {
    config: DispatcherConfig,
    deployments_tx: mpsc::Sender<DeploymentReviewEvent>,
    reviews_tx: mpsc::Sender<AccessRequest>,
    receivers: Mutex<Option<Receivers>>,
    core: Arc<DispatchCore<G, A>>,
    closed: CancellationToken,
}

impl<G: GitHubApi, A: AccessClient> Dispatcher<G, A> {
    /// Creates a dispatcher. Must be called inside a Tokio runtime (the caches
    /// spawn their eviction tasks).
    pub fn new(config: DispatcherConfig, handlers: HandlerRegistry<G, A>) -> Self {
        let depth = config.queue_depth.max(1);
        let (deployments_tx, deployments) = mpsc::channel(depth);
        let (reviews_tx, reviews) = mpsc::channel(depth);
        let cache_config = CacheConfig::new(config.dedupe_ttl);

        info!(
            repositories = handlers.len(),
            queue_depth = depth,
            dedupe_ttl = ?config.dedupe_ttl,
            "creating dispatcher"
        );

        Dispatcher {
            config,
            deployments_tx,
            reviews_tx,
            receivers: Mutex::new(Some(Receivers {
                deployments,
                reviews,
            })),
            core: Arc::new(DispatchCore {
                handlers,
                in_flight: EventCache::new(cache_config),
                reviewed: EventCache::new(cache_config),
            }),
            closed: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Drains both queues until `shutdown` fires.
    ///
    /// On shutdown the dispatcher stops accepting work, gives in-flight tasks
    /// up to `shutdown_timeout` to observe cancellation, aborts stragglers, and
    /// stops both caches.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Receivers {
            mut deployments,
            mut reviews,
        }) = receivers
        else {
            return Err(DispatchError::AlreadyRunning);
        };

        info!("dispatcher started");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping dispatcher");
                    break;
                }

                Some(event) = deployments.recv() => {
                    let core = self.core.clone();
                    let cancel = shutdown.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => debug!("deployment review abandoned at shutdown"),
                            _ = core.process_deployment_review(event) => {}
                        }
                    });
                }

                Some(request) = reviews.recv() => {
                    let core = self.core.clone();
                    let cancel = shutdown.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => debug!("review abandoned at shutdown"),
                            _ = core.process_review(request) => {}
                        }
                    });
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(error = %e, "event processing task panicked");
                    }
                }
            }
        }

        self.closed.cancel();
        deployments.close();
        reviews.close();

        let timeout = self.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "aborting tasks still running after shutdown timeout");
            tasks.abort_all();
        }

        let in_flight = self.core.in_flight.stop(timeout).await;
        let reviewed = self.core.reviewed.stop(timeout).await;
        in_flight?;
        reviewed?;

        info!("dispatcher stopped");
        Ok(())
    }

    async fn enqueue<T>(&self, tx: &mpsc::Sender<T>, item: T) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(DispatchError::ShuttingDown),
            sent = tx.send(item) => sent.map_err(|_| DispatchError::ChannelClosed),
        }
    }
}

impl<G: GitHubApi, A: AccessClient> EventSink for Dispatcher<G, A> {
    #[instrument(skip(self, event), fields(repo = %event.repo, run_id = %event.workflow_run_id, environment = %event.environment))]
    async fn handle_deployment_review_event_received(
        &self,
        event: DeploymentReviewEvent,
    ) -> Result<()> {
        trace!("enqueueing deployment review event");
        self.enqueue(&self.deployments_tx, event).await
    }

    async fn handle_workflow_dispatch_event_received(
        &self,
        event: WorkflowDispatchEvent,
    ) -> Result<()> {
        debug!(repo = %event.repo, workflow = %event.workflow, "workflow_dispatch events are not supported");
        Err(DispatchError::Unsupported("workflow_dispatch"))
    }

    #[instrument(skip(self, request), fields(request = %request.name(), state = %request.state()))]
    async fn handle_access_request_reviewed(&self, request: AccessRequest) -> Result<()> {
        trace!("enqueueing access request review");
        self.enqueue(&self.reviews_tx, request).await
    }
}

// ─── Processing ───────────────────────────────────────────────────────────────

impl<G: GitHubApi, A: AccessClient> DispatchCore<G, A> {
    #[instrument(skip(self, event), fields(repo = %event.repo, run_id = %event.workflow_run_id, environment = %event.environment))]
    async fn process_deployment_review(&self, event: DeploymentReviewEvent) {
        let key = DedupeKey::deployment_review(&event);
        let Some(mut claim) = self.in_flight.try_start(key.as_str()) else {
            trace!(key = %key, "duplicate deployment review event suppressed");
            return;
        };

        let Some(handler) = self.handlers.get(&event.repo) else {
            error!("no decision handler configured for repository, dropping event");
            return;
        };

        match self.materialize(handler, &event).await {
            Ok(()) => claim.finish(),
            Err(e) => {
                log_handler_error(&e, "failed to process deployment review event");
                if e.is_transient() {
                    claim.release();
                } else {
                    claim.finish();
                }
            }
        }
    }

    /// Finds or creates the access request for `event`.
    async fn materialize(
        &self,
        handler: &DecisionHandler<G, A>,
        event: &DeploymentReviewEvent,
    ) -> std::result::Result<(), HandlerError> {
        match handler.find_existing_access_request(event).await? {
            Some(existing) if existing.state().is_pending() => {
                debug!(request = %existing.name(), "access request already pending");
            }
            Some(existing) => {
                info!(
                    request = %existing.name(),
                    state = %existing.state(),
                    "access request already decided, replaying decision"
                );
                self.process_review(existing).await;
            }
            None => {
                let draft = handler.draft_access_request(event)?;
                handler.create_access_request(event, draft).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(request = %request.name(), state = %request.state()))]
    async fn process_review(&self, request: AccessRequest) {
        if !request.state().is_decided() {
            trace!("ignoring undecided access request");
            return;
        }

        let key = DedupeKey::access_request(request.name());
        if !self.reviewed.try_add(key.as_str()) {
            trace!("duplicate access request review suppressed");
            return;
        }

        let labels = match CorrelationLabels::read_from(&request) {
            Ok(labels) => labels,
            Err(e) => {
                debug!(error = %e, "access request cannot be correlated, dropping");
                return;
            }
        };

        let Some(handler) = self.handlers.get(&labels.repo) else {
            error!(repo = %labels.repo, "no decision handler configured for repository, dropping review");
            return;
        };

        if let Err(e) = handler.handle_access_request_reviewed(&request).await {
            log_handler_error(&e, "failed to replay access request decision");
            if e.is_transient() {
                self.reviewed.remove(key.as_str());
            }
        }
    }
}

fn log_handler_error(err: &HandlerError, message: &str) {
    if err.is_configuration_gap() {
        error!(error = %err, "{message}");
    } else {
        warn!(error = %err, "{message}");
    }
}
