//! Forwards access-request decisions from the watch stream to the dispatcher.
//!
//! One watcher runs per access-request user. It subscribes with a filter on
//! that user, forwards every approved or denied request to
//! [`EventSink::handle_access_request_reviewed`], and re-subscribes with
//! exponential backoff whenever the stream ends or the subscription fails.
//! Changes missed while disconnected are picked up by the reconciler.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::access::{AccessClient, AccessRequestFilter, WatchEvent};
use crate::dispatch::{DispatchError, EventSink};
use crate::github::RetryConfig;

pub struct AccessRequestWatcher<A, S> {
    user: String,
    access: Arc<A>,
    sink: Arc<S>,
    backoff: RetryConfig,
}

/// Why a subscription stopped delivering.
enum StreamEnd {
    Shutdown,
    Disconnected,
}

impl<A: AccessClient, S: EventSink> AccessRequestWatcher<A, S> {
    pub fn new(user: impl Into<String>, access: Arc<A>, sink: Arc<S>) -> Self {
        AccessRequestWatcher {
            user: user.into(),
            access,
            sink,
            backoff: RetryConfig::RESUBSCRIBE,
        }
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Watches until `shutdown` fires or the dispatcher stops accepting work.
    #[instrument(skip(self, shutdown), fields(user = %self.user))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            let filter = AccessRequestFilter::for_user(self.user.clone());
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscription = self.access.watch_access_requests(filter) => subscription,
            };

            match subscription {
                Ok(rx) => {
                    info!("subscribed to access request changes");
                    attempt = 0;
                    match self.forward(rx, &shutdown).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Disconnected => warn!("watch stream ended, re-subscribing"),
                    }
                }
                Err(e) => warn!(error = %e, attempt, "failed to subscribe to access request changes"),
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, "waiting before re-subscribing");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("access request watcher stopped");
    }

    async fn forward(
        &self,
        mut rx: mpsc::Receiver<WatchEvent>,
        shutdown: &CancellationToken,
    ) -> StreamEnd {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                event = rx.recv() => event,
            };

            let request = match event {
                None => return StreamEnd::Disconnected,
                Some(WatchEvent::Delete(name)) => {
                    trace!(request = %name, "access request deleted");
                    continue;
                }
                Some(WatchEvent::Put(request)) if !request.state().is_decided() => {
                    trace!(request = %request.name(), "ignoring pending access request");
                    continue;
                }
                Some(WatchEvent::Put(request)) => request,
            };

            let name = request.name().to_string();
            match self.sink.handle_access_request_reviewed(request).await {
                Ok(()) => debug!(request = %name, "forwarded access request decision"),
                Err(DispatchError::ShuttingDown) => return StreamEnd::Shutdown,
                Err(e) => warn!(request = %name, error = %e, "failed to forward access request decision"),
            }
        }
    }
}
