/// Fanout coordination between the change bus and the connection registry
///
/// Every gateway process runs one coordinator. For each bus event
/// `(actor, N)` it resolves the subscribers lagging behind `N`, pushes the
/// encoded notification through the sender, advances watermarks on
/// confirmed success, and reaps connections the transport edge reports as
/// gone. Per-connection failures are retried within bounds and never block
/// fanout to the remaining connections.
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::bus::StateChangeNotification;
use crate::connection::{Connection, ConnectionError, ConnectionStore};
use crate::sender::ConnectionSender;

/// Bounded retry and shedding policy for deliveries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total send attempts per connection per notification
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles per attempt
    pub initial_backoff: Duration,

    /// Backoff ceiling
    pub max_backoff: Duration,

    /// Consecutive failed fanouts after which a connection is shed
    /// (unregistered) instead of retried forever
    pub shed_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            shed_after: 5,
        }
    }
}

/// Counters for fanout operations
#[derive(Default)]
pub struct FanoutMetrics {
    notifications_processed: parking_lot::RwLock<u64>,
    deliveries: parking_lot::RwLock<u64>,
    delivery_failures: parking_lot::RwLock<u64>,
    connections_reaped: parking_lot::RwLock<u64>,
}

impl FanoutMetrics {
    pub fn notifications_processed(&self) -> u64 {
        *self.notifications_processed.read()
    }

    pub fn deliveries(&self) -> u64 {
        *self.deliveries.read()
    }

    pub fn delivery_failures(&self) -> u64 {
        *self.delivery_failures.read()
    }

    pub fn connections_reaped(&self) -> u64 {
        *self.connections_reaped.read()
    }

    fn record_notification(&self) {
        *self.notifications_processed.write() += 1;
    }

    fn record_delivery(&self) {
        *self.deliveries.write() += 1;
    }

    fn record_failure(&self) {
        *self.delivery_failures.write() += 1;
    }

    fn record_reaped(&self) {
        *self.connections_reaped.write() += 1;
    }
}

/// Consecutive failed fanouts for one connection; the actor is recorded
/// so stale entries can be pruned when the connection leaves the registry
struct FailureStreak {
    actor_id: String,
    count: u32,
}

/// Reconciles bus events with the registry and pushes deliveries
pub struct FanoutCoordinator {
    store: Arc<dyn ConnectionStore>,
    sender: Arc<dyn ConnectionSender>,
    retry: RetryPolicy,
    metrics: Arc<FanoutMetrics>,

    /// Map: connection_id -> failure streak, for shedding
    failure_streaks: DashMap<String, FailureStreak>,
}

impl FanoutCoordinator {
    pub fn new(store: Arc<dyn ConnectionStore>, sender: Arc<dyn ConnectionSender>) -> Self {
        Self::with_retry_policy(store, sender, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        store: Arc<dyn ConnectionStore>,
        sender: Arc<dyn ConnectionSender>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            sender,
            retry,
            metrics: Arc::new(FanoutMetrics::default()),
            failure_streaks: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> Arc<FanoutMetrics> {
        self.metrics.clone()
    }

    /// Consume bus events until the stream ends (bus stopped or dropped)
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<StateChangeNotification>) {
        tracing::info!("fanout coordinator running");
        while let Some(change) = events.recv().await {
            self.handle_notification(&change).await;
        }
        tracing::info!("change stream ended, fanout coordinator stopping");
    }

    /// Fan one notification out to every lagging subscriber of the actor
    pub async fn handle_notification(&self, change: &StateChangeNotification) {
        self.metrics.record_notification();

        let connections = match self.store.get_connections(&change.actor_id).await {
            Ok(connections) => connections,
            Err(e) => {
                // The bus is only a hint; the next event for this actor
                // retriggers the lookup
                tracing::error!(
                    actor_id = %change.actor_id,
                    error = %e,
                    "failed to resolve subscribers"
                );
                return;
            }
        };

        // Connections that left the registry since their last failure (a
        // clean disconnect, another process's reap) no longer need streak
        // tracking
        self.failure_streaks.retain(|id, streak| {
            streak.actor_id != change.actor_id
                || connections.iter().any(|c| c.connection_id == *id)
        });

        let payload = match serde_json::to_vec(change) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(actor_id = %change.actor_id, error = %e, "unencodable change");
                return;
            }
        };

        for connection in &connections {
            // Already caught up; the max-on-write rule makes skipping safe
            // even when events arrive out of order
            if connection.last_sequence >= change.sequence_number {
                continue;
            }

            self.deliver(connection, change, &payload).await;
        }

        tracing::debug!(
            actor_id = %change.actor_id,
            sequence = change.sequence_number,
            subscribers = connections.len(),
            "fanout complete"
        );
    }

    async fn deliver(
        &self,
        connection: &Connection,
        change: &StateChangeNotification,
        payload: &[u8],
    ) {
        let connection_id = connection.connection_id.as_str();
        let mut backoff = self.retry.initial_backoff;

        for attempt in 1..=self.retry.max_attempts {
            match self.sender.send(payload, connection_id).await {
                Ok(()) => {
                    // Watermark moves only after confirmed success; a
                    // cancelled or failed send leaves it untouched
                    if let Err(e) = self
                        .store
                        .update_sequence(connection_id, change.sequence_number)
                        .await
                    {
                        tracing::warn!(connection_id, error = %e, "watermark update failed");
                    }

                    self.failure_streaks.remove(connection_id);
                    self.metrics.record_delivery();
                    return;
                }
                Err(ConnectionError::ConnectionClosed) => {
                    tracing::info!(connection_id, "connection gone, unregistering");
                    self.reap(connection_id).await;
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        connection_id,
                        attempt,
                        error = %e,
                        "transient delivery failure, retrying in {:?}",
                        backoff
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
                Err(e) => {
                    tracing::error!(connection_id, attempt, error = %e, "delivery failed");
                    break;
                }
            }
        }

        // Exhausted retries or hit a permanent failure; move on so one
        // connection cannot starve the rest of the fanout
        self.metrics.record_failure();

        let streak = {
            let mut entry = self
                .failure_streaks
                .entry(connection_id.to_string())
                .or_insert_with(|| FailureStreak {
                    actor_id: change.actor_id.clone(),
                    count: 0,
                });
            entry.actor_id = change.actor_id.clone();
            entry.count += 1;
            entry.count
        };

        if streak >= self.retry.shed_after {
            tracing::warn!(
                connection_id,
                streak,
                "shedding connection after repeated failed fanouts"
            );
            self.reap(connection_id).await;
        }
    }

    async fn reap(&self, connection_id: &str) {
        if let Err(e) = self.store.unregister(connection_id).await {
            tracing::warn!(connection_id, error = %e, "failed to unregister connection");
        }
        self.failure_streaks.remove(connection_id);
        self.metrics.record_reaped();
    }
}
