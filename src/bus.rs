/// Cross-process change-notification bus
///
/// Gateway processes share a single named pub/sub channel carrying
/// "actor X advanced to sequence N" events. The bus is a trigger, not a
/// source of truth: delivery is at-most-once per subscriber with no
/// durability, and consumers must treat a received sequence number as
/// "at least this far", never "exactly this".
///
/// The production adapter rides PostgreSQL LISTEN/NOTIFY. Database setup:
///
/// ```sql
/// CREATE OR REPLACE FUNCTION notify_actor_state_change()
/// RETURNS TRIGGER AS $$
/// BEGIN
///     PERFORM pg_notify('actor_state_changes',
///         json_build_object(
///             'actorID', NEW.actor_id,
///             'sequenceNumber', NEW.sequence_number,
///             'timestamp', EXTRACT(EPOCH FROM NEW.updated_at)::bigint
///         )::text
///     );
///     RETURN NEW;
/// END;
/// $$ LANGUAGE plpgsql;
///
/// CREATE TRIGGER actor_state_change_trigger
/// AFTER INSERT OR UPDATE ON actor_states
/// FOR EACH ROW
/// EXECUTE FUNCTION notify_actor_state_change();
/// ```
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// PostgreSQL identifiers are capped at 63 bytes
const MAX_CHANNEL_NAME_LEN: usize = 63;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// An actor state advancement event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChangeNotification {
    #[serde(rename = "actorID")]
    pub actor_id: String,

    /// Strictly increasing per actor, assigned by the actor's owner
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,

    /// Advisory, for observability only; never used for ordering
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl StateChangeNotification {
    pub fn new(actor_id: impl Into<String>, sequence_number: u64) -> Self {
        Self {
            actor_id: actor_id.into(),
            sequence_number,
            timestamp: Utc::now(),
        }
    }
}

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    /// Construction-time rejection; fatal, prevents startup
    #[error("invalid channel name: {0:?}")]
    InvalidChannelName(String),

    #[error("bus connection error: {0}")]
    ConnectionError(String),

    #[error("payload encoding error: {0}")]
    EncodingError(String),

    /// The stream is not restartable; `start` can only be called once
    #[error("listener already started")]
    AlreadyStarted,
}

/// Validates a channel identifier before it is interpolated into any query.
///
/// The allow-list grammar prevents SQL injection: the name must start with
/// a letter or underscore and continue with letters, digits, underscores,
/// or hyphens, within PostgreSQL's 63-byte identifier limit.
pub fn validate_channel_name(channel: &str) -> Result<(), BusError> {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_NAME_LEN {
        return Err(BusError::InvalidChannelName(channel.to_string()));
    }

    let mut chars = channel.chars();
    let first = chars.next().expect("non-empty checked above");
    if !first.is_alphabetic() && first != '_' {
        return Err(BusError::InvalidChannelName(channel.to_string()));
    }

    if !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(BusError::InvalidChannelName(channel.to_string()));
    }

    Ok(())
}

/// Named, single-channel broadcast primitive shared by all gateway processes
#[async_trait]
pub trait ChangeBus: Send + Sync {
    /// Begin listening. Returns a lazy, unbounded sequence of events that
    /// never terminates on its own; it ends only via `stop` or connection
    /// loss. Not restartable.
    async fn start(&self)
        -> Result<mpsc::UnboundedReceiver<StateChangeNotification>, BusError>;

    /// Cease listening and release the underlying connection. Idempotent.
    async fn stop(&self) -> Result<(), BusError>;

    /// Publish an event to the channel. Also used for test and manual
    /// triggering.
    async fn notify(&self, change: &StateChangeNotification) -> Result<(), BusError>;

    /// Whether this process is currently listening on the channel
    fn is_listening(&self) -> bool;
}

/// In-memory bus adapter: every `start` call models one subscribed gateway
/// process, and `notify` broadcasts to all of them.
pub struct InMemoryChangeBus {
    subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<StateChangeNotification>>>,
    listening: AtomicBool,
}

impl InMemoryChangeBus {
    pub fn new() -> Self {
        Self {
            subscribers: parking_lot::Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeBus for InMemoryChangeBus {
    async fn start(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<StateChangeNotification>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        self.listening.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.subscribers.lock().clear();
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn notify(&self, change: &StateChangeNotification) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock();
        // An event published to a dropped subscriber is lost, matching the
        // bus's non-durable contract
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

/// PostgreSQL LISTEN/NOTIFY bus adapter.
///
/// `start` spawns a background task that owns a dedicated listener
/// connection, decodes raw channel payloads, and pushes them into an
/// unbounded queue feeding the consumer stream. Connection loss triggers
/// automatic reconnect and re-LISTEN with exponential backoff.
pub struct PostgresChangeBus {
    pool: PgPool,
    channel: String,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    listener_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PostgresChangeBus {
    /// Channel-name validation is a hard precondition on construction.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Result<Self, BusError> {
        let channel = channel.into();
        validate_channel_name(&channel)?;

        Ok(Self {
            pool,
            channel,
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            listener_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn listen_loop(
        pool: PgPool,
        channel: String,
        running: Arc<AtomicBool>,
        tx: mpsc::UnboundedSender<StateChangeNotification>,
    ) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        while running.load(Ordering::SeqCst) {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(
                        channel = %channel,
                        error = %e,
                        "failed to connect listener, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            };

            if let Err(e) = listener.listen(&channel).await {
                tracing::error!(channel = %channel, error = %e, "LISTEN failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                continue;
            }

            delay = INITIAL_RECONNECT_DELAY;
            tracing::info!(channel = %channel, "listening for state change notifications");

            loop {
                if !running.load(Ordering::SeqCst) {
                    return;
                }

                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<StateChangeNotification>(
                            notification.payload(),
                        ) {
                            Ok(change) => {
                                if tx.send(change).is_err() {
                                    // Consumer dropped the stream
                                    running.store(false, Ordering::SeqCst);
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    channel = %channel,
                                    error = %e,
                                    payload = notification.payload(),
                                    "ignoring malformed notification payload"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            channel = %channel,
                            error = %e,
                            "listener connection lost, reconnecting"
                        );
                        break;
                    }
                }
            }

            sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }
}

#[async_trait]
impl ChangeBus for PostgresChangeBus {
    async fn start(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<StateChangeNotification>, BusError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted);
        }

        self.running.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(Self::listen_loop(
            self.pool.clone(),
            self.channel.clone(),
            self.running.clone(),
            tx,
        ));
        *self.listener_task.lock() = Some(handle);

        Ok(rx)
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.listener_task.lock().take() {
            // Dropping the listener closes its dedicated connection
            handle.abort();
            tracing::info!(channel = %self.channel, "stopped listening");
        }

        Ok(())
    }

    async fn notify(&self, change: &StateChangeNotification) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(change).map_err(|e| BusError::EncodingError(e.to_string()))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
