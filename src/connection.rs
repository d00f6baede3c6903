/// Connection registry model and storage contract
///
/// A `Connection` is one physical client socket known to exactly one gateway
/// process at a time. The durable registry maps connection -> subscribed
/// actor -> last-delivered sequence so that any gateway instance can resolve
/// "who needs to hear about actor X" without sharing memory with the
/// instance that owns the socket.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Registry entries are garbage-collected after 24 hours without a write,
/// bounding storage growth from gateways that crashed without unregistering.
pub const CONNECTION_TTL_SECS: i64 = 86_400;

/// A WebSocket connection record in the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    /// Opaque unique identifier assigned at socket accept time
    pub connection_id: String,

    /// When the connection was established (preserved across re-subscribes)
    pub connected_at: DateTime<Utc>,

    /// Actor this connection is subscribed to; None means registered but
    /// not yet subscribed
    pub actor_id: Option<String>,

    /// Token identifying the current subscription instance, so a connection
    /// can re-subscribe to a different actor without a new connection_id
    pub stream_id: Option<Uuid>,

    /// Highest sequence number already delivered on the current subscription
    pub last_sequence: u64,

    /// Advisory TTL boundary, refreshed on every write
    pub expires_at: DateTime<Utc>,
}

/// Connection-level errors shared by the registry and the sender.
///
/// `SendFailed` carries a retryable flag: transient edge-side failures may
/// be retried by caller policy, while authorization failures must not be.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Malformed identifier or unbuildable address. Never retried.
    #[error("invalid connection data: {0}")]
    InvalidData(String),

    /// The remote connection no longer exists. Triggers deregistration.
    #[error("connection closed")]
    ConnectionClosed,

    /// Delivery or storage operation failed.
    #[error("send failed: {message}")]
    SendFailed { message: String, retryable: bool },
}

impl ConnectionError {
    /// Transient failure that bounded retry may recover from
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::SendFailed {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent failure (credentials, permissions); retrying cannot help
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::SendFailed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SendFailed {
                retryable: true,
                ..
            }
        )
    }
}

/// Durable registry of connection identity -> subscription -> watermark.
///
/// All operations are remote, fallible, and safe under concurrent callers
/// from different gateway processes. A missing record on lookups is cold
/// state, not an error.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Create or overwrite the record with `connected_at = now` and
    /// `last_sequence = 0`. Idempotent: re-registering resets the
    /// connect time but is not an error.
    async fn register(
        &self,
        connection_id: &str,
        actor_id: Option<&str>,
    ) -> Result<(), ConnectionError>;

    /// Upsert the subscription, preserving the original `connected_at` when
    /// the record pre-exists. A reconnecting client passes its stored
    /// watermark here to resume instead of replaying from zero.
    async fn subscribe(
        &self,
        connection_id: &str,
        stream_id: Uuid,
        actor_id: &str,
        last_sequence: u64,
    ) -> Result<(), ConnectionError>;

    /// Delete the record. Deleting a non-existent key is not an error.
    async fn unregister(&self, connection_id: &str) -> Result<(), ConnectionError>;

    /// Every live connection currently subscribed to the actor, resolved
    /// through the secondary index. Entries past the TTL boundary are
    /// filtered out.
    async fn get_connections(&self, actor_id: &str) -> Result<Vec<Connection>, ConnectionError>;

    /// Advance the stored watermark to `max(current, last_sequence)`.
    /// Duplicate or reordered notifications never regress the watermark.
    async fn update_sequence(
        &self,
        connection_id: &str,
        last_sequence: u64,
    ) -> Result<(), ConnectionError>;
}

/// In-memory registry adapter for tests and single-process deployments.
///
/// Dual-index layout: a primary map by connection id plus a per-actor
/// index, mirroring the durable table's primary key + secondary index.
pub struct InMemoryConnectionStore {
    connections: DashMap<String, Connection>,

    /// Map: actor_id -> connection ids subscribed to it
    actor_index: DashMap<String, Vec<String>>,

    ttl: Duration,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(CONNECTION_TTL_SECS))
    }

    /// Custom TTL, used by tests to exercise expiry filtering
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            actor_index: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Lookup by primary key; None is cold state
    pub fn get(&self, connection_id: &str) -> Option<Connection> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    fn index_add(&self, actor_id: &str, connection_id: &str) {
        let mut ids = self
            .actor_index
            .entry(actor_id.to_string())
            .or_insert_with(Vec::new);
        if !ids.iter().any(|id| id == connection_id) {
            ids.push(connection_id.to_string());
        }
    }

    fn index_remove(&self, actor_id: &str, connection_id: &str) {
        if let Some(mut ids) = self.actor_index.get_mut(actor_id) {
            ids.retain(|id| id != connection_id);
            if ids.is_empty() {
                drop(ids);
                self.actor_index.remove(actor_id);
            }
        }
    }
}

impl Default for InMemoryConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn register(
        &self,
        connection_id: &str,
        actor_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let now = Utc::now();

        // Re-registration replaces any previous subscription
        if let Some(previous) = self.connections.get(connection_id) {
            if let Some(old_actor) = previous.actor_id.clone() {
                drop(previous);
                self.index_remove(&old_actor, connection_id);
            }
        }

        let connection = Connection {
            connection_id: connection_id.to_string(),
            connected_at: now,
            actor_id: actor_id.map(String::from),
            stream_id: None,
            last_sequence: 0,
            expires_at: now + self.ttl,
        };

        self.connections
            .insert(connection_id.to_string(), connection);

        if let Some(actor_id) = actor_id {
            self.index_add(actor_id, connection_id);
        }

        tracing::debug!(connection_id, "registered connection");
        Ok(())
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        stream_id: Uuid,
        actor_id: &str,
        last_sequence: u64,
    ) -> Result<(), ConnectionError> {
        let now = Utc::now();

        let connected_at = match self.connections.get(connection_id) {
            Some(existing) => {
                let connected_at = existing.connected_at;
                if let Some(old_actor) = existing.actor_id.clone() {
                    if old_actor != actor_id {
                        drop(existing);
                        self.index_remove(&old_actor, connection_id);
                    }
                }
                connected_at
            }
            None => now,
        };

        let connection = Connection {
            connection_id: connection_id.to_string(),
            connected_at,
            actor_id: Some(actor_id.to_string()),
            stream_id: Some(stream_id),
            last_sequence,
            expires_at: now + self.ttl,
        };

        self.connections
            .insert(connection_id.to_string(), connection);
        self.index_add(actor_id, connection_id);

        tracing::debug!(connection_id, actor_id, last_sequence, "subscribed");
        Ok(())
    }

    async fn unregister(&self, connection_id: &str) -> Result<(), ConnectionError> {
        if let Some((_, connection)) = self.connections.remove(connection_id) {
            if let Some(actor_id) = connection.actor_id {
                self.index_remove(&actor_id, connection_id);
            }
            tracing::debug!(connection_id, "unregistered connection");
        }
        Ok(())
    }

    async fn get_connections(&self, actor_id: &str) -> Result<Vec<Connection>, ConnectionError> {
        let now = Utc::now();

        let ids = match self.actor_index.get(actor_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };

        // The index entry and the record are written separately, so a
        // racing re-subscribe can leave the index briefly pointing at a
        // connection that already moved to another actor; the record is
        // authoritative.
        let connections = ids
            .iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.clone()))
            .filter(|c| c.actor_id.as_deref() == Some(actor_id))
            .filter(|c| c.expires_at > now)
            .collect();

        Ok(connections)
    }

    async fn update_sequence(
        &self,
        connection_id: &str,
        last_sequence: u64,
    ) -> Result<(), ConnectionError> {
        // A missing record means the connection was reaped concurrently;
        // that is cold state, not a failure.
        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            connection.last_sequence = connection.last_sequence.max(last_sequence);
            connection.expires_at = Utc::now() + self.ttl;
        }
        Ok(())
    }
}
