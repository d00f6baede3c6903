/// Push-delivery capability for individual connections
///
/// A sender is addressed by opaque connection identifier; resolving that to
/// a physical socket is the sender's own concern. From this layer's
/// perspective the channel is fire-and-forget: a successful `send` means
/// the bytes were handed to the underlying transport, nothing more.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionError;

/// Origin metadata for a connection, as reported by the transport edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Time the connection was established (ISO 8601)
    #[serde(rename = "connectedAt")]
    pub connected_at: String,

    /// Source IP address
    #[serde(rename = "identity.sourceIp")]
    pub source_ip: Option<String>,

    /// Client user agent string
    #[serde(rename = "identity.userAgent")]
    pub user_agent: Option<String>,
}

/// Push-delivery and liveness capability for a single connection
#[async_trait]
pub trait ConnectionSender: Send + Sync {
    /// Push raw bytes to the connection.
    ///
    /// Outcomes: `Ok` on accepted delivery; `ConnectionClosed` when the
    /// connection no longer exists at the transport edge (the caller must
    /// unregister it); retryable `SendFailed` for transient edge failures;
    /// non-retryable `SendFailed` for authorization failures;
    /// `InvalidData` for malformed identifiers, never retried.
    async fn send(&self, payload: &[u8], connection_id: &str) -> Result<(), ConnectionError>;

    /// Best-effort liveness probe. Never fails; any uncertainty resolves
    /// to `false`.
    async fn is_alive(&self, connection_id: &str) -> bool;

    /// Force-close the connection. Idempotent: closing an already-closed
    /// or unknown connection is not an error.
    async fn disconnect(&self, connection_id: &str) -> Result<(), ConnectionError>;

    /// Origin metadata for the connection, when the edge still knows it
    async fn get_connection_info(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionInfo, ConnectionError>;
}

struct Mailbox {
    connected_at: DateTime<Utc>,
    payloads: Vec<Vec<u8>>,
    closed: bool,

    /// Remaining sends that fail with a retryable error (test fault
    /// injection)
    pending_failures: u32,
}

/// In-memory sender adapter: per-connection mailboxes with closable
/// connections, so gone-connection and retry paths are testable without a
/// transport edge.
pub struct InMemoryConnectionSender {
    mailboxes: DashMap<String, Mailbox>,
}

impl InMemoryConnectionSender {
    pub fn new() -> Self {
        Self {
            mailboxes: DashMap::new(),
        }
    }

    /// Open a mailbox for a connection, as the edge does at socket accept
    pub fn open(&self, connection_id: &str) {
        self.mailboxes.insert(
            connection_id.to_string(),
            Mailbox {
                connected_at: Utc::now(),
                payloads: Vec::new(),
                closed: false,
                pending_failures: 0,
            },
        );
    }

    /// Simulate the client going away mid-delivery
    pub fn close(&self, connection_id: &str) {
        if let Some(mut mailbox) = self.mailboxes.get_mut(connection_id) {
            mailbox.closed = true;
        }
    }

    /// Make the next `count` sends to this connection fail transiently
    pub fn inject_failures(&self, connection_id: &str, count: u32) {
        if let Some(mut mailbox) = self.mailboxes.get_mut(connection_id) {
            mailbox.pending_failures = count;
        }
    }

    /// Everything delivered to this connection so far
    pub fn delivered(&self, connection_id: &str) -> Vec<Vec<u8>> {
        self.mailboxes
            .get(connection_id)
            .map(|m| m.payloads.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryConnectionSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionSender for InMemoryConnectionSender {
    async fn send(&self, payload: &[u8], connection_id: &str) -> Result<(), ConnectionError> {
        let mut mailbox = self
            .mailboxes
            .get_mut(connection_id)
            .ok_or(ConnectionError::ConnectionClosed)?;

        if mailbox.closed {
            return Err(ConnectionError::ConnectionClosed);
        }

        if mailbox.pending_failures > 0 {
            mailbox.pending_failures -= 1;
            return Err(ConnectionError::retryable("injected transient failure"));
        }

        mailbox.payloads.push(payload.to_vec());
        Ok(())
    }

    async fn is_alive(&self, connection_id: &str) -> bool {
        self.mailboxes
            .get(connection_id)
            .map(|m| !m.closed)
            .unwrap_or(false)
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ConnectionError> {
        self.mailboxes.remove(connection_id);
        Ok(())
    }

    async fn get_connection_info(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionInfo, ConnectionError> {
        let mailbox = self
            .mailboxes
            .get(connection_id)
            .ok_or(ConnectionError::ConnectionClosed)?;

        if mailbox.closed {
            return Err(ConnectionError::ConnectionClosed);
        }

        Ok(ConnectionInfo {
            connected_at: mailbox.connected_at.to_rfc3339(),
            source_ip: Some("127.0.0.1".to_string()),
            user_agent: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_open_connection() {
        let sender = InMemoryConnectionSender::new();
        sender.open("c1");

        sender.send(b"hello", "c1").await.unwrap();

        assert_eq!(sender.delivered("c1"), vec![b"hello".to_vec()]);
        assert!(sender.is_alive("c1").await);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_closed() {
        let sender = InMemoryConnectionSender::new();

        let err = sender.send(b"hello", "nope").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_send_to_closed_connection() {
        let sender = InMemoryConnectionSender::new();
        sender.open("c1");
        sender.close("c1");

        let err = sender.send(b"hello", "c1").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionClosed));
        assert!(!sender.is_alive("c1").await);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let sender = InMemoryConnectionSender::new();
        sender.open("c1");
        sender.inject_failures("c1", 2);

        assert!(sender.send(b"a", "c1").await.unwrap_err().is_retryable());
        assert!(sender.send(b"a", "c1").await.unwrap_err().is_retryable());
        sender.send(b"a", "c1").await.unwrap();

        assert_eq!(sender.delivered("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let sender = InMemoryConnectionSender::new();
        sender.open("c1");

        sender.disconnect("c1").await.unwrap();
        sender.disconnect("c1").await.unwrap();
        sender.disconnect("never-existed").await.unwrap();

        assert!(!sender.is_alive("c1").await);
    }

    #[tokio::test]
    async fn test_connection_info() {
        let sender = InMemoryConnectionSender::new();
        sender.open("c1");

        let info = sender.get_connection_info("c1").await.unwrap();
        assert!(info.source_ip.is_some());

        sender.disconnect("c1").await.unwrap();
        let err = sender.get_connection_info("c1").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionClosed));
    }
}
