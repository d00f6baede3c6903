/// Management-API push sender
///
/// Delivers payloads to WebSocket connections through the transport edge's
/// management endpoint:
///
/// - `POST {base}/@connections/{connectionId}` - send data to a connection
/// - `GET {base}/@connections/{connectionId}` - connection info / liveness
/// - `DELETE {base}/@connections/{connectionId}` - force-disconnect
///
/// Status mapping (reproduced for any transport): 200 success, 410 gone,
/// 403 forbidden, 5xx edge error. Every request carries a SigV4 signature.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Url};
use tokio::time::Duration;

use crate::connection::ConnectionError;
use crate::sender::{ConnectionInfo, ConnectionSender};
use crate::signing::{uri_encode_segment, RequestSigner};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP push-endpoint sender adapter
pub struct HttpConnectionSender {
    base_url: Url,
    http_client: Client,
    signer: Option<RequestSigner>,
    clock_skew: chrono::Duration,
}

impl HttpConnectionSender {
    /// Initialize with the management endpoint base, e.g.
    /// `https://abc123.execute-api.us-east-1.amazonaws.com/production`.
    /// Trailing slashes are normalized away. Pass a signer for production
    /// edges; local emulators accept unsigned requests.
    pub fn new(endpoint: &str, signer: Option<RequestSigner>) -> Result<Self, ConnectionError> {
        let trimmed = endpoint.trim_end_matches('/');
        let base_url = Url::parse(trimmed)
            .map_err(|e| ConnectionError::InvalidData(format!("bad endpoint {trimmed:?}: {e}")))?;

        if base_url.host_str().is_none() {
            return Err(ConnectionError::InvalidData(format!(
                "endpoint {trimmed:?} has no host"
            )));
        }

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConnectionError::fatal(e.to_string()))?;

        Ok(Self {
            base_url,
            http_client,
            signer,
            clock_skew: chrono::Duration::zero(),
        })
    }

    /// Backdate signing timestamps by `tolerance`, so a gateway clock
    /// running ahead of the edge does not produce not-yet-valid signatures
    pub fn with_clock_skew(mut self, tolerance: Duration) -> Self {
        self.clock_skew =
            chrono::Duration::from_std(tolerance).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    fn signing_time(&self) -> DateTime<Utc> {
        Utc::now() - self.clock_skew
    }

    /// Build `{base}/@connections/{connectionId}` with the path encoded the
    /// same way it is canonicalized for signing.
    fn connection_url(&self, connection_id: &str) -> Result<Url, ConnectionError> {
        if connection_id.is_empty() {
            return Err(ConnectionError::InvalidData(
                "empty connection id".to_string(),
            ));
        }

        let url = format!(
            "{}/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            uri_encode_segment("@connections"),
            uri_encode_segment(connection_id)
        );

        Url::parse(&url).map_err(|e| {
            ConnectionError::InvalidData(format!("unbuildable address for {connection_id:?}: {e}"))
        })
    }

    fn signed(&self, method: &Method, url: &Url, payload: &[u8]) -> RequestBuilder {
        let mut request = self
            .http_client
            .request(method.clone(), url.clone())
            .body(payload.to_vec());

        if let Some(signer) = &self.signer {
            let host = url.host_str().unwrap_or_default();
            let headers = signer.sign(
                method.as_str(),
                host,
                url.path(),
                url.query().unwrap_or(""),
                payload,
                self.signing_time(),
            );

            request = request
                .header("Authorization", headers.authorization)
                .header("x-amz-date", headers.amz_date);
            if let Some(token) = headers.session_token {
                request = request.header("x-amz-security-token", token);
            }
        }

        request
    }
}

/// Map a POST-to-connection response status to the sender error taxonomy
fn classify_send_status(status: u16) -> Result<(), ConnectionError> {
    match status {
        200 => Ok(()),
        410 => Err(ConnectionError::ConnectionClosed),
        403 => Err(ConnectionError::fatal(
            "edge forbidden (check credentials/permissions)",
        )),
        500..=599 => Err(ConnectionError::retryable(format!(
            "edge internal error ({status})"
        ))),
        other => Err(ConnectionError::fatal(format!("edge error: {other}"))),
    }
}

#[async_trait]
impl ConnectionSender for HttpConnectionSender {
    async fn send(&self, payload: &[u8], connection_id: &str) -> Result<(), ConnectionError> {
        let url = self.connection_url(connection_id)?;

        let response = self
            .signed(&Method::POST, &url, payload)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| ConnectionError::retryable(e.to_string()))?;

        classify_send_status(response.status().as_u16())
    }

    async fn is_alive(&self, connection_id: &str) -> bool {
        let url = match self.connection_url(connection_id) {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self.signed(&Method::GET, &url, b"").send().await {
            Ok(response) => response.status().as_u16() == 200,
            Err(_) => false,
        }
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ConnectionError> {
        let url = self.connection_url(connection_id)?;

        let response = self
            .signed(&Method::DELETE, &url, b"")
            .send()
            .await
            .map_err(|e| ConnectionError::retryable(e.to_string()))?;

        // 410 means already gone, which is what a disconnect wanted anyway
        match response.status().as_u16() {
            200 | 410 => Ok(()),
            status => classify_send_status(status),
        }
    }

    async fn get_connection_info(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionInfo, ConnectionError> {
        let url = self.connection_url(connection_id)?;

        let response = self
            .signed(&Method::GET, &url, b"")
            .send()
            .await
            .map_err(|e| ConnectionError::retryable(e.to_string()))?;

        match response.status().as_u16() {
            200 => response
                .json::<ConnectionInfo>()
                .await
                .map_err(|e| ConnectionError::InvalidData(e.to_string())),
            410 => Err(ConnectionError::ConnectionClosed),
            status => match classify_send_status(status) {
                Ok(()) => Err(ConnectionError::fatal(format!("unexpected status {status}"))),
                Err(e) => Err(e),
            },
        }
    }
}
