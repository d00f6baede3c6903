/// Gateway fanout coordination layer
///
/// Cross-process delivery of actor state changes to WebSocket connections:
/// - Durable connection registry (PostgreSQL) mapping connections to
///   subscribed actors and last-delivered sequence watermarks
/// - Change bus (PostgreSQL LISTEN/NOTIFY) carrying "actor X advanced to
///   sequence N" events between gateway processes
/// - Signed management-API sender pushing payloads to individual
///   connections
/// - Fanout coordinator reconciling bus events against the registry with
///   bounded retry and gone-connection reaping
pub mod bus;
pub mod config;
pub mod connection;
pub mod fanout;
pub mod push;
pub mod repository;
pub mod sender;
pub mod signing;

pub use bus::{
    validate_channel_name, BusError, ChangeBus, InMemoryChangeBus, PostgresChangeBus,
    StateChangeNotification,
};
pub use config::{BusConfig, FanoutConfig, PushConfig, StoreConfig};
pub use connection::{
    Connection, ConnectionError, ConnectionStore, InMemoryConnectionStore, CONNECTION_TTL_SECS,
};
pub use fanout::{FanoutCoordinator, FanoutMetrics, RetryPolicy};
pub use push::HttpConnectionSender;
pub use repository::PostgresConnectionStore;
pub use sender::{ConnectionInfo, ConnectionSender, InMemoryConnectionSender};
pub use signing::{AwsCredentials, RequestSigner, SignedHeaders};

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_fanout=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
