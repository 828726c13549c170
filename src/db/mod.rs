//! Database module: models and the SQLite store.

pub mod models;
pub mod store;

pub use models::{
    AuthToken, Node, ReferralCode, ReferralTransaction, RegionalProxy, Server, ServerEvent,
    ServerEventType, ServerStatus, TelemetryNode, TelemetryServer, User, UserRole,
};
pub use store::{ProxyBinding, ServerTelemetryRow, Store, StoreError, StoreMetrics};
