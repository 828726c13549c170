//! Database model definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Customer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Customer => "customer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "customer" => Some(Self::Customer),
            _ => None,
        }
    }
}

/// A customer or administrator account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    /// Identifier of the matching user on the panel, once created there.
    pub panel_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// A persisted refresh token (hash only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    pub user_id: i64,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    /// Check if the token is still usable (not revoked and not expired).
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none() && self.expires_at > Utc::now()
    }
}

/// Lifecycle state of a server order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Ordered,
    Provisioning,
    Active,
    Suspended,
    Cancelled,
    Failed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordered => "ordered",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ordered" => Some(Self::Ordered),
            "provisioning" => Some(Self::Provisioning),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A provisioned (or pending) game-server order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub uuid: String,
    pub user_id: i64,
    /// Plan name, a key into the plan catalog.
    pub plan: String,
    /// Order parameters captured at checkout (type, location, version, ...).
    pub config: serde_json::Value,
    pub status: ServerStatus,
    pub suspended: bool,
    pub initialised: bool,
    /// Identifier of the server on the panel, once provisioned.
    pub panel_id: Option<String>,
    pub stripe_tx_id: Option<String>,
    pub referral_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Audit event types for server lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEventType {
    #[serde(rename = "server.ordered")]
    Ordered,
    #[serde(rename = "server.provisioned")]
    Provisioned,
    #[serde(rename = "server.provision_failed")]
    ProvisionFailed,
    #[serde(rename = "server.suspended")]
    Suspended,
    #[serde(rename = "server.unsuspended")]
    Unsuspended,
}

impl ServerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordered => "server.ordered",
            Self::Provisioned => "server.provisioned",
            Self::ProvisionFailed => "server.provision_failed",
            Self::Suspended => "server.suspended",
            Self::Unsuspended => "server.unsuspended",
        }
    }
}

/// Append-only audit row for a server lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    pub id: i64,
    pub server_id: i64,
    pub event_type: String,
    /// Acting user, if the transition was operator-initiated.
    pub actor: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An infrastructure node pushing telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub region: String,
    pub ip_address: Option<String>,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Determine whether the supplied raw token matches this node.
    pub fn matches_token(&self, raw_token: &str) -> bool {
        constant_time_eq(&super::store::hash_token(raw_token), &self.token_hash)
    }
}

/// A regional edge proxy pulling server bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalProxy {
    pub id: i64,
    pub name: String,
    pub region: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl RegionalProxy {
    pub fn matches_token(&self, raw_token: &str) -> bool {
        constant_time_eq(&super::store::hash_token(raw_token), &self.token_hash)
    }
}

/// Latest-known telemetry for a node (one row per node_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryNode {
    pub node_id: String,
    pub cpu_pct: f64,
    pub iowait_pct: f64,
    pub updated_at: DateTime<Utc>,
}

/// Latest-known telemetry for a game server (one row per server_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryServer {
    pub server_id: String,
    pub node_id: String,
    pub players_online: Option<i64>,
    pub cpu_pct: f64,
    pub io_write_bytes_per_s: f64,
    pub updated_at: DateTime<Utc>,
}

/// A referral code owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralCode {
    pub id: i64,
    pub user_id: i64,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

/// A credited referral transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralTransaction {
    pub id: i64,
    pub referral_id: i64,
    pub server_id: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Compare two equal-purpose strings without short-circuiting on the first
/// mismatch. Inputs are hex digests, so length normally matches.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_auth_token_is_active() {
        let token = AuthToken {
            id: 1,
            user_id: 1,
            token_hash: "abc".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
            revoked_at: None,
        };
        assert!(token.is_active());

        let revoked = AuthToken {
            revoked_at: Some(Utc::now()),
            ..token.clone()
        };
        assert!(!revoked.is_active());

        let expired = AuthToken {
            expires_at: Utc::now() - Duration::seconds(1),
            ..token
        };
        assert!(!expired.is_active());
    }

    #[test]
    fn test_node_token_match() {
        let raw = "node-token-raw";
        let node = Node {
            id: "n1".to_string(),
            name: "node-1".to_string(),
            region: "eu.de".to_string(),
            ip_address: None,
            token_hash: crate::db::store::hash_token(raw),
            last_active_at: None,
            last_used_at: None,
        };
        assert!(node.matches_token(raw));
        assert!(!node.matches_token("wrong"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ServerStatus::Ordered,
            ServerStatus::Provisioning,
            ServerStatus::Active,
            ServerStatus::Suspended,
            ServerStatus::Cancelled,
            ServerStatus::Failed,
        ] {
            assert_eq!(ServerStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ServerStatus::parse("bogus"), None);
    }
}
