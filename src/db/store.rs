//! SQLite-backed store for accounts, orders, inventory, and telemetry.

use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

use super::models::{
    AuthToken, Node, ReferralCode, ReferralTransaction, RegionalProxy, Server, ServerEvent,
    ServerEventType, ServerStatus, TelemetryNode, TelemetryServer, User, UserRole,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Email already registered")]
    EmailTaken,

    #[error("Record not found")]
    NotFound,

    #[error("Invalid stored value: {0}")]
    InvalidRow(String),
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new random token.
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// A single server telemetry reading within an ingestion batch.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerTelemetryRow {
    pub server_id: String,
    pub players_online: Option<i64>,
    pub cpu_pct: f64,
    pub io_write_bytes_per_s: f64,
}

/// A server-to-node binding handed to regional proxies.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyBinding {
    pub server_id: String,
    pub node_id: String,
    pub node_address: Option<String>,
}

/// Entity counts for the admin metrics endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreMetrics {
    pub users: i64,
    pub servers: i64,
    pub nodes: i64,
    pub servers_by_status: std::collections::BTreeMap<String, i64>,
}

/// Orchestrator database.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Configuration(
                    format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    )
                    .into(),
                ))
            })?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        Self::connect(&db_url, 5).await
    }

    /// Open an in-memory database. Used by tests. A single connection is
    /// required: every `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'customer',
                panel_user_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auth_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                token_hash TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_auth_tokens_hash ON auth_tokens(token_hash);
            CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT UNIQUE NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id),
                plan TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'ordered',
                suspended INTEGER NOT NULL DEFAULT 0,
                initialised INTEGER NOT NULL DEFAULT 0,
                panel_id TEXT,
                stripe_tx_id TEXT,
                referral_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_servers_user ON servers(user_id);
            CREATE INDEX IF NOT EXISTS idx_servers_status ON servers(status);

            CREATE TABLE IF NOT EXISTS server_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id INTEGER NOT NULL REFERENCES servers(id),
                event_type TEXT NOT NULL,
                actor TEXT,
                detail TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_server_events_server ON server_events(server_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                region TEXT NOT NULL,
                ip_address TEXT,
                token_hash TEXT UNIQUE NOT NULL,
                last_active_at TEXT,
                last_used_at TEXT
            );

            CREATE TABLE IF NOT EXISTS regional_proxies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                region TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                token_hash TEXT UNIQUE NOT NULL,
                last_active_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_node (
                node_id TEXT PRIMARY KEY,
                cpu_pct REAL NOT NULL,
                iowait_pct REAL NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry_server (
                server_id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                players_online INTEGER,
                cpu_pct REAL NOT NULL,
                io_write_bytes_per_s REAL NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry_node_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                cpu_pct REAL NOT NULL,
                iowait_pct REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry_server_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                players_online INTEGER,
                cpu_pct REAL NOT NULL,
                io_write_bytes_per_s REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_telemetry_server_node ON telemetry_server(node_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS referral_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                code TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS referral_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                referral_id INTEGER NOT NULL REFERENCES referral_codes(id),
                server_id INTEGER UNIQUE NOT NULL REFERENCES servers(id),
                amount_cents INTEGER NOT NULL,
                currency TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Users

    pub async fn create_user(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
        role: UserRole,
    ) -> Result<User, StoreError> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO users (name, email, password_hash, role, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .bind(role.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(r) => r.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::EmailTaken)
            }
            Err(e) => return Err(e.into()),
        };

        Ok(User {
            id,
            name: name.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role,
            panel_user_id: None,
            created_at: now,
        })
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY id LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_user).collect()
    }

    pub async fn count_users(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn set_panel_user_id(&self, user_id: i64, panel_user_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET panel_user_id = ? WHERE id = ?")
            .bind(panel_user_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // Auth tokens

    pub async fn insert_auth_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<AuthToken, StoreError> {
        let now = Utc::now();

        let id = sqlx::query(
            r#"
            INSERT INTO auth_tokens (user_id, token_hash, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(AuthToken {
            id,
            user_id,
            token_hash: token_hash.to_string(),
            created_at: now,
            expires_at,
            revoked_at: None,
        })
    }

    pub async fn get_auth_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthToken>, StoreError> {
        let row = sqlx::query("SELECT * FROM auth_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_auth_token(&r)).transpose()
    }

    pub async fn revoke_auth_token(&self, token_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE auth_tokens SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(token_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke_all_auth_tokens(&self, user_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE auth_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete tokens whose expiry is strictly before the cutoff. Callers pass
    /// `now - 90 days`; a token expired exactly at the cutoff is retained.
    pub async fn purge_expired_auth_tokens(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE expires_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        debug!(deleted = result.rows_affected(), "Purged expired auth tokens");
        Ok(result.rows_affected())
    }

    // Servers

    pub async fn create_server(
        &self,
        uuid: &str,
        user_id: i64,
        plan: &str,
        config: &serde_json::Value,
        stripe_tx_id: Option<&str>,
        referral_id: Option<i64>,
    ) -> Result<Server, StoreError> {
        let now = Utc::now();

        let id = sqlx::query(
            r#"
            INSERT INTO servers (uuid, user_id, plan, config, status, stripe_tx_id, referral_id, created_at)
            VALUES (?, ?, ?, ?, 'ordered', ?, ?, ?)
            "#,
        )
        .bind(uuid)
        .bind(user_id)
        .bind(plan)
        .bind(config.to_string())
        .bind(stripe_tx_id)
        .bind(referral_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.record_server_event(id, ServerEventType::Ordered, None, serde_json::json!({ "plan": plan }))
            .await?;

        info!(uuid = %uuid, plan = %plan, "Created server order");

        Ok(Server {
            id,
            uuid: uuid.to_string(),
            user_id,
            plan: plan.to_string(),
            config: config.clone(),
            status: ServerStatus::Ordered,
            suspended: false,
            initialised: false,
            panel_id: None,
            stripe_tx_id: stripe_tx_id.map(String::from),
            referral_id,
            created_at: now,
        })
    }

    pub async fn get_server(&self, id: i64) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_server(&r)).transpose()
    }

    pub async fn get_server_by_uuid(&self, uuid: &str) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query("SELECT * FROM servers WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_server(&r)).transpose()
    }

    pub async fn list_servers(
        &self,
        user_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Server>, StoreError> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query("SELECT * FROM servers WHERE user_id = ? ORDER BY id LIMIT ? OFFSET ?")
                    .bind(uid)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM servers ORDER BY id LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_server).collect()
    }

    pub async fn count_servers(&self, user_id: Option<i64>) -> Result<i64, StoreError> {
        let count = match user_id {
            Some(uid) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM servers WHERE user_id = ?")
                    .bind(uid)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM servers")
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(count)
    }

    /// Persist panel identifiers after a successful provision.
    pub async fn mark_provisioned(&self, id: i64, panel_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE servers SET panel_id = ?, initialised = 1, status = 'active' WHERE id = ?",
        )
        .bind(panel_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_server_status(&self, id: i64, status: ServerStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE servers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_server_suspended(&self, id: i64, suspended: bool) -> Result<(), StoreError> {
        let status = if suspended {
            ServerStatus::Suspended
        } else {
            ServerStatus::Active
        };

        sqlx::query("UPDATE servers SET suspended = ?, status = ? WHERE id = ?")
            .bind(suspended)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_server_event(
        &self,
        server_id: i64,
        event_type: ServerEventType,
        actor: Option<&str>,
        detail: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO server_events (server_id, event_type, actor, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(server_id)
        .bind(event_type.as_str())
        .bind(actor)
        .bind(detail.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_server_events(
        &self,
        server_id: i64,
        limit: i64,
    ) -> Result<Vec<ServerEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM server_events WHERE server_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(server_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_server_event).collect()
    }

    // Nodes

    /// Create a node and return the raw telemetry token alongside it. The raw
    /// token is shown once and only its hash is stored.
    pub async fn create_node(
        &self,
        name: &str,
        region: &str,
        ip_address: Option<&str>,
    ) -> Result<(String, Node), StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = generate_token();
        let token_hash = hash_token(&token);

        sqlx::query(
            r#"
            INSERT INTO nodes (id, name, region, ip_address, token_hash)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(region)
        .bind(ip_address)
        .bind(&token_hash)
        .execute(&self.pool)
        .await?;

        info!(node_id = %id, region = %region, "Registered node");

        Ok((
            token,
            Node {
                id,
                name: name.to_string(),
                region: region.to_string(),
                ip_address: ip_address.map(String::from),
                token_hash,
                last_active_at: None,
                last_used_at: None,
            },
        ))
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_node(&r)).transpose()
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_node).collect()
    }

    pub async fn count_nodes(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn touch_node_activity(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE nodes SET last_active_at = ?, last_used_at = ? WHERE id = ?")
            .bind(timestamp.to_rfc3339())
            .bind(timestamp.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // Regional proxies

    pub async fn create_proxy(
        &self,
        name: &str,
        region: &str,
        endpoint: &str,
    ) -> Result<(String, RegionalProxy), StoreError> {
        let token = generate_token();
        let token_hash = hash_token(&token);

        let id = sqlx::query(
            r#"
            INSERT INTO regional_proxies (name, region, endpoint, token_hash)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(region)
        .bind(endpoint)
        .bind(&token_hash)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(proxy_id = id, region = %region, "Registered regional proxy");

        Ok((
            token,
            RegionalProxy {
                id,
                name: name.to_string(),
                region: region.to_string(),
                endpoint: endpoint.to_string(),
                token_hash,
                last_active_at: None,
            },
        ))
    }

    pub async fn get_proxy(&self, id: i64) -> Result<Option<RegionalProxy>, StoreError> {
        let row = sqlx::query("SELECT * FROM regional_proxies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_proxy(&r)).transpose()
    }

    pub async fn get_proxy_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RegionalProxy>, StoreError> {
        let row = sqlx::query("SELECT * FROM regional_proxies WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_proxy(&r)).transpose()
    }

    pub async fn list_proxies(&self) -> Result<Vec<RegionalProxy>, StoreError> {
        let rows = sqlx::query("SELECT * FROM regional_proxies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_proxy).collect()
    }

    pub async fn touch_proxy_activity(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE regional_proxies SET last_active_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Server-to-node bindings for the proxies serving a region.
    pub async fn list_bindings_for_region(
        &self,
        region: &str,
    ) -> Result<Vec<ProxyBinding>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ts.server_id, ts.node_id, n.ip_address
            FROM telemetry_server ts
            JOIN nodes n ON n.id = ts.node_id
            WHERE n.region = ?
            ORDER BY ts.server_id
            "#,
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| ProxyBinding {
                server_id: r.get("server_id"),
                node_id: r.get("node_id"),
                node_address: r.get("ip_address"),
            })
            .collect())
    }

    // Telemetry

    /// Upsert the latest node reading and append a history sample.
    pub async fn record_node_telemetry(
        &self,
        node_id: &str,
        cpu_pct: f64,
        iowait_pct: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO telemetry_node (node_id, cpu_pct, iowait_pct, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                cpu_pct = excluded.cpu_pct,
                iowait_pct = excluded.iowait_pct,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node_id)
        .bind(cpu_pct)
        .bind(iowait_pct)
        .bind(timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO telemetry_node_samples (node_id, cpu_pct, iowait_pct, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(node_id)
        .bind(cpu_pct)
        .bind(iowait_pct)
        .bind(timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert the latest server readings and append history samples.
    pub async fn record_server_telemetry(
        &self,
        node_id: &str,
        readings: &[ServerTelemetryRow],
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for reading in readings {
            sqlx::query(
                r#"
                INSERT INTO telemetry_server
                    (server_id, node_id, players_online, cpu_pct, io_write_bytes_per_s, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(server_id) DO UPDATE SET
                    node_id = excluded.node_id,
                    players_online = excluded.players_online,
                    cpu_pct = excluded.cpu_pct,
                    io_write_bytes_per_s = excluded.io_write_bytes_per_s,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&reading.server_id)
            .bind(node_id)
            .bind(reading.players_online)
            .bind(reading.cpu_pct)
            .bind(reading.io_write_bytes_per_s)
            .bind(timestamp.to_rfc3339())
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO telemetry_server_samples
                    (server_id, node_id, players_online, cpu_pct, io_write_bytes_per_s, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&reading.server_id)
            .bind(node_id)
            .bind(reading.players_online)
            .bind(reading.cpu_pct)
            .bind(reading.io_write_bytes_per_s)
            .bind(timestamp.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get_node_telemetry(
        &self,
        node_id: &str,
    ) -> Result<Option<TelemetryNode>, StoreError> {
        let row = sqlx::query("SELECT * FROM telemetry_node WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_telemetry_node(&r)).transpose()
    }

    pub async fn get_server_telemetry(
        &self,
        server_id: &str,
    ) -> Result<Option<TelemetryServer>, StoreError> {
        let row = sqlx::query("SELECT * FROM telemetry_server WHERE server_id = ?")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_telemetry_server(&r)).transpose()
    }

    /// Delete latest-value telemetry rows not updated since the cutoff.
    /// Strict comparison: a row updated exactly at the cutoff is retained.
    /// History samples are kept.
    pub async fn purge_stale_telemetry(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<(u64, u64), StoreError> {
        let nodes = sqlx::query("DELETE FROM telemetry_node WHERE updated_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();

        let servers = sqlx::query("DELETE FROM telemetry_server WHERE updated_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(nodes, servers, "Purged stale telemetry");
        Ok((nodes, servers))
    }

    // Referrals

    pub async fn create_referral_code(
        &self,
        user_id: i64,
        code: &str,
    ) -> Result<ReferralCode, StoreError> {
        let now = Utc::now();

        let id = sqlx::query(
            "INSERT INTO referral_codes (user_id, code, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(code)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(ReferralCode {
            id,
            user_id,
            code: code.to_string(),
            created_at: now,
        })
    }

    pub async fn get_referral_code(&self, code: &str) -> Result<Option<ReferralCode>, StoreError> {
        let row = sqlx::query("SELECT * FROM referral_codes WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_referral_code(&r)).transpose()
    }

    /// Records a commission for a referred sale. At most one transaction
    /// exists per server, so replaying the same sale is a no-op and
    /// returns `None`.
    pub async fn record_referral_transaction(
        &self,
        referral_id: i64,
        server_id: i64,
        amount_cents: i64,
        currency: &str,
    ) -> Result<Option<ReferralTransaction>, StoreError> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO referral_transactions (referral_id, server_id, amount_cents, currency, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(server_id) DO NOTHING
            "#,
        )
        .bind(referral_id)
        .bind(server_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(ReferralTransaction {
            id: result.last_insert_rowid(),
            referral_id,
            server_id,
            amount_cents,
            currency: currency.to_string(),
            created_at: now,
        }))
    }

    pub async fn list_referral_transactions(
        &self,
        referral_id: i64,
    ) -> Result<Vec<ReferralTransaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM referral_transactions WHERE referral_id = ? ORDER BY id",
        )
        .bind(referral_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_referral_transaction).collect()
    }

    // Metrics

    pub async fn metrics(&self) -> Result<StoreMetrics, StoreError> {
        let users = self.count_users().await?;
        let servers = self.count_servers(None).await?;
        let nodes = self.count_nodes().await?;

        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM servers GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut servers_by_status = std::collections::BTreeMap::new();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            servers_by_status.insert(status, count);
        }

        Ok(StoreMetrics {
            users,
            servers,
            nodes,
            servers_by_status,
        })
    }
}

// Row mappers

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidRow(format!("bad timestamp: {value}")))
}

fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_datetime).transpose()
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, StoreError> {
    let role_str: String = row.get("role");
    let created_at: String = row.get("created_at");

    Ok(User {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: UserRole::parse(&role_str)
            .ok_or_else(|| StoreError::InvalidRow(format!("bad role: {role_str}")))?,
        panel_user_id: row.get("panel_user_id"),
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_auth_token(row: &sqlx::sqlite::SqliteRow) -> Result<AuthToken, StoreError> {
    let created_at: String = row.get("created_at");
    let expires_at: String = row.get("expires_at");
    let revoked_at: Option<String> = row.get("revoked_at");

    Ok(AuthToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token_hash: row.get("token_hash"),
        created_at: parse_datetime(&created_at)?,
        expires_at: parse_datetime(&expires_at)?,
        revoked_at: parse_optional_datetime(revoked_at)?,
    })
}

fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> Result<Server, StoreError> {
    let status_str: String = row.get("status");
    let config_str: String = row.get("config");
    let created_at: String = row.get("created_at");

    Ok(Server {
        id: row.get("id"),
        uuid: row.get("uuid"),
        user_id: row.get("user_id"),
        plan: row.get("plan"),
        config: serde_json::from_str(&config_str)
            .map_err(|e| StoreError::InvalidRow(format!("bad server config: {e}")))?,
        status: ServerStatus::parse(&status_str)
            .ok_or_else(|| StoreError::InvalidRow(format!("bad status: {status_str}")))?,
        suspended: row.get("suspended"),
        initialised: row.get("initialised"),
        panel_id: row.get("panel_id"),
        stripe_tx_id: row.get("stripe_tx_id"),
        referral_id: row.get("referral_id"),
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_server_event(row: &sqlx::sqlite::SqliteRow) -> Result<ServerEvent, StoreError> {
    let detail_str: String = row.get("detail");
    let created_at: String = row.get("created_at");

    Ok(ServerEvent {
        id: row.get("id"),
        server_id: row.get("server_id"),
        event_type: row.get("event_type"),
        actor: row.get("actor"),
        detail: serde_json::from_str(&detail_str)
            .map_err(|e| StoreError::InvalidRow(format!("bad event detail: {e}")))?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<Node, StoreError> {
    let last_active_at: Option<String> = row.get("last_active_at");
    let last_used_at: Option<String> = row.get("last_used_at");

    Ok(Node {
        id: row.get("id"),
        name: row.get("name"),
        region: row.get("region"),
        ip_address: row.get("ip_address"),
        token_hash: row.get("token_hash"),
        last_active_at: parse_optional_datetime(last_active_at)?,
        last_used_at: parse_optional_datetime(last_used_at)?,
    })
}

fn row_to_proxy(row: &sqlx::sqlite::SqliteRow) -> Result<RegionalProxy, StoreError> {
    let last_active_at: Option<String> = row.get("last_active_at");

    Ok(RegionalProxy {
        id: row.get("id"),
        name: row.get("name"),
        region: row.get("region"),
        endpoint: row.get("endpoint"),
        token_hash: row.get("token_hash"),
        last_active_at: parse_optional_datetime(last_active_at)?,
    })
}

fn row_to_telemetry_node(row: &sqlx::sqlite::SqliteRow) -> Result<TelemetryNode, StoreError> {
    let updated_at: String = row.get("updated_at");

    Ok(TelemetryNode {
        node_id: row.get("node_id"),
        cpu_pct: row.get("cpu_pct"),
        iowait_pct: row.get("iowait_pct"),
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_telemetry_server(row: &sqlx::sqlite::SqliteRow) -> Result<TelemetryServer, StoreError> {
    let updated_at: String = row.get("updated_at");

    Ok(TelemetryServer {
        server_id: row.get("server_id"),
        node_id: row.get("node_id"),
        players_online: row.get("players_online"),
        cpu_pct: row.get("cpu_pct"),
        io_write_bytes_per_s: row.get("io_write_bytes_per_s"),
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_referral_code(row: &sqlx::sqlite::SqliteRow) -> Result<ReferralCode, StoreError> {
    let created_at: String = row.get("created_at");

    Ok(ReferralCode {
        id: row.get("id"),
        user_id: row.get("user_id"),
        code: row.get("code"),
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_referral_transaction(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ReferralTransaction, StoreError> {
    let created_at: String = row.get("created_at");

    Ok(ReferralTransaction {
        id: row.get("id"),
        referral_id: row.get("referral_id"),
        server_id: row.get("server_id"),
        amount_cents: row.get("amount_cents"),
        currency: row.get("currency"),
        created_at: parse_datetime(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> Store {
        Store::in_memory().await.expect("in-memory store")
    }

    async fn seed_user(store: &Store) -> User {
        store
            .create_user("Admin", "admin@example.com", "hash", UserRole::Admin)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = store().await;
        seed_user(&store).await;

        let err = store
            .create_user("Other", "admin@example.com", "hash", UserRole::Customer)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmailTaken));
    }

    #[tokio::test]
    async fn test_auth_token_lifecycle() {
        let store = store().await;
        let user = seed_user(&store).await;

        let hash = hash_token("refresh-token");
        store
            .insert_auth_token(user.id, &hash, Utc::now() + Duration::days(30))
            .await
            .unwrap();

        let token = store.get_auth_token_by_hash(&hash).await.unwrap().unwrap();
        assert!(token.is_active());

        assert!(store.revoke_auth_token(&hash).await.unwrap());
        let token = store.get_auth_token_by_hash(&hash).await.unwrap().unwrap();
        assert!(!token.is_active());

        // Revoking again is a no-op
        assert!(!store.revoke_auth_token(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired_tokens_boundary() {
        let store = store().await;
        let user = seed_user(&store).await;
        let cutoff = Utc::now() - Duration::days(90);

        store
            .insert_auth_token(user.id, "old", cutoff - Duration::seconds(5))
            .await
            .unwrap();
        store
            .insert_auth_token(user.id, "boundary", cutoff + Duration::seconds(5))
            .await
            .unwrap();

        let deleted = store.purge_expired_auth_tokens(cutoff).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_auth_token_by_hash("old").await.unwrap().is_none());
        assert!(store
            .get_auth_token_by_hash("boundary")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_server_lifecycle_and_events() {
        let store = store().await;
        let user = seed_user(&store).await;

        let config = serde_json::json!({ "type": "paper", "location": "de" });
        let server = store
            .create_server("uuid-1", user.id, "rabbit", &config, None, None)
            .await
            .unwrap();
        assert_eq!(server.status, ServerStatus::Ordered);
        assert!(!server.initialised);

        store.mark_provisioned(server.id, "42").await.unwrap();
        let server = store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(server.panel_id.as_deref(), Some("42"));
        assert!(server.initialised);
        assert_eq!(server.status, ServerStatus::Active);

        store.set_server_suspended(server.id, true).await.unwrap();
        let server = store.get_server_by_uuid("uuid-1").await.unwrap().unwrap();
        assert!(server.suspended);
        assert_eq!(server.status, ServerStatus::Suspended);

        let events = store.list_server_events(server.id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "server.ordered");
    }

    #[tokio::test]
    async fn test_node_telemetry_upsert_is_idempotent() {
        let store = store().await;
        let (_, node) = store.create_node("node-1", "eu.de", None).await.unwrap();

        let t1 = Utc::now();
        store
            .record_node_telemetry(&node.id, 10.0, 1.0, t1)
            .await
            .unwrap();
        store
            .record_node_telemetry(&node.id, 55.0, 2.0, t1 + Duration::seconds(30))
            .await
            .unwrap();

        // Latest-value table keeps a single row, updated in place
        let latest = store.get_node_telemetry(&node.id).await.unwrap().unwrap();
        assert_eq!(latest.cpu_pct, 55.0);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_node")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // History table grows monotonically
        let samples: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_node_samples")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(samples, 2);
    }

    #[tokio::test]
    async fn test_server_telemetry_upsert_is_idempotent() {
        let store = store().await;
        let (_, node) = store.create_node("node-1", "eu.de", None).await.unwrap();

        let reading = ServerTelemetryRow {
            server_id: "srv-1".to_string(),
            players_online: Some(3),
            cpu_pct: 40.0,
            io_write_bytes_per_s: 1024.0,
        };
        store
            .record_server_telemetry(&node.id, &[reading.clone()], Utc::now())
            .await
            .unwrap();

        let updated = ServerTelemetryRow {
            players_online: Some(7),
            ..reading
        };
        store
            .record_server_telemetry(&node.id, &[updated], Utc::now())
            .await
            .unwrap();

        let latest = store.get_server_telemetry("srv-1").await.unwrap().unwrap();
        assert_eq!(latest.players_online, Some(7));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_server")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_purge_stale_telemetry_boundary() {
        let store = store().await;
        let (_, node) = store.create_node("node-1", "eu.de", None).await.unwrap();
        let cutoff = Utc::now() - Duration::hours(24);

        store
            .record_node_telemetry(&node.id, 1.0, 0.0, cutoff - Duration::minutes(1))
            .await
            .unwrap();

        let (nodes, _) = store.purge_stale_telemetry(cutoff).await.unwrap();
        assert_eq!(nodes, 1);

        // Fresh rows survive
        store
            .record_node_telemetry(&node.id, 1.0, 0.0, cutoff + Duration::minutes(1))
            .await
            .unwrap();
        let (nodes, _) = store.purge_stale_telemetry(cutoff).await.unwrap();
        assert_eq!(nodes, 0);
    }

    #[tokio::test]
    async fn test_proxy_bindings_filtered_by_region() {
        let store = store().await;
        let (_, node_de) = store
            .create_node("node-de", "eu.de", Some("10.0.0.1"))
            .await
            .unwrap();
        let (_, node_fi) = store.create_node("node-fi", "eu.fi", None).await.unwrap();

        let now = Utc::now();
        store
            .record_server_telemetry(
                &node_de.id,
                &[ServerTelemetryRow {
                    server_id: "srv-de".to_string(),
                    players_online: None,
                    cpu_pct: 0.0,
                    io_write_bytes_per_s: 0.0,
                }],
                now,
            )
            .await
            .unwrap();
        store
            .record_server_telemetry(
                &node_fi.id,
                &[ServerTelemetryRow {
                    server_id: "srv-fi".to_string(),
                    players_online: None,
                    cpu_pct: 0.0,
                    io_write_bytes_per_s: 0.0,
                }],
                now,
            )
            .await
            .unwrap();

        let bindings = store.list_bindings_for_region("eu.de").await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].server_id, "srv-de");
        assert_eq!(bindings[0].node_address.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_referral_bookkeeping() {
        let store = store().await;
        let user = seed_user(&store).await;
        let code = store.create_referral_code(user.id, "FRIEND10").await.unwrap();

        let config = serde_json::json!({});
        let server = store
            .create_server("uuid-r", user.id, "parrot", &config, None, Some(code.id))
            .await
            .unwrap();

        let first = store
            .record_referral_transaction(code.id, server.id, 450, "USD")
            .await
            .unwrap();
        assert!(first.is_some());

        // A replayed sale must not pay the referrer twice.
        let replay = store
            .record_referral_transaction(code.id, server.id, 450, "USD")
            .await
            .unwrap();
        assert!(replay.is_none());

        let txs = store.list_referral_transactions(code.id).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount_cents, 450);
    }

    #[tokio::test]
    async fn test_metrics_counts() {
        let store = store().await;
        let user = seed_user(&store).await;
        let config = serde_json::json!({});

        store
            .create_server("u1", user.id, "parrot", &config, None, None)
            .await
            .unwrap();
        let s2 = store
            .create_server("u2", user.id, "rabbit", &config, None, None)
            .await
            .unwrap();
        store.mark_provisioned(s2.id, "7").await.unwrap();

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.users, 1);
        assert_eq!(metrics.servers, 2);
        assert_eq!(metrics.servers_by_status.get("ordered"), Some(&1));
        assert_eq!(metrics.servers_by_status.get("active"), Some(&1));
    }
}
