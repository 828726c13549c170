//! Request handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::password::hash_password;
use crate::capacity;
use crate::db::{Server, ServerEvent, ServerTelemetryRow, User, UserRole};
use crate::error::ApiError;
use crate::stripe::{self, WebhookEvent};

use super::{AdminUser, AppState};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// Auth

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

/// Self-service registration is closed by default; accounts come from the
/// storefront checkout flow.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    if !state.config.auth.registration_enabled {
        return Err(ApiError::Forbidden("Registration is disabled".to_string()));
    }

    if request.password.len() < 8 {
        return Err(ApiError::UnprocessableEntity(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let password_hash =
        hash_password(&request.password).map_err(|e| ApiError::Internal(e.into()))?;
    let user = state
        .store
        .create_user(&request.name, &request.email, &password_hash, UserRole::Customer)
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let pair = state.auth.login(&request.email, &request.password).await?;

    Ok(Json(TokenResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        user: pair.user,
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let pair = state.auth.refresh(&request.refresh_token).await?;

    Ok(Json(TokenResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        user: pair.user,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<StatusCode, ApiError> {
    state.auth.logout(&request.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(AdminUser(user): AdminUser) -> Json<User> {
    Json(user)
}

// Storefront

#[derive(Deserialize)]
pub struct PlansQuery {
    pub location: Option<String>,
}

pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlansQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let plans: Vec<_> = match &query.location {
        Some(location) => {
            if state.catalog.location(location).is_none() {
                return Err(ApiError::NotFound);
            }
            state.catalog.plans_for_location(location)
        }
        None => state.catalog.plans.iter().collect(),
    };

    Ok(Json(serde_json::json!({
        "plans": plans,
        "modpacks": state.catalog.modpacks,
    })))
}

#[derive(Deserialize)]
pub struct RecommendRequest {
    pub players: String,
    pub version: String,
    #[serde(rename = "type")]
    pub server_type: String,
}

pub async fn recommend_plan(
    State(state): State<AppState>,
    Query(request): Query<RecommendRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let plan = state
        .catalog
        .recommend(&request.players, &request.version, &request.server_type)
        .and_then(|name| state.catalog.plan(name));

    Ok(Json(serde_json::json!({ "plan": plan })))
}

/// Locations with a live availability flag. A location is available when
/// some node there can still fit the smallest plan sold for it.
pub async fn list_locations(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut locations = Vec::with_capacity(state.catalog.locations.len());

    for location in &state.catalog.locations {
        let min_ram_mb = state
            .catalog
            .min_ram_mb_for_location(&location.key)
            .unwrap_or(1024);
        let available = state
            .capacity
            .location_available(&location.panel_location, min_ram_mb)
            .await;

        locations.push(serde_json::json!({
            "key": location.key,
            "title": location.title,
            "flag": location.flag,
            "available": available,
        }));
    }

    Ok(Json(serde_json::json!({ "locations": locations })))
}

// Admin

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
    pub user_id: Option<i64>,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    25
}

impl PageQuery {
    fn clamp(&self) -> (i64, i64) {
        let per_page = self.per_page.clamp(1, 100);
        let page = self.page.max(1);
        (per_page, (page - 1) * per_page)
    }
}

#[derive(Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

pub async fn admin_list_servers(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<Server>>, ApiError> {
    let (per_page, offset) = query.clamp();
    let data = state
        .store
        .list_servers(query.user_id, per_page, offset)
        .await?;
    let total = state.store.count_servers(query.user_id).await?;

    Ok(Json(Paginated {
        data,
        total,
        page: query.page.max(1),
        per_page,
    }))
}

#[derive(Serialize)]
pub struct ServerDetail {
    #[serde(flatten)]
    pub server: Server,
    pub events: Vec<ServerEvent>,
}

pub async fn admin_get_server(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ServerDetail>, ApiError> {
    let server = state.store.get_server(id).await?.ok_or(ApiError::NotFound)?;
    let events = state.store.list_server_events(id, 50).await?;
    Ok(Json(ServerDetail { server, events }))
}

pub async fn admin_provision_server(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Server>, ApiError> {
    info!(server = id, admin = %admin.email, "Manual provision requested");
    let server = state.provisioner.initialise_server(id).await?;
    Ok(Json(server))
}

pub async fn admin_suspend_server(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    info!(server = id, admin = %admin.email, "Suspend requested");
    state.provisioner.suspend_server(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn admin_unsuspend_server(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    info!(server = id, admin = %admin.email, "Unsuspend requested");
    state.provisioner.unsuspend_server(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PowerRequest {
    pub signal: String,
}

pub async fn admin_power_server(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<PowerRequest>,
) -> Result<StatusCode, ApiError> {
    let server = state.store.get_server(id).await?.ok_or(ApiError::NotFound)?;
    let panel_id: i64 = server
        .panel_id
        .as_deref()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::Conflict("Server is not provisioned yet".to_string()))?;

    let panel_server = state.panel.get_server(panel_id).await?;
    state
        .panel
        .send_power_signal(&panel_server.identifier, &request.signal)
        .await?;

    info!(
        server = id,
        signal = %request.signal,
        admin = %admin.email,
        "Power signal sent"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn admin_list_users(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<User>>, ApiError> {
    let (per_page, offset) = query.clamp();
    let data = state.store.list_users(per_page, offset).await?;
    let total = state.store.count_users().await?;

    Ok(Json(Paginated {
        data,
        total,
        page: query.page.max(1),
        per_page,
    }))
}

pub async fn admin_get_user(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    let user = state.store.get_user(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(user))
}

#[derive(Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub region: String,
    pub ip_address: Option<String>,
}

/// Register a telemetry node. The raw token appears in this response only;
/// the store keeps its hash.
pub async fn admin_create_node(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Json(request): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (token, node) = state
        .store
        .create_node(&request.name, &request.region, request.ip_address.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "token": token, "node": node })),
    ))
}

pub async fn admin_list_nodes(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let nodes = state.store.list_nodes().await?;
    Ok(Json(serde_json::json!({ "nodes": nodes })))
}

#[derive(Deserialize)]
pub struct CreateProxyRequest {
    pub name: String,
    pub region: String,
    pub endpoint: String,
}

pub async fn admin_create_proxy(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Json(request): Json<CreateProxyRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (token, proxy) = state
        .store
        .create_proxy(&request.name, &request.region, &request.endpoint)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "token": token, "proxy": proxy })),
    ))
}

pub async fn admin_list_proxies(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let proxies = state.store.list_proxies().await?;
    Ok(Json(serde_json::json!({ "proxies": proxies })))
}

pub async fn admin_get_proxy(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<crate::db::RegionalProxy>, ApiError> {
    let proxy = state.store.get_proxy(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(proxy))
}

pub async fn admin_metrics(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
) -> Result<Json<crate::db::StoreMetrics>, ApiError> {
    let metrics = state.store.metrics().await?;
    Ok(Json(metrics))
}

pub async fn admin_capacity(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
) -> Result<Json<capacity::CapacitySnapshot>, ApiError> {
    let snapshot = state.capacity.snapshot().await.ok_or(ApiError::NotFound)?;
    Ok(Json(snapshot))
}

pub async fn admin_refresh_capacity(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
) -> Result<Json<capacity::CapacitySnapshot>, ApiError> {
    info!(admin = %admin.email, "Manual capacity refresh requested");
    let snapshot = capacity::refresh_once(&state.panel, &state.capacity)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(snapshot))
}

// Referrals

/// Storefront check of a referral code before checkout.
pub async fn check_referral(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let valid = state.store.get_referral_code(&code).await?.is_some();
    Ok(Json(serde_json::json!({ "code": code, "valid": valid })))
}

#[derive(Deserialize)]
pub struct CreateReferralRequest {
    pub user_id: i64,
    pub code: String,
}

pub async fn admin_create_referral(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Json(request): Json<CreateReferralRequest>,
) -> Result<(StatusCode, Json<crate::db::ReferralCode>), ApiError> {
    state
        .store
        .get_user(request.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let referral = state
        .store
        .create_referral_code(request.user_id, &request.code)
        .await?;

    Ok((StatusCode::CREATED, Json(referral)))
}

pub async fn admin_referral_transactions(
    AdminUser(_): AdminUser,
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Vec<crate::db::ReferralTransaction>>, ApiError> {
    let referral = state
        .store
        .get_referral_code(&code)
        .await?
        .ok_or(ApiError::NotFound)?;
    let transactions = state.store.list_referral_transactions(referral.id).await?;
    Ok(Json(transactions))
}

// Telemetry ingestion

#[derive(Deserialize)]
pub struct TelemetryReport {
    pub node_id: String,
    pub cpu_pct: f64,
    pub iowait_pct: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub servers: Vec<ServerTelemetryRow>,
}

fn node_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get("x-node-token").and_then(|v| v.to_str().ok()) {
        return Some(token);
    }
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Node agents push a reading every cycle. The latest row is upserted and a
/// history sample appended, so replayed reports do not multiply rows.
pub async fn ingest_node_telemetry(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<TelemetryReport>,
) -> Result<StatusCode, ApiError> {
    let token = node_token(&headers).ok_or(ApiError::Unauthorized)?;
    let node = state
        .store
        .get_node(&node_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !node.matches_token(token) {
        return Err(ApiError::Unauthorized);
    }

    if report.node_id != node_id {
        return Err(ApiError::UnprocessableEntity(
            "Report node_id does not match URL".to_string(),
        ));
    }

    let timestamp = report.timestamp.unwrap_or_else(Utc::now);

    state
        .store
        .record_node_telemetry(&node_id, report.cpu_pct, report.iowait_pct, timestamp)
        .await?;
    state
        .store
        .record_server_telemetry(&node_id, &report.servers, timestamp)
        .await?;
    state.store.touch_node_activity(&node_id, timestamp).await?;

    Ok(StatusCode::ACCEPTED)
}

/// Regional proxies pull the server-to-node bindings for their region.
pub async fn proxy_bindings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = node_token(&headers).ok_or(ApiError::Unauthorized)?;
    let proxy = state
        .store
        .get_proxy_by_token_hash(&crate::db::store::hash_token(token))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    state.store.touch_proxy_activity(proxy.id).await?;
    let bindings = state.store.list_bindings_for_region(&proxy.region).await?;

    Ok(Json(serde_json::json!({
        "region": proxy.region,
        "bindings": bindings,
    })))
}

// Billing

/// Referrer share of a referred sale, in percent.
const REFERRAL_COMMISSION_PCT: i64 = 10;

/// Stripe webhook endpoint. Checkout completion provisions the paid order;
/// payment failure suspends it. Provisioning is idempotent, so a Stripe
/// retry after a transient failure is safe.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    stripe::verify_signature(
        &state.config.stripe.webhook_secret,
        signature,
        &body,
        Utc::now(),
        state.config.stripe.tolerance_secs(),
    )?;

    match stripe::parse_event(&body)? {
        WebhookEvent::CheckoutCompleted {
            order_uuid,
            session_id,
            amount_total_cents,
            currency,
        } => {
            let Some(server) = state.store.get_server_by_uuid(&order_uuid).await? else {
                warn!(order = %order_uuid, "Checkout completed for unknown order");
                return Ok(Json(serde_json::json!({ "status": "ignored" })));
            };

            info!(order = %order_uuid, session = %session_id, "Checkout completed");
            state.provisioner.initialise_server(server.id).await?;

            // Referred orders earn the referrer a cut of the sale. The store
            // keeps at most one transaction per server, so a redelivered
            // webhook does not pay the commission twice.
            if let (Some(referral_id), Some(amount)) = (server.referral_id, amount_total_cents) {
                let commission = amount * REFERRAL_COMMISSION_PCT / 100;
                let recorded = state
                    .store
                    .record_referral_transaction(
                        referral_id,
                        server.id,
                        commission,
                        currency.as_deref().unwrap_or("eur"),
                    )
                    .await?;
                if recorded.is_none() {
                    info!(order = %order_uuid, "Referral commission already recorded");
                }
            }

            Ok(Json(serde_json::json!({ "status": "provisioned" })))
        }
        WebhookEvent::PaymentFailed { order_uuid } => {
            let Some(server) = state.store.get_server_by_uuid(&order_uuid).await? else {
                warn!(order = %order_uuid, "Payment failed for unknown order");
                return Ok(Json(serde_json::json!({ "status": "ignored" })));
            };

            warn!(order = %order_uuid, "Payment failed, suspending server");
            state.provisioner.suspend_server(server.id).await?;

            Ok(Json(serde_json::json!({ "status": "suspended" })))
        }
        WebhookEvent::Ignored { event_type } => {
            Ok(Json(serde_json::json!({ "status": "ignored", "type": event_type })))
        }
    }
}
