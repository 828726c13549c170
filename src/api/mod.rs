//! HTTP API: routing, shared state, and the admin auth extractor.

pub mod handlers;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::AuthService;
use crate::capacity::CapacityCache;
use crate::config::Config;
use crate::db::{Store, User};
use crate::error::ApiError;
use crate::panel::{PanelClient, Provisioner};
use crate::plans::PlanCatalog;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub auth: AuthService,
    pub catalog: Arc<PlanCatalog>,
    pub capacity: CapacityCache,
    pub panel: PanelClient,
    pub provisioner: Provisioner,
}

/// An authenticated administrator, extracted from the bearer access token.
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError::Unauthorized)?;
        let user = state
            .auth
            .authenticate(&token)
            .await
            .map_err(|_| ApiError::Unauthorized)?;

        if !user.is_admin() {
            return Err(ApiError::Forbidden(
                "Administrator access required".to_string(),
            ));
        }

        Ok(AdminUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(String::from)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Auth
        .route("/api/auth/register", post(handlers::register))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/auth/refresh", post(handlers::refresh))
        .route("/api/auth/logout", post(handlers::logout))
        .route("/api/auth/me", get(handlers::me))
        // Storefront
        .route("/api/plans", get(handlers::list_plans))
        .route("/api/plans/recommend", get(handlers::recommend_plan))
        .route("/api/locations", get(handlers::list_locations))
        // Admin-gated inventory and operations
        .route("/api/servers", get(handlers::admin_list_servers))
        .route("/api/servers/{id}", get(handlers::admin_get_server))
        .route(
            "/api/servers/{id}/provision",
            post(handlers::admin_provision_server),
        )
        .route(
            "/api/servers/{id}/suspend",
            post(handlers::admin_suspend_server),
        )
        .route(
            "/api/servers/{id}/unsuspend",
            post(handlers::admin_unsuspend_server),
        )
        .route("/api/servers/{id}/power", post(handlers::admin_power_server))
        .route("/api/users", get(handlers::admin_list_users))
        .route("/api/users/{id}", get(handlers::admin_get_user))
        .route(
            "/api/nodes",
            get(handlers::admin_list_nodes).post(handlers::admin_create_node),
        )
        .route(
            "/api/regional-proxies",
            get(handlers::admin_list_proxies).post(handlers::admin_create_proxy),
        )
        .route("/api/regional-proxies/{id}", get(handlers::admin_get_proxy))
        .route("/api/referrals", post(handlers::admin_create_referral))
        .route("/api/referrals/{code}", get(handlers::check_referral))
        .route(
            "/api/referrals/{code}/transactions",
            get(handlers::admin_referral_transactions),
        )
        .route("/api/metrics", get(handlers::admin_metrics))
        .route(
            "/api/capacity",
            get(handlers::admin_capacity).post(handlers::admin_refresh_capacity),
        )
        // Agents and proxies
        .route(
            "/api/internal/nodes/{id}/telemetry",
            post(handlers::ingest_node_telemetry),
        )
        .route(
            "/api/internal/proxy-bindings",
            get(handlers::proxy_bindings),
        )
        // Billing
        .route("/api/webhooks/stripe", post(handlers::stripe_webhook))
        .with_state(state)
}
