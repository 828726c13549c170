//! Server placement and provisioning against the panel.
//!
//! Placement picks the node with the most free memory among those that can
//! fit the plan, then takes the node's first unassigned allocation. Nodes
//! report `memory` (configured capacity) and `allocated_resources.memory`
//! (sum of limits across their servers); free capacity is the difference.

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::SlackAlerter;
use crate::db::models::{Server, ServerEventType, ServerStatus, User};
use crate::db::store::{Store, StoreError};
use crate::plans::PlanCatalog;

use super::client::{PanelClient, PanelError};
use super::types::{
    CreatePanelServer, CreatePanelUser, DefaultAllocation, FeatureLimits, PanelAllocation,
    PanelEgg, PanelNode, ServerLimits,
};

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Unknown plan '{0}'")]
    UnknownPlan(String),

    #[error("Unknown location '{0}'")]
    UnknownLocation(String),

    #[error("Location '{0}' does not exist on the panel")]
    LocationNotOnPanel(String),

    #[error("No node in '{location}' has {required_mb} MB free")]
    NoCapacity { location: String, required_mb: i64 },

    #[error("Node '{0}' has no unassigned allocation")]
    NoAllocation(String),

    #[error("Minecraft nest not found on the panel")]
    NestNotFound,

    #[error("Egg '{0}' not found in the Minecraft nest")]
    EggNotFound(String),

    #[error("Invalid server config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The customer-facing order options stored in `servers.config`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerOrderConfig {
    pub location: String,
    #[serde(rename = "type")]
    pub server_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Optional docker image override; the egg's default is used otherwise.
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub version_id: Option<String>,
}

/// Map an ordered server type onto a panel egg name. Anything we do not
/// recognise is treated as a CurseForge modpack slug.
pub fn egg_name_for_type(server_type: &str) -> &'static str {
    match server_type {
        "vanilla" | "bukkit" | "bedrock" => "Vanilla Minecraft",
        "spigot" => "Spigot",
        "paper" => "Paper",
        "forge" => "Forge Minecraft",
        _ => "CurseForge Generic",
    }
}

/// Startup environment for the chosen egg.
pub fn environment_for(
    order: &ServerOrderConfig,
    egg_name: &str,
    curse_api_key: Option<&str>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("SERVER_JARFILE".to_string(), "server.jar".to_string());

    // Only the vanilla egg understands a pinned version.
    if order.server_type == "vanilla" {
        if let Some(version) = &order.version {
            env.insert("VANILLA_VERSION".to_string(), version.clone());
        }
    }

    if egg_name == "CurseForge Generic" {
        if let Some(project_id) = &order.project_id {
            env.insert("PROJECT_ID".to_string(), project_id.clone());
        }
        if let Some(version_id) = &order.version_id {
            env.insert("VERSION_ID".to_string(), version_id.clone());
        }
        if let Some(key) = curse_api_key {
            env.insert("API_KEY".to_string(), key.to_string());
        }
    }

    env
}

/// Pick the node with the most free memory among those that can fit the
/// plan. Returns `None` when no node is eligible.
pub fn pick_node<'a>(nodes: &[&'a PanelNode], required_mb: i64) -> Option<&'a PanelNode> {
    nodes
        .iter()
        .filter(|n| n.free_mb() >= required_mb)
        .max_by_key(|n| n.free_mb())
        .copied()
}

/// First unassigned allocation on a node.
pub fn pick_allocation<'a>(allocations: &[&'a PanelAllocation]) -> Option<&'a PanelAllocation> {
    allocations.iter().find(|a| !a.assigned).copied()
}

/// Orchestrates panel-side provisioning for ordered servers.
#[derive(Clone)]
pub struct Provisioner {
    store: Store,
    panel: PanelClient,
    catalog: Arc<PlanCatalog>,
    alerter: SlackAlerter,
    curse_api_key: Option<String>,
}

impl Provisioner {
    pub fn new(
        store: Store,
        panel: PanelClient,
        catalog: Arc<PlanCatalog>,
        alerter: SlackAlerter,
        curse_api_key: Option<String>,
    ) -> Self {
        Self {
            store,
            panel,
            catalog,
            alerter,
            curse_api_key,
        }
    }

    /// Provision an ordered server on the panel. Idempotent: a server that
    /// is already initialised is returned unchanged. On failure the server
    /// is marked failed, the failure is recorded as an event, and an alert
    /// goes out; the error still propagates to the caller.
    pub async fn initialise_server(&self, server_id: i64) -> Result<Server, ProvisionError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        if server.initialised {
            info!(uuid = %server.uuid, "Server already initialised, skipping");
            return Ok(server);
        }

        self.store
            .set_server_status(server.id, ServerStatus::Provisioning)
            .await?;

        match self.provision(&server).await {
            Ok(panel_id) => {
                self.store.mark_provisioned(server.id, &panel_id).await?;
                self.store
                    .record_server_event(
                        server.id,
                        ServerEventType::Provisioned,
                        None,
                        serde_json::json!({ "panel_id": panel_id }),
                    )
                    .await?;

                info!(uuid = %server.uuid, panel_id = %panel_id, "Server provisioned");

                self.store
                    .get_server(server.id)
                    .await?
                    .ok_or(StoreError::NotFound)
                    .map_err(ProvisionError::from)
            }
            Err(e) => {
                error!(uuid = %server.uuid, error = %e, "Provisioning failed");

                if let Err(store_err) = self
                    .store
                    .set_server_status(server.id, ServerStatus::Failed)
                    .await
                {
                    warn!(error = %store_err, "Failed to mark server as failed");
                }
                if let Err(store_err) = self
                    .store
                    .record_server_event(
                        server.id,
                        ServerEventType::ProvisionFailed,
                        None,
                        serde_json::json!({ "error": e.to_string() }),
                    )
                    .await
                {
                    warn!(error = %store_err, "Failed to record provision failure");
                }

                self.alerter
                    .send(&format!(
                        "Provisioning failed for server {} (plan {}): {}",
                        server.uuid, server.plan, e
                    ))
                    .await;

                Err(e)
            }
        }
    }

    async fn provision(&self, server: &Server) -> Result<String, ProvisionError> {
        let order: ServerOrderConfig = serde_json::from_value(server.config.clone())
            .map_err(|e| ProvisionError::InvalidConfig(e.to_string()))?;

        let plan = self
            .catalog
            .plan(&server.plan)
            .ok_or_else(|| ProvisionError::UnknownPlan(server.plan.clone()))?;
        let required_mb = plan.ram_mb();

        let location = self
            .catalog
            .location(&order.location)
            .ok_or_else(|| ProvisionError::UnknownLocation(order.location.clone()))?;

        let user = self
            .store
            .get_user(server.user_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        let panel_user_id = self.ensure_panel_user(&user).await?;

        // Placement: fetch the location's nodes, pick the roomiest eligible
        // one, then re-fetch it with allocations included.
        let panel_location = self
            .panel
            .location_by_short(&location.panel_location)
            .await?
            .ok_or_else(|| ProvisionError::LocationNotOnPanel(location.panel_location.clone()))?;

        let nodes = panel_location.nodes();
        let node = pick_node(&nodes, required_mb).ok_or_else(|| ProvisionError::NoCapacity {
            location: order.location.clone(),
            required_mb,
        })?;

        let node = self.panel.get_node_with_allocations(node.id).await?;
        let allocations = node.allocations();
        let allocation = pick_allocation(&allocations)
            .ok_or_else(|| ProvisionError::NoAllocation(node.name.clone()))?;

        let egg_name = egg_name_for_type(&order.server_type);
        let egg = self.find_egg(egg_name).await?;

        let environment = environment_for(&order, egg_name, self.curse_api_key.as_deref());

        let payload = CreatePanelServer {
            name: order
                .name
                .clone()
                .unwrap_or_else(|| format!("{}'s server", user.name)),
            user: panel_user_id,
            external_id: server.uuid.clone(),
            egg: egg.id,
            docker_image: order
                .docker_image
                .clone()
                .unwrap_or_else(|| egg.docker_image.clone()),
            startup: egg.startup.clone(),
            environment,
            limits: ServerLimits {
                memory: required_mb,
                swap: -1,
                disk: 0,
                io: 500,
                cpu: 0,
            },
            feature_limits: FeatureLimits {
                databases: 0,
                backups: 0,
            },
            allocation: DefaultAllocation {
                default: allocation.id,
            },
        };

        info!(
            uuid = %server.uuid,
            node = %node.name,
            allocation = allocation.id,
            egg = %egg_name,
            "Placing server"
        );

        let created = self.panel.create_server(&payload).await?;
        Ok(created.id.to_string())
    }

    /// The panel user backing an account, created on first use. The panel's
    /// external_id carries our user id.
    async fn ensure_panel_user(&self, user: &User) -> Result<i64, ProvisionError> {
        if let Some(id) = user.panel_user_id {
            return Ok(id);
        }

        let external_id = user.id.to_string();
        if let Some(existing) = self.panel.find_user_by_external_id(&external_id).await? {
            self.store.set_panel_user_id(user.id, existing.id).await?;
            return Ok(existing.id);
        }

        let mut parts = user.name.splitn(2, ' ');
        let first_name = parts.next().unwrap_or("Customer").to_string();
        let last_name = parts.next().unwrap_or("Account").to_string();

        let created = self
            .panel
            .create_user(&CreatePanelUser {
                email: user.email.clone(),
                username: format!("customer{}", user.id),
                first_name,
                last_name,
                external_id: Some(external_id),
            })
            .await?;

        self.store.set_panel_user_id(user.id, created.id).await?;
        info!(user = user.id, panel_user = created.id, "Created panel user");

        Ok(created.id)
    }

    async fn find_egg(&self, egg_name: &str) -> Result<PanelEgg, ProvisionError> {
        let nest = self
            .panel
            .minecraft_nest()
            .await?
            .ok_or(ProvisionError::NestNotFound)?;

        nest.eggs()
            .into_iter()
            .find(|e| e.name == egg_name)
            .cloned()
            .ok_or_else(|| ProvisionError::EggNotFound(egg_name.to_string()))
    }

    /// Suspend the server on the panel and mirror the state locally.
    pub async fn suspend_server(&self, server_id: i64) -> Result<(), ProvisionError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        if let Some(panel_id) = server.panel_id.as_deref().and_then(|s| s.parse().ok()) {
            self.panel.suspend_server(panel_id).await?;
        }

        self.store.set_server_suspended(server.id, true).await?;
        self.store
            .record_server_event(server.id, ServerEventType::Suspended, None, serde_json::json!({}))
            .await?;

        info!(uuid = %server.uuid, "Server suspended");
        Ok(())
    }

    pub async fn unsuspend_server(&self, server_id: i64) -> Result<(), ProvisionError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        if let Some(panel_id) = server.panel_id.as_deref().and_then(|s| s.parse().ok()) {
            self.panel.unsuspend_server(panel_id).await?;
        }

        self.store.set_server_suspended(server.id, false).await?;
        self.store
            .record_server_event(server.id, ServerEventType::Unsuspended, None, serde_json::json!({}))
            .await?;

        info!(uuid = %server.uuid, "Server unsuspended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::types::AllocatedResources;

    fn node(id: i64, memory: i64, allocated: i64) -> PanelNode {
        PanelNode {
            id,
            name: format!("node{id}"),
            fqdn: format!("node{id}.example.com"),
            memory,
            allocated_resources: Some(AllocatedResources {
                memory: allocated,
                disk: 0,
            }),
            relationships: None,
        }
    }

    fn allocation(id: i64, assigned: bool) -> PanelAllocation {
        PanelAllocation {
            id,
            ip: "10.0.0.1".to_string(),
            port: 25565 + id as u16,
            assigned,
        }
    }

    #[test]
    fn test_egg_name_mapping() {
        assert_eq!(egg_name_for_type("vanilla"), "Vanilla Minecraft");
        assert_eq!(egg_name_for_type("bukkit"), "Vanilla Minecraft");
        assert_eq!(egg_name_for_type("bedrock"), "Vanilla Minecraft");
        assert_eq!(egg_name_for_type("spigot"), "Spigot");
        assert_eq!(egg_name_for_type("paper"), "Paper");
        assert_eq!(egg_name_for_type("forge"), "Forge Minecraft");
        assert_eq!(egg_name_for_type("all-the-mods-9"), "CurseForge Generic");
    }

    #[test]
    fn test_pick_node_prefers_most_free() {
        let a = node(1, 32768, 30000); // 2768 free
        let b = node(2, 16384, 4096); // 12288 free
        let c = node(3, 65536, 60000); // 5536 free
        let nodes = vec![&a, &b, &c];

        let picked = pick_node(&nodes, 2048).unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn test_pick_node_skips_full_nodes() {
        let a = node(1, 8192, 7000); // 1192 free
        let b = node(2, 8192, 8192); // 0 free
        let nodes = vec![&a, &b];

        assert!(pick_node(&nodes, 2048).is_none());
        assert_eq!(pick_node(&nodes, 1024).unwrap().id, 1);
    }

    #[test]
    fn test_pick_node_exact_fit_is_eligible() {
        let a = node(1, 8192, 4096); // 4096 free
        let nodes = vec![&a];

        assert_eq!(pick_node(&nodes, 4096).unwrap().id, 1);
        assert!(pick_node(&nodes, 4097).is_none());
    }

    #[test]
    fn test_pick_allocation_first_unassigned() {
        let a = allocation(1, true);
        let b = allocation(2, false);
        let c = allocation(3, false);
        let allocations = vec![&a, &b, &c];

        assert_eq!(pick_allocation(&allocations).unwrap().id, 2);

        let all_assigned = vec![&a];
        assert!(pick_allocation(&all_assigned).is_none());
    }

    #[test]
    fn test_environment_vanilla() {
        let order = ServerOrderConfig {
            location: "eu".to_string(),
            server_type: "vanilla".to_string(),
            version: Some("1.21.1".to_string()),
            name: None,
            docker_image: None,
            project_id: None,
            version_id: None,
        };

        let env = environment_for(&order, "Vanilla Minecraft", Some("curse-key"));
        assert_eq!(env.get("SERVER_JARFILE").map(String::as_str), Some("server.jar"));
        assert_eq!(env.get("VANILLA_VERSION").map(String::as_str), Some("1.21.1"));
        // CurseForge variables only apply to the CurseForge egg.
        assert!(!env.contains_key("API_KEY"));
        assert!(!env.contains_key("PROJECT_ID"));
    }

    #[test]
    fn test_environment_version_only_set_for_vanilla() {
        let order = ServerOrderConfig {
            location: "eu".to_string(),
            server_type: "paper".to_string(),
            version: Some("1.20.4".to_string()),
            name: None,
            docker_image: None,
            project_id: None,
            version_id: None,
        };

        let env = environment_for(&order, "Paper", None);
        assert_eq!(env.get("SERVER_JARFILE").map(String::as_str), Some("server.jar"));
        assert!(!env.contains_key("VANILLA_VERSION"));
    }

    #[test]
    fn test_environment_curseforge() {
        let order = ServerOrderConfig {
            location: "eu".to_string(),
            server_type: "all-the-mods-9".to_string(),
            version: None,
            name: None,
            docker_image: None,
            project_id: Some("715572".to_string()),
            version_id: Some("5016170".to_string()),
        };

        let env = environment_for(&order, "CurseForge Generic", Some("curse-key"));
        assert_eq!(env.get("PROJECT_ID").map(String::as_str), Some("715572"));
        assert_eq!(env.get("VERSION_ID").map(String::as_str), Some("5016170"));
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("curse-key"));
    }

    #[test]
    fn test_order_config_parses_from_json() {
        let value = serde_json::json!({
            "location": "us-east",
            "type": "paper",
            "version": "1.20.4"
        });

        let order: ServerOrderConfig = serde_json::from_value(value).unwrap();
        assert_eq!(order.location, "us-east");
        assert_eq!(order.server_type, "paper");
        assert_eq!(order.version.as_deref(), Some("1.20.4"));
        assert!(order.project_id.is_none());
    }
}
