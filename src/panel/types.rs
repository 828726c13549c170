//! Wire types for the Pterodactyl Application/Client APIs.
//!
//! The panel wraps every resource as `{"object": ..., "attributes": {...}}`
//! and every collection as `{"data": [...]}`; relationship includes nest the
//! same wrappers one level deeper.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `{"attributes": {...}}` wrapper around a single resource.
#[derive(Debug, Clone, Deserialize)]
pub struct Wrapped<T> {
    pub attributes: T,
}

/// `{"data": [...]}` wrapper around a resource collection.
#[derive(Debug, Clone, Deserialize)]
pub struct DataList<T> {
    pub data: Vec<Wrapped<T>>,
}

impl<T> DataList<T> {
    pub fn into_attributes(self) -> Vec<T> {
        self.data.into_iter().map(|w| w.attributes).collect()
    }
}

/// Resources already allocated on a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocatedResources {
    pub memory: i64,
    #[serde(default)]
    pub disk: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeRelationships {
    pub allocations: Option<DataList<PanelAllocation>>,
}

/// A panel node (a physical/virtual machine running game servers).
#[derive(Debug, Clone, Deserialize)]
pub struct PanelNode {
    pub id: i64,
    pub name: String,
    pub fqdn: String,
    /// Total assignable memory in MiB.
    pub memory: i64,
    /// Missing on nodes that have no servers yet.
    pub allocated_resources: Option<AllocatedResources>,
    #[serde(default)]
    pub relationships: Option<NodeRelationships>,
}

impl PanelNode {
    /// Memory already promised to servers, in MiB.
    pub fn allocated_mb(&self) -> i64 {
        self.allocated_resources
            .as_ref()
            .map(|r| r.memory)
            .unwrap_or(0)
    }

    /// Memory still assignable, in MiB. Can go negative when the panel
    /// overcommits.
    pub fn free_mb(&self) -> i64 {
        self.memory - self.allocated_mb()
    }

    pub fn allocations(&self) -> Vec<&PanelAllocation> {
        self.relationships
            .as_ref()
            .and_then(|r| r.allocations.as_ref())
            .map(|list| list.data.iter().map(|w| &w.attributes).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationRelationships {
    pub nodes: Option<DataList<PanelNode>>,
}

/// A panel location (a region grouping nodes).
#[derive(Debug, Clone, Deserialize)]
pub struct PanelLocation {
    pub id: i64,
    pub short: String,
    #[serde(default)]
    pub long: Option<String>,
    #[serde(default)]
    pub relationships: Option<LocationRelationships>,
}

impl PanelLocation {
    pub fn nodes(&self) -> Vec<&PanelNode> {
        self.relationships
            .as_ref()
            .and_then(|r| r.nodes.as_ref())
            .map(|list| list.data.iter().map(|w| &w.attributes).collect())
            .unwrap_or_default()
    }
}

/// An IP:port pair on a node, assignable to one server.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelAllocation {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    pub assigned: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NestRelationships {
    pub eggs: Option<DataList<PanelEgg>>,
}

/// A nest groups eggs (server-type templates) by game.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelNest {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub relationships: Option<NestRelationships>,
}

impl PanelNest {
    pub fn eggs(&self) -> Vec<&PanelEgg> {
        self.relationships
            .as_ref()
            .and_then(|r| r.eggs.as_ref())
            .map(|list| list.data.iter().map(|w| &w.attributes).collect())
            .unwrap_or_default()
    }
}

/// A server-type template: startup command, docker image, env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelEgg {
    pub id: i64,
    pub name: String,
    pub docker_image: String,
    pub startup: String,
}

/// A user account on the panel.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelUser {
    pub id: i64,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// A server instance on the panel.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelServer {
    pub id: i64,
    pub identifier: String,
    pub uuid: String,
    #[serde(default)]
    pub external_id: Option<String>,
    pub name: String,
}

/// Payload for creating a user on the panel.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePanelUser {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// Resource limits block of a create-server payload.
#[derive(Debug, Clone, Serialize)]
pub struct ServerLimits {
    pub memory: i64,
    pub swap: i64,
    pub disk: i64,
    pub io: i64,
    pub cpu: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureLimits {
    pub databases: i64,
    pub backups: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefaultAllocation {
    pub default: i64,
}

/// Payload for creating a server on the panel.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePanelServer {
    pub name: String,
    pub user: i64,
    pub external_id: String,
    pub egg: i64,
    pub docker_image: String,
    pub startup: String,
    pub environment: HashMap<String, String>,
    pub limits: ServerLimits,
    pub feature_limits: FeatureLimits,
    pub allocation: DefaultAllocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_free_memory() {
        let node: PanelNode = serde_json::from_value(serde_json::json!({
            "id": 3,
            "name": "de-node-1",
            "fqdn": "de1.example.com",
            "memory": 65536,
            "allocated_resources": { "memory": 61440, "disk": 10240 }
        }))
        .unwrap();
        assert_eq!(node.free_mb(), 4096);

        let empty: PanelNode = serde_json::from_value(serde_json::json!({
            "id": 4,
            "name": "de-node-2",
            "fqdn": "de2.example.com",
            "memory": 32768
        }))
        .unwrap();
        assert_eq!(empty.free_mb(), 32768);
    }

    #[test]
    fn test_location_with_included_nodes() {
        let location: PanelLocation = serde_json::from_value(serde_json::json!({
            "id": 1,
            "short": "eu.de",
            "long": "Germany",
            "relationships": {
                "nodes": {
                    "data": [
                        { "object": "node", "attributes": {
                            "id": 3, "name": "de-node-1", "fqdn": "de1.example.com",
                            "memory": 65536
                        }}
                    ]
                }
            }
        }))
        .unwrap();

        let nodes = location.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 3);
    }

    #[test]
    fn test_node_with_included_allocations() {
        let node: PanelNode = serde_json::from_value(serde_json::json!({
            "id": 3,
            "name": "de-node-1",
            "fqdn": "de1.example.com",
            "memory": 65536,
            "relationships": {
                "allocations": {
                    "data": [
                        { "object": "allocation", "attributes": {
                            "id": 11, "ip": "10.0.0.1", "port": 25565, "assigned": true
                        }},
                        { "object": "allocation", "attributes": {
                            "id": 12, "ip": "10.0.0.1", "port": 25566, "assigned": false
                        }}
                    ]
                }
            }
        }))
        .unwrap();

        let allocations = node.allocations();
        assert_eq!(allocations.len(), 2);
        assert!(!allocations[1].assigned);
    }
}
