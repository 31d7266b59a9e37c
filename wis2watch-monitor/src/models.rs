/**
 * MODÈLES - Nœuds WIS2 surveillés et statut dérivé
 *
 * RÔLE :
 * - `Node` : métadonnées statiques d'un nœud (broker, topics, pays), immuables
 *   pendant une session de monitoring.
 * - `ConnectionState` : état de la machine à états MQTT d'un nœud.
 * - `NodeStatus` : vue agrégée d'un nœud, poussée aux dashboards.
 */

use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use time::OffsetDateTime;

pub type NodeId = u64;

/// Statut de tous les nœuds, indexé par id (clé JSON = id en chaîne)
pub type StatusMap = BTreeMap<NodeId, NodeStatus>;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    /// Centre du pays [lon, lat] pour le placement sur la carte
    #[serde(default)]
    pub center_point: Option<[f64; 2]>,
    #[serde(default)]
    pub centre_id: String,
    #[serde(default)]
    pub base_url: String,
    pub broker_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    /// Démarré automatiquement par `ensure_monitoring`
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Stopped,
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error(_) => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(reason) => write!(f, "error ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

// La raison d'une erreur est exposée via `NodeStatus::error`
impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub node_name: String,
    pub state: ConnectionState,
    pub previous_state: Option<ConnectionState>,
    pub message_count: u64,
    pub subscription_count: usize,
    pub subscribed_topics: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_time: Option<OffsetDateTime>,
    pub error: Option<String>,
    /// Messages reçus sur les 60 dernières secondes
    pub messages_per_minute: u32,
    /// Tentative de reconnexion en cours (0 quand le lien est sain)
    pub reconnect_attempts: u32,
    // statistiques de connexion depuis le dernier restart
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub error_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub connected_at: Option<OffsetDateTime>,
    /// Renseigné seulement en Connected
    pub uptime_seconds: Option<u64>,
    /// Connecté mais muet depuis 10 min, ou bloqué en Connecting depuis 2 min
    pub stale: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub state_changed_at: OffsetDateTime,
}

impl NodeStatus {
    pub fn stopped(node: &Node) -> Self {
        Self {
            node_id: node.id,
            node_name: node.name.clone(),
            state: ConnectionState::Stopped,
            previous_state: None,
            message_count: 0,
            subscription_count: 0,
            subscribed_topics: Vec::new(),
            last_message_time: None,
            error: None,
            messages_per_minute: 0,
            reconnect_attempts: 0,
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
            error_count: 0,
            connected_at: None,
            uptime_seconds: None,
            stale: false,
            state_changed_at: OffsetDateTime::now_utc(),
        }
    }
}
