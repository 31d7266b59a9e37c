/**
 * ÉVÉNEMENTS - Ce que les workers MQTT émettent sur le bus
 *
 * RÔLE : événements transitoires produits par un worker de nœud, consommés par
 * l'agrégateur de statut et par chaque session WebSocket. Jamais persistés.
 *
 * Les notifications WIS2 reçues sont décodées ici : seuls le point géographique
 * et quelques identifiants sont conservés, jamais le contenu du message.
 */

use crate::models::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Commande de contrôle d'un nœud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeAction::Start => "start",
            NodeAction::Stop => "stop",
            NodeAction::Restart => "restart",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// stop/restart demandé
    Requested,
    /// Fermeture propre côté broker (paquet DISCONNECT)
    Remote(String),
}

/// Point [lon, lat] extrait de la géométrie d'une notification
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint(pub f64, pub f64);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connecting {
        node_id: NodeId,
        attempt: u32,
    },
    ConnectionOpened {
        node_id: NodeId,
        subscriptions: usize,
    },
    ConnectionClosed {
        node_id: NodeId,
        reason: CloseReason,
        retrying: bool,
    },
    MessageReceived {
        node_id: NodeId,
        topic: String,
        timestamp: OffsetDateTime,
        geometry: Option<GeoPoint>,
        data_id: Option<String>,
        wigos_id: Option<String>,
    },
    ActionAcknowledged {
        node_id: NodeId,
        action: NodeAction,
    },
    Failure {
        node_id: NodeId,
        error: String,
        retrying: bool,
    },
}

impl Event {
    pub fn node_id(&self) -> NodeId {
        match self {
            Event::Connecting { node_id, .. }
            | Event::ConnectionOpened { node_id, .. }
            | Event::ConnectionClosed { node_id, .. }
            | Event::MessageReceived { node_id, .. }
            | Event::ActionAcknowledged { node_id, .. }
            | Event::Failure { node_id, .. } => *node_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connecting { .. } => "connecting",
            Event::ConnectionOpened { .. } => "connection_opened",
            Event::ConnectionClosed { .. } => "connection_closed",
            Event::MessageReceived { .. } => "message_received",
            Event::ActionAcknowledged { .. } => "action_acknowledged",
            Event::Failure { .. } => "failure",
        }
    }
}

/// Champs utiles d'une notification WIS2 (GeoJSON)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Notification {
    pub geometry: Option<GeoPoint>,
    pub data_id: Option<String>,
    pub wigos_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNotification {
    #[serde(default)]
    geometry: Option<RawGeometry>,
    #[serde(default)]
    properties: Option<RawProperties>,
}

#[derive(Debug, Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawProperties {
    #[serde(default)]
    data_id: Option<String>,
    #[serde(default)]
    wigos_station_identifier: Option<String>,
}

/// Décode un payload de notification. Un payload non-JSON (ou qui n'est pas un
/// objet) est une erreur ; une géométrie absente ou non-Point ne l'est pas.
pub fn parse_notification(payload: &[u8]) -> Result<Notification, serde_json::Error> {
    let raw: RawNotification = serde_json::from_slice(payload)?;

    let geometry = raw.geometry.and_then(|g| {
        if g.kind != "Point" {
            return None;
        }
        let lon = g.coordinates.first()?.as_f64()?;
        let lat = g.coordinates.get(1)?.as_f64()?;
        Some(GeoPoint(lon, lat))
    });
    let (data_id, wigos_id) = match raw.properties {
        Some(p) => (p.data_id, p.wigos_station_identifier),
        None => (None, None),
    };

    Ok(Notification { geometry, data_id, wigos_id })
}
