/**
 * SESSION WEBSOCKET - Pont entre le bus et un dashboard connecté
 *
 * RÔLE :
 * Une tâche par client WebSocket. Pousse le snapshot initial, relaie les
 * messages reçus et les statuts mis à jour, et transmet les commandes
 * start / stop / restart / get_status au ConnectionManager.
 *
 * FONCTIONNEMENT :
 * - abonnement aux deux bus AVANT l'envoi du snapshot : aucune mise à jour
 *   perdue entre les deux
 * - une seule boucle select! : trames entrantes, événements, statuts, arrêt
 * - statuts en attente regroupés dans un seul `status_update`
 * - `action_result` = commande acceptée (mise en file), pas exécutée
 * - une commande invalide n'est signalée qu'au client fautif
 * - fin de session : drop des abonnements => désinscription immédiate du bus
 */

use crate::bus::Subscription;
use crate::events::{Event, GeoPoint, NodeAction};
use crate::http::AppState;
use crate::manager::CommandError;
use crate::models::{NodeId, NodeStatus, StatusMap};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::{de, Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUED: &str = "queued";

/// Trame client -> serveur
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Start {
        #[serde(deserialize_with = "node_id_from_number_or_string")]
        node_id: NodeId,
    },
    Stop {
        #[serde(deserialize_with = "node_id_from_number_or_string")]
        node_id: NodeId,
    },
    Restart {
        #[serde(deserialize_with = "node_id_from_number_or_string")]
        node_id: NodeId,
    },
    GetStatus,
}

/// Les dashboards envoient parfois l'id en chaîne ("3")
fn node_id_from_number_or_string<'de, D>(deserializer: D) -> Result<NodeId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(NodeId),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid node_id {text:?}"))),
    }
}

impl ClientCommand {
    pub fn node_action(&self) -> Option<(NodeId, NodeAction)> {
        match *self {
            ClientCommand::Start { node_id } => Some((node_id, NodeAction::Start)),
            ClientCommand::Stop { node_id } => Some((node_id, NodeAction::Stop)),
            ClientCommand::Restart { node_id } => Some((node_id, NodeAction::Restart)),
            ClientCommand::GetStatus => None,
        }
    }
}

pub fn parse_command(text: &str) -> Result<ClientCommand, CommandError> {
    serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageData {
    pub node_id: NodeId,
    pub topic: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wigos_id: Option<String>,
}

/// Trame serveur -> client, discriminée par `type`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Status { data: StatusMap },
    StatusUpdate { data: StatusMap },
    Message { data: MessageData },
    ActionResult { action: NodeAction, node_id: NodeId, status: &'static str },
    Error { error: String },
}

impl OutboundFrame {
    /// Seuls les messages reçus sont relayés tels quels ; les changements
    /// d'état arrivent via le bus des statuts
    fn from_event(event: Event) -> Option<Self> {
        match event {
            Event::MessageReceived { node_id, topic, timestamp, geometry, data_id, wigos_id } => {
                Some(OutboundFrame::Message {
                    data: MessageData { node_id, topic, timestamp, geometry, data_id, wigos_id },
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

// GET /ws/mqtt-status/
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let client_id = Uuid::new_v4();
    let clients = app.health_tracker.client_connected();
    info!(%client_id, clients, "dashboard client connected");

    let events = app.events.subscribe();
    let updates = app.aggregator.updates().subscribe();
    let mut session = ClientSession { client_id, socket, app, events, updates };

    if let Err(e) = session.run().await {
        debug!(%client_id, error = %e, "session ended on error");
    }

    let ClientSession { app, events, updates, .. } = session;
    drop(events);
    drop(updates);
    let clients = app.health_tracker.client_disconnected();
    info!(%client_id, clients, "dashboard client disconnected");
}

enum Step {
    Shutdown,
    Inbound(Option<Result<Message, axum::Error>>),
    Event(Option<Event>),
    Update(Option<NodeStatus>),
}

struct ClientSession {
    client_id: Uuid,
    socket: WebSocket,
    app: AppState,
    events: Subscription<Event>,
    updates: Subscription<NodeStatus>,
}

impl ClientSession {
    async fn run(&mut self) -> Result<(), SessionError> {
        let snapshot = self.app.aggregator.snapshot();
        self.send(&OutboundFrame::Status { data: snapshot }).await?;

        loop {
            let step = tokio::select! {
                _ = self.app.shutdown.cancelled() => Step::Shutdown,
                inbound = self.socket.recv() => Step::Inbound(inbound),
                event = self.events.recv() => Step::Event(event),
                update = self.updates.recv() => Step::Update(update),
            };
            match step {
                Step::Shutdown => {
                    let _ = self.socket.send(Message::Close(None)).await;
                    return Ok(());
                }
                Step::Inbound(None) => return Ok(()),
                Step::Inbound(Some(frame)) => match frame? {
                    Message::Text(text) => self.handle_command(text.as_str()).await?,
                    Message::Binary(_) => {
                        self.reject(CommandError::Malformed("binary frames are not supported".into()))
                            .await?
                    }
                    Message::Close(_) => return Ok(()),
                    // ping/pong gérés par axum
                    _ => {}
                },
                Step::Event(Some(event)) => {
                    if let Some(frame) = OutboundFrame::from_event(event) {
                        self.send(&frame).await?;
                    }
                }
                Step::Update(Some(status)) => {
                    let mut data = StatusMap::new();
                    data.insert(status.node_id, status);
                    while let Some(more) = self.updates.try_recv() {
                        data.insert(more.node_id, more);
                    }
                    self.send(&OutboundFrame::StatusUpdate { data }).await?;
                }
                // bus fermé
                Step::Event(None) | Step::Update(None) => return Ok(()),
            }
        }
    }

    async fn handle_command(&mut self, text: &str) -> Result<(), SessionError> {
        let command = match parse_command(text) {
            Ok(c) => c,
            Err(e) => return self.reject(e).await,
        };
        let Some((node_id, action)) = command.node_action() else {
            let snapshot = self.app.aggregator.snapshot();
            return self.send(&OutboundFrame::Status { data: snapshot }).await;
        };

        let manager = &self.app.manager;
        let queued = match action {
            NodeAction::Start => manager.start(node_id),
            NodeAction::Stop => manager.stop(node_id),
            NodeAction::Restart => manager.restart(node_id),
        };
        match queued {
            Ok(()) => {
                info!(client_id = %self.client_id, node_id, %action, "command queued");
                self.send(&OutboundFrame::ActionResult { action, node_id, status: QUEUED })
                    .await
            }
            Err(e) => self.reject(e).await,
        }
    }

    async fn reject(&mut self, err: CommandError) -> Result<(), SessionError> {
        warn!(client_id = %self.client_id, error = %err, "client command rejected");
        self.send(&OutboundFrame::Error { error: err.to_string() }).await
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SessionError> {
        let text = serde_json::to_string(frame)?;
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }
}
