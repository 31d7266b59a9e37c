/**
 * STATUS AGGREGATOR - Source de vérité des NodeStatus
 *
 * RÔLE :
 * Maintient un NodeStatus par nœud à partir des événements des workers.
 * Chaque mise à jour est republiée sur un second bus (`updates`) que les
 * sessions WebSocket relaient en `status_update`.
 *
 * FONCTIONNEMENT :
 * - appliqué par le worker AVANT la publication sur le bus d'événements :
 *   aucune transition perdue, même quand les files des sessions débordent
 * - table construite une fois depuis le registre, jamais modifiée ensuite :
 *   seule l'entrée d'un nœud est verrouillée (lecture-modification-écriture
 *   atomique par nœud, aucun verrou global)
 * - fenêtre glissante de 60 s pour `messages_per_minute`
 * - uptime et drapeau `stale` recalculés à chaque lecture
 * - ActionAcknowledged(Restart) = remise à zéro des compteurs
 */

use crate::bus::EventBus;
use crate::events::{CloseReason, Event, NodeAction};
use crate::models::{ConnectionState, Node, NodeId, NodeStatus, StatusMap};
use crate::registry::NodeRegistry;
use crate::state::{new_state, Shared};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

const RATE_WINDOW: Duration = Duration::seconds(60);
/// Silence toléré sur un nœud connecté qui a déjà reçu des messages
const SILENCE_LIMIT: Duration = Duration::minutes(10);
const CONNECTING_LIMIT: Duration = Duration::minutes(2);

struct StatusEntry {
    node: Arc<Node>,
    status: NodeStatus,
    /// Horodatages des messages de la dernière minute
    recent: VecDeque<OffsetDateTime>,
}

impl StatusEntry {
    fn set_state(&mut self, state: ConnectionState, now: OffsetDateTime) {
        if self.status.state != state {
            let previous = std::mem::replace(&mut self.status.state, state);
            self.status.previous_state = Some(previous);
            self.status.state_changed_at = now;
        }
    }

    fn prune(&mut self, now: OffsetDateTime) {
        let cutoff = now - RATE_WINDOW;
        while self.recent.front().is_some_and(|t| *t < cutoff) {
            self.recent.pop_front();
        }
    }

    fn is_stale(&self, now: OffsetDateTime) -> bool {
        match self.status.state {
            ConnectionState::Connected => self
                .status
                .last_message_time
                .is_some_and(|t| now - t > SILENCE_LIMIT),
            ConnectionState::Connecting => now - self.status.state_changed_at > CONNECTING_LIMIT,
            _ => false,
        }
    }

    /// Copie du statut avec les champs dérivés recalculés à `now`, sans toucher la fenêtre
    fn view(&self, now: OffsetDateTime) -> NodeStatus {
        let cutoff = now - RATE_WINDOW;
        let mut status = self.status.clone();
        status.messages_per_minute = self.recent.iter().filter(|t| **t >= cutoff).count() as u32;
        status.uptime_seconds = match (&status.state, status.connected_at) {
            (ConnectionState::Connected, Some(at)) => Some((now - at).whole_seconds().max(0) as u64),
            _ => None,
        };
        status.stale = self.is_stale(now);
        status
    }

    /// Compteurs à zéro, l'historique d'état est conservé
    fn reset(&mut self, now: OffsetDateTime) {
        let mut fresh = NodeStatus::stopped(&self.node);
        fresh.state = std::mem::take(&mut self.status.state);
        fresh.previous_state = self.status.previous_state.take();
        fresh.state_changed_at = self.status.state_changed_at;
        self.status = fresh;
        self.recent.clear();
        self.set_state(ConnectionState::Stopped, now);
    }
}

/// Compteurs exposés par /system/health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub tracked: usize,
    pub connected: usize,
    pub in_error: usize,
    pub stale: usize,
}

pub struct StatusAggregator {
    entries: HashMap<NodeId, Shared<StatusEntry>>,
    updates: EventBus<NodeStatus>,
}

impl StatusAggregator {
    pub fn new(registry: &NodeRegistry, updates: EventBus<NodeStatus>) -> Self {
        let entries = registry
            .list_nodes()
            .into_iter()
            .map(|node| {
                let entry = StatusEntry {
                    status: NodeStatus::stopped(&node),
                    node: Arc::clone(&node),
                    recent: VecDeque::new(),
                };
                (node.id, new_state(entry))
            })
            .collect();
        Self { entries, updates }
    }

    /// Bus des NodeStatus mis à jour
    pub fn updates(&self) -> &EventBus<NodeStatus> {
        &self.updates
    }

    /// Applique un événement et publie le statut résultant.
    /// None si l'événement ne change rien ou vise un nœud inconnu.
    pub fn apply(&self, event: &Event) -> Option<NodeStatus> {
        let node_id = event.node_id();
        let Some(entry) = self.entries.get(&node_id) else {
            warn!(node_id, kind = event.kind(), "event for unknown node ignored");
            return None;
        };

        let now = OffsetDateTime::now_utc();
        let updated = {
            let mut entry = entry.lock();
            if !Self::transition(&mut entry, event, now) {
                return None;
            }
            entry.prune(now);
            entry.view(now)
        };

        debug!(node_id, state = %updated.state, messages = updated.message_count, "status updated");
        self.updates.publish(updated.clone());
        Some(updated)
    }

    fn transition(entry: &mut StatusEntry, event: &Event, now: OffsetDateTime) -> bool {
        match event {
            Event::Connecting { attempt, .. } => {
                entry.set_state(ConnectionState::Connecting, now);
                entry.status.reconnect_attempts = attempt.saturating_sub(1);
                entry.status.connection_attempts += 1;
            }
            Event::ConnectionOpened { subscriptions, .. } => {
                entry.set_state(ConnectionState::Connected, now);
                entry.status.subscription_count = *subscriptions;
                entry.status.subscribed_topics = entry.node.topics.iter().cloned().collect();
                entry.status.reconnect_attempts = 0;
                entry.status.successful_connections += 1;
                entry.status.connected_at = Some(now);
                entry.status.error = None;
            }
            Event::ConnectionClosed { reason, retrying, .. } => {
                entry.set_state(
                    if *retrying {
                        ConnectionState::Disconnected
                    } else {
                        ConnectionState::Stopped
                    },
                    now,
                );
                entry.status.subscription_count = 0;
                entry.status.subscribed_topics.clear();
                entry.status.error = match reason {
                    CloseReason::Requested => None,
                    CloseReason::Remote(why) => {
                        entry.status.error_count += 1;
                        Some(why.clone())
                    }
                };
            }
            Event::MessageReceived { timestamp, .. } => {
                entry.status.message_count += 1;
                entry.status.last_message_time = Some(*timestamp);
                entry.recent.push_back(*timestamp);
            }
            Event::Failure { error, retrying, .. } => {
                if entry.status.state == ConnectionState::Connecting {
                    entry.status.failed_connections += 1;
                }
                entry.set_state(
                    if *retrying {
                        ConnectionState::Disconnected
                    } else {
                        ConnectionState::Error(error.clone())
                    },
                    now,
                );
                entry.status.subscription_count = 0;
                entry.status.subscribed_topics.clear();
                entry.status.error_count += 1;
                entry.status.error = Some(error.clone());
            }
            Event::ActionAcknowledged { action: NodeAction::Restart, .. } => entry.reset(now),
            Event::ActionAcknowledged { .. } => return false,
        }
        true
    }

    /// Lecture ponctuelle de tous les statuts
    pub fn snapshot(&self) -> StatusMap {
        let now = OffsetDateTime::now_utc();
        self.entries
            .iter()
            .map(|(id, entry)| (*id, entry.lock().view(now)))
            .collect()
    }

    pub fn get(&self, node_id: NodeId) -> Option<NodeStatus> {
        let now = OffsetDateTime::now_utc();
        self.entries.get(&node_id).map(|e| e.lock().view(now))
    }

    pub fn counts(&self) -> StateCounts {
        let now = OffsetDateTime::now_utc();
        let mut counts = StateCounts { tracked: self.entries.len(), ..Default::default() };
        for entry in self.entries.values() {
            let entry = entry.lock();
            match entry.status.state {
                ConnectionState::Connected => counts.connected += 1,
                ConnectionState::Error(_) => counts.in_error += 1,
                _ => {}
            }
            if entry.is_stale(now) {
                counts.stale += 1;
            }
        }
        counts
    }
}
