/**
 * CONNECTION MANAGER - Un worker MQTT par nœud surveillé
 *
 * RÔLE :
 * Possède la machine à états de connexion de chaque nœud et exécute les
 * commandes start / stop / restart venant des dashboards ou du démarrage.
 *
 * FONCTIONNEMENT :
 * - un worker tokio par nœud, créé à la première commande, jamais deux pour le
 *   même id (table des workers sous verrou)
 * - commandes via une boîte aux lettres mpsc : traitées dans l'ordre d'arrivée,
 *   chacune acquittée (ActionAcknowledged) avant son effet
 * - chaque événement est appliqué à l'agrégateur puis publié sur le bus
 * - phases : Idle -> Connect -> Online, Backoff entre deux tentatives ;
 *   toute attente (handshake, SUBACK, lecture socket, timer) est interruptible
 *   par une commande ou par l'arrêt global
 * - abandonner une phase Connect drop la session en cours : pas de socket orphelin
 *
 * ERREURS :
 * - Transport : Failure(retrying) puis backoff exponentiel, Error après
 *   `max_attempts` échecs consécutifs
 * - Auth / Protocol à la connexion : Error immédiat, restart manuel requis
 * - payload illisible : loggé puis ignoré
 */

use crate::aggregator::StatusAggregator;
use crate::broker::{BackoffPolicy, BrokerError, BrokerInbound, BrokerSession, BrokerTransport};
use crate::bus::EventBus;
use crate::events::{parse_notification, CloseReason, Event, NodeAction};
use crate::models::{ConnectionState, Node, NodeId};
use crate::registry::NodeRegistry;
use crate::state::{new_state, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown node_id {0}")]
    UnknownNode(NodeId),
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("node {0} is not accepting commands")]
    Unavailable(NodeId),
}

struct NodeHandle {
    commands: mpsc::Sender<NodeAction>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn BrokerTransport>,
    aggregator: Arc<StatusAggregator>,
    events: EventBus<Event>,
    backoff: BackoffPolicy,
    workers: Shared<HashMap<NodeId, NodeHandle>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn BrokerTransport>,
        aggregator: Arc<StatusAggregator>,
        events: EventBus<Event>,
        backoff: BackoffPolicy,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            registry,
            transport,
            aggregator,
            events,
            backoff,
            workers: new_state(HashMap::new()),
            shutdown: shutdown.child_token(),
        }
    }

    /// Met la commande en file pour le worker du nœud (créé au besoin).
    /// Retour Ok = commande acceptée, pas exécutée.
    fn submit(&self, node_id: NodeId, action: NodeAction) -> Result<(), CommandError> {
        let node = self
            .registry
            .get(node_id)
            .ok_or(CommandError::UnknownNode(node_id))?;
        if self.shutdown.is_cancelled() {
            return Err(CommandError::Unavailable(node_id));
        }

        let mut workers = self.workers.lock();
        let handle = workers
            .entry(node_id)
            .or_insert_with(|| self.spawn_worker(node));
        handle.commands.try_send(action).map_err(|e| {
            warn!(node_id, %action, error = %e, "node mailbox rejected command");
            CommandError::Unavailable(node_id)
        })?;
        debug!(node_id, %action, "command queued");
        Ok(())
    }

    pub fn start(&self, node_id: NodeId) -> Result<(), CommandError> {
        self.submit(node_id, NodeAction::Start)
    }

    pub fn stop(&self, node_id: NodeId) -> Result<(), CommandError> {
        self.submit(node_id, NodeAction::Stop)
    }

    pub fn restart(&self, node_id: NodeId) -> Result<(), CommandError> {
        self.submit(node_id, NodeAction::Restart)
    }

    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Hook de démarrage : lance tous les nœuds marqués actifs
    pub fn ensure_monitoring(&self) -> usize {
        let mut started = 0;
        for node in self.registry.active_nodes() {
            match self.start(node.id) {
                Ok(()) => started += 1,
                Err(e) => warn!(node_id = node.id, error = %e, "could not start monitoring"),
            }
        }
        info!(started, total = self.registry.len(), "monitoring ensured for active nodes");
        started
    }

    /// Arrête tous les workers et attend qu'ils aient fermé leur session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .drain()
            .map(|(_, handle)| handle.task)
            .collect();
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "node worker panicked");
            }
        }
        info!(workers = count, "connection manager stopped");
    }

    fn spawn_worker(&self, node: Arc<Node>) -> NodeHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let worker = NodeWorker {
            node,
            transport: Arc::clone(&self.transport),
            aggregator: Arc::clone(&self.aggregator),
            events: self.events.clone(),
            backoff: self.backoff,
            commands: commands_rx,
            state: ConnectionState::Stopped,
            shutdown: self.shutdown.clone(),
        };
        NodeHandle {
            commands: commands_tx,
            task: tokio::spawn(worker.run()),
        }
    }
}

enum Phase {
    /// Stopped ou Error : attend une commande
    Idle,
    Connect { attempt: u32 },
    Online(Box<dyn BrokerSession>),
    Backoff { next_attempt: u32, delay: Duration },
    Exit,
}

enum Step<T> {
    Shutdown,
    Command(Option<NodeAction>),
    Ready(T),
}

struct NodeWorker {
    node: Arc<Node>,
    transport: Arc<dyn BrokerTransport>,
    aggregator: Arc<StatusAggregator>,
    events: EventBus<Event>,
    backoff: BackoffPolicy,
    commands: mpsc::Receiver<NodeAction>,
    state: ConnectionState,
    shutdown: CancellationToken,
}

impl NodeWorker {
    async fn run(mut self) {
        debug!(node_id = self.node.id, "node worker started");
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect { attempt } => self.connect(attempt).await,
                Phase::Online(session) => self.online(session).await,
                Phase::Backoff { next_attempt, delay } => self.wait_backoff(next_attempt, delay).await,
                Phase::Exit => break,
            };
        }
        debug!(node_id = self.node.id, "node worker exited");
    }

    /// Agrégateur d'abord : le statut ne dépend pas des files du bus
    fn emit(&self, event: Event) {
        self.aggregator.apply(&event);
        self.events.publish(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    fn acknowledge(&self, action: NodeAction) {
        self.emit(Event::ActionAcknowledged { node_id: self.node.id, action });
    }

    fn closed_on_request(&mut self) {
        self.set_state(ConnectionState::Stopped);
        self.emit(Event::ConnectionClosed {
            node_id: self.node.id,
            reason: CloseReason::Requested,
            retrying: false,
        });
    }

    async fn idle(&mut self) -> Phase {
        let step: Step<()> = tokio::select! {
            _ = self.shutdown.cancelled() => Step::Shutdown,
            cmd = self.commands.recv() => Step::Command(cmd),
        };
        match step {
            Step::Command(Some(action)) => {
                self.acknowledge(action);
                match action {
                    NodeAction::Start | NodeAction::Restart => Phase::Connect { attempt: 1 },
                    NodeAction::Stop => {
                        // Error -> Stopped ; déjà Stopped : rien à faire
                        if matches!(self.state, ConnectionState::Error(_)) {
                            self.closed_on_request();
                        }
                        Phase::Idle
                    }
                }
            }
            Step::Shutdown | Step::Command(None) | Step::Ready(()) => Phase::Exit,
        }
    }

    async fn connect(&mut self, attempt: u32) -> Phase {
        let node_id = self.node.id;
        self.set_state(ConnectionState::Connecting);
        self.emit(Event::Connecting { node_id, attempt });
        info!(node_id, attempt, broker = %self.node.broker_url, "connecting to broker");

        let transport = Arc::clone(&self.transport);
        let node = Arc::clone(&self.node);
        let attempt_fut = async move {
            let mut session = transport.connect(&node).await?;
            session.subscribe(&node.topics).await?;
            Ok::<_, BrokerError>(session)
        };
        tokio::pin!(attempt_fut);

        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Step::Shutdown,
                res = &mut attempt_fut => Step::Ready(res),
                cmd = self.commands.recv() => Step::Command(cmd),
            };
            match step {
                Step::Ready(Ok(session)) => {
                    let subscriptions = self.node.topics.len();
                    self.set_state(ConnectionState::Connected);
                    self.emit(Event::ConnectionOpened { node_id, subscriptions });
                    info!(node_id, subscriptions, "node connected");
                    return Phase::Online(session);
                }
                Step::Ready(Err(e)) => return self.attempt_failed(attempt, e),
                Step::Command(Some(action)) => {
                    self.acknowledge(action);
                    match action {
                        // déjà Connecting
                        NodeAction::Start => continue,
                        NodeAction::Stop => {
                            info!(node_id, "connect attempt cancelled");
                            self.closed_on_request();
                            return Phase::Idle;
                        }
                        NodeAction::Restart => {
                            self.closed_on_request();
                            return Phase::Connect { attempt: 1 };
                        }
                    }
                }
                Step::Shutdown | Step::Command(None) => return Phase::Exit,
            }
        }
    }

    fn attempt_failed(&mut self, attempt: u32, err: BrokerError) -> Phase {
        let node_id = self.node.id;
        if err.is_retriable() && !self.backoff.exhausted(attempt) {
            let delay = self.backoff.delay_after(attempt);
            warn!(node_id, attempt, error = %err, retry_in_ms = delay.as_millis() as u64, "connect attempt failed");
            self.set_state(ConnectionState::Disconnected);
            self.emit(Event::Failure { node_id, error: err.to_string(), retrying: true });
            return Phase::Backoff { next_attempt: attempt + 1, delay };
        }

        let reason = if err.is_retriable() {
            format!("gave up after {attempt} attempts: {err}")
        } else {
            err.to_string()
        };
        error!(node_id, attempt, fatal = err.is_fatal(), error = %reason, "node entering error state");
        self.set_state(ConnectionState::Error(reason.clone()));
        self.emit(Event::Failure { node_id, error: reason, retrying: false });
        Phase::Idle
    }

    async fn online(&mut self, mut session: Box<dyn BrokerSession>) -> Phase {
        let node_id = self.node.id;
        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Step::Shutdown,
                inbound = session.next_inbound() => Step::Ready(inbound),
                cmd = self.commands.recv() => Step::Command(cmd),
            };
            match step {
                Step::Ready(Ok(BrokerInbound::Publish { topic, payload })) => {
                    self.on_publish(topic, &payload);
                }
                Step::Ready(Ok(BrokerInbound::Closed(why))) => {
                    warn!(node_id, reason = %why, "broker closed the connection");
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(Event::ConnectionClosed {
                        node_id,
                        reason: CloseReason::Remote(why),
                        retrying: true,
                    });
                    return self.link_lost();
                }
                Step::Ready(Err(e)) if e.is_retriable() => {
                    warn!(node_id, error = %e, "connection lost");
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(Event::Failure { node_id, error: e.to_string(), retrying: true });
                    return self.link_lost();
                }
                Step::Ready(Err(e)) => {
                    error!(node_id, error = %e, "fatal broker error");
                    self.set_state(ConnectionState::Error(e.to_string()));
                    self.emit(Event::Failure { node_id, error: e.to_string(), retrying: false });
                    return Phase::Idle;
                }
                Step::Command(Some(action)) => {
                    self.acknowledge(action);
                    match action {
                        NodeAction::Start => {}
                        NodeAction::Stop => {
                            session.disconnect().await;
                            info!(node_id, "node stopped");
                            self.closed_on_request();
                            return Phase::Idle;
                        }
                        NodeAction::Restart => {
                            session.disconnect().await;
                            info!(node_id, "node restarting");
                            self.closed_on_request();
                            return Phase::Connect { attempt: 1 };
                        }
                    }
                }
                Step::Shutdown | Step::Command(None) => {
                    session.disconnect().await;
                    return Phase::Exit;
                }
            }
        }
    }

    fn link_lost(&self) -> Phase {
        Phase::Backoff { next_attempt: 1, delay: self.backoff.base }
    }

    fn on_publish(&self, topic: String, payload: &[u8]) {
        match parse_notification(payload) {
            Ok(n) => self.emit(Event::MessageReceived {
                node_id: self.node.id,
                topic,
                timestamp: OffsetDateTime::now_utc(),
                geometry: n.geometry,
                data_id: n.data_id,
                wigos_id: n.wigos_id,
            }),
            Err(e) => {
                warn!(node_id = self.node.id, %topic, bytes = payload.len(), error = %e, "malformed payload dropped")
            }
        }
    }

    async fn wait_backoff(&mut self, next_attempt: u32, delay: Duration) -> Phase {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Step::Shutdown,
                _ = &mut timer => Step::Ready(()),
                cmd = self.commands.recv() => Step::Command(cmd),
            };
            match step {
                Step::Ready(()) => return Phase::Connect { attempt: next_attempt },
                Step::Command(Some(action)) => {
                    self.acknowledge(action);
                    match action {
                        // reprise immédiate, compteur remis à zéro
                        NodeAction::Start | NodeAction::Restart => {
                            return Phase::Connect { attempt: 1 }
                        }
                        NodeAction::Stop => {
                            debug!(node_id = self.node.id, "backoff cancelled");
                            self.closed_on_request();
                            return Phase::Idle;
                        }
                    }
                }
                Step::Shutdown | Step::Command(None) => return Phase::Exit,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::testing::{
        harness, harness_with_capacity, wait_for_state, wait_for_status, wait_until, Behaviour,
        Harness,
    };

    const POINT: &[u8] =
        br#"{"geometry": {"type": "Point", "coordinates": [34.3, -13.2]}, "properties": {}}"#;

    async fn recv_until(sub: &mut Subscription<Event>, pred: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = sub.recv().await.expect("bus open");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn start_connects_and_subscribes_every_topic() {
        let Harness { manager, broker, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;

        assert_eq!(broker.connects(1), 1);
        assert_eq!(broker.subscriptions(1), vec!["t1".to_string(), "t2".to_string()]);

        let status = aggregator.get(1).unwrap();
        assert_eq!(status.subscription_count, 2);
        assert_eq!(status.message_count, 0);
        assert_eq!(status.successful_connections, 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_one_worker_per_node() {
        let Harness { manager, broker, aggregator, .. } = harness();
        for _ in 0..5 {
            manager.start(1).unwrap();
        }
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        manager.start(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.worker_count(), 1);
        assert_eq!(broker.connects(1), 1);
        assert_eq!(broker.live_sessions(), 1);
    }

    #[tokio::test]
    async fn unknown_node_is_rejected() {
        let Harness { manager, aggregator, .. } = harness();
        assert_eq!(manager.start(9999), Err(CommandError::UnknownNode(9999)));
        assert_eq!(manager.restart(9999), Err(CommandError::UnknownNode(9999)));
        assert_eq!(manager.worker_count(), 0);
        assert!(aggregator.get(9999).is_none());
        assert_eq!(aggregator.get(2).unwrap().state, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn every_command_is_acknowledged_first() {
        let Harness { manager, events, .. } = harness();
        let mut sub = events.subscribe();
        manager.start(1).unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first, Event::ActionAcknowledged { node_id: 1, action: NodeAction::Start });
        assert_eq!(sub.recv().await.unwrap(), Event::Connecting { node_id: 1, attempt: 1 });
        assert_eq!(
            sub.recv().await.unwrap(),
            Event::ConnectionOpened { node_id: 1, subscriptions: 2 }
        );
    }

    #[tokio::test]
    async fn messages_are_parsed_and_malformed_payloads_dropped() {
        let Harness { manager, broker, events, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;

        let mut sub = events.subscribe();
        broker.publish(1, "origin/a/wis2/mw/data", b"not json");
        broker.publish(1, "origin/a/wis2/mw/data", POINT);

        match sub.recv().await.unwrap() {
            Event::MessageReceived { node_id, topic, geometry, .. } => {
                assert_eq!(node_id, 1);
                assert_eq!(topic, "origin/a/wis2/mw/data");
                assert_eq!(geometry, Some(crate::events::GeoPoint(34.3, -13.2)));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(sub.try_recv().is_none());
        let status = aggregator.get(1).unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.message_count, 1);
    }

    #[tokio::test]
    async fn status_survives_a_saturated_event_bus() {
        let Harness { manager, broker, events, aggregator, .. } = harness_with_capacity(4);
        // abonné qui ne lit jamais : sa file déborde
        let stalled = events.subscribe();

        manager.start(1).unwrap();
        wait_until(|| broker.connects(1) == 1 && !broker.subscriptions(1).is_empty()).await;
        for _ in 0..10 {
            broker.publish(1, "t1", POINT);
        }

        let status = wait_for_status(&aggregator, 1, |s| s.message_count == 10).await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.subscription_count, 2);
        assert!(stalled.dropped() > 0);
    }

    #[tokio::test]
    async fn stop_disconnects_and_releases_the_session() {
        let Harness { manager, broker, events, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        let mut sub = events.subscribe();

        manager.stop(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Stopped).await;

        assert_eq!(sub.recv().await.unwrap(), Event::ActionAcknowledged { node_id: 1, action: NodeAction::Stop });
        assert_eq!(
            sub.recv().await.unwrap(),
            Event::ConnectionClosed { node_id: 1, reason: CloseReason::Requested, retrying: false }
        );
        assert_eq!(broker.graceful_disconnects(1), 1);
        assert_eq!(broker.live_sessions(), 0);
    }

    #[tokio::test]
    async fn restart_zeroes_message_count_after_reconnect() {
        let Harness { manager, broker, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        for _ in 0..3 {
            broker.publish(1, "t1", POINT);
        }
        wait_for_status(&aggregator, 1, |s| s.message_count == 3).await;

        manager.restart(1).unwrap();
        let status = wait_for_status(&aggregator, 1, |s| {
            s.state == ConnectionState::Connected && s.message_count == 0
        })
        .await;
        assert_eq!(status.message_count, 0);
        assert_eq!(broker.connects(1), 2);
        assert_eq!(broker.live_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_ends_in_error_after_ten_attempts() {
        let Harness { manager, broker, events, aggregator, .. } = harness();
        broker.set_behaviour(2, Behaviour::Refuse(BrokerError::Transport("connection refused".into())));
        let mut sub = events.subscribe();
        manager.start(2).unwrap();

        let mut states = Vec::new();
        loop {
            let event = sub.recv().await.unwrap();
            match event {
                Event::Connecting { attempt, .. } => states.push(format!("connecting#{attempt}")),
                Event::Failure { retrying: true, .. } => states.push("disconnected".into()),
                Event::Failure { retrying: false, .. } => {
                    states.push("error".into());
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(broker.connects(2), 10);
        assert_eq!(states.first().map(String::as_str), Some("connecting#1"));
        assert_eq!(states[1], "disconnected");
        assert_eq!(states[2], "connecting#2");
        assert_eq!(states.last().map(String::as_str), Some("error"));

        let status = aggregator.get(2).unwrap();
        assert!(matches!(status.state, ConnectionState::Error(_)));
        assert_eq!(status.connection_attempts, 10);
        assert_eq!(status.failed_connections, 10);

        // plus aucune tentative automatique
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(broker.connects(2), 10);
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_without_retry() {
        let Harness { manager, broker, aggregator, .. } = harness();
        broker.set_behaviour(1, Behaviour::Refuse(BrokerError::Auth("bad username or password".into())));
        manager.start(1).unwrap();
        let status =
            wait_for_status(&aggregator, 1, |s| matches!(s.state, ConnectionState::Error(_))).await;
        assert!(status.state.to_string().contains("bad username"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connects(1), 1);

        // restart explicite : nouvelle tentative
        broker.set_behaviour(1, Behaviour::Accept);
        manager.restart(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        assert_eq!(broker.connects(1), 2);
    }

    #[tokio::test]
    async fn stop_in_error_moves_to_stopped() {
        let Harness { manager, broker, events, aggregator, .. } = harness();
        broker.set_behaviour(1, Behaviour::Refuse(BrokerError::Auth("not authorized".into())));
        manager.start(1).unwrap();
        wait_for_status(&aggregator, 1, |s| matches!(s.state, ConnectionState::Error(_))).await;

        let mut sub = events.subscribe();
        manager.stop(1).unwrap();
        assert_eq!(sub.recv().await.unwrap(), Event::ActionAcknowledged { node_id: 1, action: NodeAction::Stop });
        assert_eq!(
            sub.recv().await.unwrap(),
            Event::ConnectionClosed { node_id: 1, reason: CloseReason::Requested, retrying: false }
        );

        let status = aggregator.get(1).unwrap();
        assert_eq!(status.state, ConnectionState::Stopped);
        assert!(status.error.is_none());
        assert_eq!(broker.connects(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_or_restart_during_backoff_reconnects_at_once() {
        for action in [NodeAction::Start, NodeAction::Restart] {
            let Harness { manager, broker, events, aggregator, .. } = harness();
            broker.set_behaviour(2, Behaviour::Refuse(BrokerError::Transport("timeout".into())));
            let mut sub = events.subscribe();
            manager.start(2).unwrap();

            // troisième échec : prochain essai dans 400 ms
            recv_until(&mut sub, |e| matches!(e, Event::Connecting { attempt: 3, .. })).await;
            recv_until(&mut sub, |e| matches!(e, Event::Failure { retrying: true, .. })).await;
            assert_eq!(aggregator.get(2).unwrap().reconnect_attempts, 2);

            broker.set_behaviour(2, Behaviour::Accept);
            let before = tokio::time::Instant::now();
            manager.submit(2, action).unwrap();

            assert_eq!(sub.recv().await.unwrap(), Event::ActionAcknowledged { node_id: 2, action });
            assert_eq!(sub.recv().await.unwrap(), Event::Connecting { node_id: 2, attempt: 1 });
            assert_eq!(
                sub.recv().await.unwrap(),
                Event::ConnectionOpened { node_id: 2, subscriptions: 1 }
            );
            assert!(before.elapsed() < Duration::from_millis(400), "{action} waited for the timer");
            assert_eq!(broker.connects(2), 4);

            let status = aggregator.get(2).unwrap();
            assert_eq!(status.reconnect_attempts, 0);
            let attempts = if action == NodeAction::Restart { 1 } else { 4 };
            assert_eq!(status.connection_attempts, attempts, "{action}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_from_error_zeroes_counters_before_next_connect() {
        let Harness { manager, broker, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        for _ in 0..3 {
            broker.publish(1, "t1", POINT);
        }
        wait_for_status(&aggregator, 1, |s| s.message_count == 3).await;

        // lien perdu puis reconnexion refusée : Error avec les compteurs intacts
        broker.set_behaviour(1, Behaviour::Refuse(BrokerError::Auth("not authorized".into())));
        broker.drop_link(1);
        let status =
            wait_for_status(&aggregator, 1, |s| matches!(s.state, ConnectionState::Error(_))).await;
        assert_eq!(status.message_count, 3);

        let mut updates = aggregator.updates().subscribe();
        broker.set_behaviour(1, Behaviour::Accept);
        manager.restart(1).unwrap();

        loop {
            let update = updates.recv().await.unwrap();
            assert_eq!(update.message_count, 0, "{update:?}");
            assert_eq!(update.error_count, 0, "{update:?}");
            if update.state == ConnectionState::Connected {
                assert_eq!(update.successful_connections, 1);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_backoff() {
        let Harness { manager, broker, aggregator, .. } = harness();
        broker.set_behaviour(2, Behaviour::Refuse(BrokerError::Transport("timeout".into())));
        manager.start(2).unwrap();
        wait_for_state(&aggregator, 2, ConnectionState::Disconnected).await;

        manager.stop(2).unwrap();
        wait_for_state(&aggregator, 2, ConnectionState::Stopped).await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(broker.connects(2), 1);
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_connect_without_leaking() {
        let Harness { manager, broker, aggregator, .. } = harness();
        broker.set_behaviour(1, Behaviour::Hang);
        manager.start(1).unwrap();
        wait_until(|| broker.connects(1) == 1).await;
        assert_eq!(broker.live_sessions(), 1);

        manager.stop(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Stopped).await;
        wait_until(|| broker.live_sessions() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_reconnects() {
        let Harness { manager, broker, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;

        broker.drop_link(1);
        wait_for_state(&aggregator, 1, ConnectionState::Disconnected).await;
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        assert_eq!(broker.connects(1), 2);
        assert_eq!(broker.live_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_broker_disconnect_reconnects() {
        let Harness { manager, broker, events, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        let mut sub = events.subscribe();

        broker.close_link(1, "broker sent DISCONNECT");
        assert_eq!(
            sub.recv().await.unwrap(),
            Event::ConnectionClosed {
                node_id: 1,
                reason: CloseReason::Remote("broker sent DISCONNECT".into()),
                retrying: true,
            }
        );
        let status = aggregator.get(1).unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.error.as_deref(), Some("broker sent DISCONNECT"));

        assert_eq!(sub.recv().await.unwrap(), Event::Connecting { node_id: 1, attempt: 1 });
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        assert_eq!(broker.connects(1), 2);
        assert_eq!(broker.graceful_disconnects(1), 0);
        assert_eq!(broker.live_sessions(), 1);
    }

    #[tokio::test]
    async fn ensure_monitoring_starts_active_nodes_only() {
        let Harness { manager, aggregator, .. } = harness();
        assert_eq!(manager.ensure_monitoring(), 2);
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;
        assert_eq!(aggregator.get(3).unwrap().state, ConnectionState::Stopped);
        assert_eq!(manager.worker_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let Harness { manager, broker, aggregator, .. } = harness();
        manager.start(1).unwrap();
        wait_for_state(&aggregator, 1, ConnectionState::Connected).await;

        manager.shutdown().await;
        assert_eq!(broker.live_sessions(), 0);
        assert_eq!(manager.worker_count(), 0);
        assert_eq!(manager.start(1), Err(CommandError::Unavailable(1)));
    }
}
