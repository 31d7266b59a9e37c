/**
 * WIS2WATCH MONITOR - Point d'entrée du moniteur temps réel des nœuds WIS2
 *
 * RÔLE : Bootstrap complet : config, logs, registre des nœuds, bus, agrégateur,
 * workers MQTT, serveur HTTP + WebSocket, arrêt propre sur Ctrl-C.
 *
 * ARCHITECTURE : workers MQTT -> agrégateur de statut -> bus des statuts
 * -> sessions WebSocket (une tâche par dashboard) ; les messages reçus passent
 * par le bus d'événements.
 */

mod aggregator;
mod broker;
mod bus;
mod config;
mod events;
mod health;
mod http;
mod manager;
mod models;
mod mqtt;
mod registry;
mod session;
mod state;
#[cfg(test)]
mod testing;

use crate::aggregator::StatusAggregator;
use crate::bus::EventBus;
use crate::config::{load_config, LogFormat};
use crate::events::Event;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::manager::ConnectionManager;
use crate::mqtt::RumqttTransport;
use crate::registry::NodeRegistry;
use crate::state::spawn_ctrl_c_watcher;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const HEALTH_LOG_EVERY: Duration = Duration::from_secs(60);

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wis2watch_monitor=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    let cfg = load_config().await.context("loading wis2watch configuration")?;
    init_tracing(cfg.log_format);

    let shutdown = CancellationToken::new();
    let registry = Arc::new(NodeRegistry::new(cfg.nodes.clone()));
    info!(nodes = registry.len(), "node registry loaded");

    // bus + agrégateur, alimentés directement par les workers
    let events: EventBus<Event> = EventBus::new(cfg.bus.queue_capacity);
    let aggregator = Arc::new(StatusAggregator::new(
        &registry,
        EventBus::new(cfg.bus.queue_capacity),
    ));

    let transport = Arc::new(RumqttTransport::new(cfg.mqtt.clone()));
    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&registry),
        transport,
        Arc::clone(&aggregator),
        events.clone(),
        cfg.backoff.policy(),
        &shutdown,
    ));
    manager.ensure_monitoring();

    let health_tracker = HealthTracker::new();
    health_tracker.spawn_health_reporter(
        Arc::clone(&aggregator),
        events.clone(),
        HEALTH_LOG_EVERY,
        shutdown.clone(),
    );
    spawn_ctrl_c_watcher(shutdown.clone());

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        registry,
        aggregator: Arc::clone(&aggregator),
        manager: Arc::clone(&manager),
        events: events.clone(),
        health_tracker,
        shutdown: shutdown.clone(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("http server")?;

    // arrêt : sessions broker fermées, puis bus
    shutdown.cancel();
    manager.shutdown().await;
    events.close();
    aggregator.updates().close();
    info!("wis2watch monitor stopped");
    Ok(())
}
