use crate::aggregator::StatusAggregator;
use crate::bus::EventBus;
use crate::events::Event;
use crate::models::NodeStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemHealth {
    pub uptime_seconds: u64,
    pub nodes_tracked: usize,
    pub nodes_connected: usize,
    pub nodes_in_error: usize,
    pub nodes_stale: usize,
    pub ws_clients: usize,
    pub bus_subscribers: usize,
    /// Éléments jetés par les files pleines (événements + statuts)
    pub events_dropped: u64,
    pub memory_usage_mb: Option<f32>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    ws_clients: Arc<AtomicUsize>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ws_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client_connected(&self) -> usize {
        self.ws_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) -> usize {
        self.ws_clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn ws_clients(&self) -> usize {
        self.ws_clients.load(Ordering::Relaxed)
    }

    pub fn get_health(
        &self,
        aggregator: &StatusAggregator,
        events: &EventBus<Event>,
    ) -> SystemHealth {
        let counts = aggregator.counts();
        let updates: &EventBus<NodeStatus> = aggregator.updates();
        SystemHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_tracked: counts.tracked,
            nodes_connected: counts.connected,
            nodes_in_error: counts.in_error,
            nodes_stale: counts.stale,
            ws_clients: self.ws_clients(),
            bus_subscribers: events.subscriber_count(),
            events_dropped: events.dropped_total() + updates.dropped_total(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    /// Log périodique de l'état du moniteur
    pub fn spawn_health_reporter(
        &self,
        aggregator: Arc<StatusAggregator>,
        events: EventBus<Event>,
        every: Duration,
        shutdown: CancellationToken,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // premier tick immédiat ignoré
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let h = tracker.get_health(&aggregator, &events);
                        info!(
                            uptime_s = h.uptime_seconds,
                            nodes = h.nodes_tracked,
                            connected = h.nodes_connected,
                            in_error = h.nodes_in_error,
                            stale = h.nodes_stale,
                            ws_clients = h.ws_clients,
                            dropped = h.events_dropped,
                            "monitor health"
                        );
                    }
                }
            }
        });
    }
}

fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb: u64 = status
            .lines()
            .find(|l| l.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
