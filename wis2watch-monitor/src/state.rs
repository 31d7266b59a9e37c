/**
 * ÉTAT PARTAGÉ - Primitives de partage entre tâches du moniteur
 *
 * RÔLE : `Shared<T>` = table protégée par un mutex court (parking_lot), utilisée
 * pour les entrées de statut par nœud, la table des workers et les abonnés du bus.
 * Signal d'arrêt global (Ctrl-C) propagé par CancellationToken.
 */

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Annule `token` à la réception de Ctrl-C (ou si le token est annulé ailleurs).
pub fn spawn_ctrl_c_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("shutdown requested (ctrl-c)"),
                    Err(e) => warn!(error = %e, "ctrl-c handler failed, shutting down"),
                }
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}
