/**
 * BROKER - Contrat entre la machine à états d'un nœud et le transport MQTT
 *
 * RÔLE :
 * - `BrokerTransport` ouvre une session (TCP + handshake MQTT) vers le broker d'un nœud
 * - `BrokerSession` souscrit aux topics puis livre les publications entrantes
 * - `BrokerError` classe les erreurs : Transport (réessayée), Protocol, Auth (fatales)
 * - `BackoffPolicy` calcule les délais de reconnexion
 *
 * L'implémentation réelle (rumqttc) vit dans `mqtt.rs` ; les tests utilisent
 * un broker scripté en mémoire.
 */

use crate::models::Node;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// Réseau / broker injoignable : réessayée avec backoff
    #[error("transport error: {0}")]
    Transport(String),
    /// Réponse broker invalide ou payload illisible
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Identifiants refusés : pas de reconnexion automatique
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl BrokerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }

    /// Auth : le nœud passe en Error sans nouvelle tentative
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Auth(_))
    }
}

/// Ce qu'une session livre en attendant sur le socket
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerInbound {
    Publish { topic: String, payload: Vec<u8> },
    /// Le broker a fermé proprement la connexion
    Closed(String),
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Ouvre la connexion et attend l'acquittement du handshake
    async fn connect(&self, node: &Node) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send {
    /// Souscrit à chaque topic et attend les acquittements
    async fn subscribe(&mut self, topics: &BTreeSet<String>) -> Result<(), BrokerError>;

    /// Attend la prochaine publication (ou la fermeture du lien)
    async fn next_inbound(&mut self) -> Result<BrokerInbound, BrokerError>;

    /// Fermeture propre ; le socket est libéré au drop de la session
    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Échecs consécutifs tolérés avant l'état Error
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Délai avant la tentative suivant l'échec n° `failed_attempt` (1-based) :
    /// base * 2^(n-1), plafonné à `max`
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn exhausted(&self, failed_attempt: u32) -> bool {
        failed_attempt >= self.max_attempts
    }
}
