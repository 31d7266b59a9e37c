/**
 * TRANSPORT MQTT - Implémentation rumqttc de `BrokerTransport`
 *
 * FONCTIONNEMENT :
 * - une paire AsyncClient/EventLoop par tentative de connexion
 * - handshake borné par `connect_timeout_secs` ; les codes CONNACK de refus
 *   sont traduits en Auth / Transport / Protocol
 * - SUBACK attendus pour chaque topic avant de déclarer la session ouverte ;
 *   les publications arrivées entre-temps sont mises en tampon
 * - le socket appartient à l'EventLoop : le drop de la session le ferme
 */

use crate::broker::{BrokerError, BrokerInbound, BrokerSession, BrokerTransport};
use crate::config::MqttConf;
use crate::models::Node;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, SubscribeFilter, SubscribeReasonCode, Transport,
};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Adresse de broker décodée depuis `broker_url`
/// (`mqtt://`, `tcp://`, `mqtts://`, `ssl://`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerAddress {
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let url = Url::parse(raw)
            .map_err(|e| BrokerError::Protocol(format!("invalid broker url {raw:?}: {e}")))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unsupported broker url scheme {other:?}"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BrokerError::Protocol(format!("broker url {raw:?} has no host")))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(str::to_string);

        Ok(Self { host, port, tls, username, password })
    }
}

pub struct RumqttTransport {
    conf: MqttConf,
}

impl RumqttTransport {
    pub fn new(conf: MqttConf) -> Self {
        Self { conf }
    }

    fn options(&self, node: &Node, addr: &BrokerAddress) -> MqttOptions {
        let client_id = format!("{}_node_{}", self.conf.client_id_prefix, node.id);
        let mut opts = MqttOptions::new(client_id, addr.host.clone(), addr.port);
        opts.set_keep_alive(Duration::from_secs(self.conf.keep_alive_secs.max(5)));
        opts.set_clean_session(true);

        // identifiants du nœud prioritaires sur ceux de l'URL
        let username = node.username.clone().or_else(|| addr.username.clone());
        let password = node.password.clone().or_else(|| addr.password.clone());
        if let Some(user) = username {
            opts.set_credentials(user, password.unwrap_or_default());
        }
        if addr.tls {
            opts.set_transport(Transport::tls_with_default_config());
        }
        opts
    }
}

#[async_trait]
impl BrokerTransport for RumqttTransport {
    async fn connect(&self, node: &Node) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let addr = BrokerAddress::parse(&node.broker_url)?;
        let (client, mut eventloop) =
            AsyncClient::new(self.options(node, &addr), self.conf.request_capacity);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => return check_connack(ack.code),
                    Ok(_) => continue,
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        };
        timeout(self.conf.connect_timeout(), handshake)
            .await
            .map_err(|_| {
                BrokerError::Transport(format!(
                    "handshake with {}:{} timed out",
                    addr.host, addr.port
                ))
            })??;

        info!(node_id = node.id, host = %addr.host, port = addr.port, tls = addr.tls, "mqtt handshake complete");
        Ok(Box::new(RumqttSession {
            client,
            eventloop,
            pending: VecDeque::new(),
            ack_timeout: self.conf.connect_timeout(),
        }))
    }
}

struct RumqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Publications reçues pendant l'attente des SUBACK
    pending: VecDeque<BrokerInbound>,
    ack_timeout: Duration,
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn subscribe(&mut self, topics: &BTreeSet<String>) -> Result<(), BrokerError> {
        if topics.is_empty() {
            return Ok(());
        }
        // un seul SUBSCRIBE pour tous les topics => un seul SUBACK
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| BrokerError::Transport(format!("subscribe: {e}")))?;

        let eventloop = &mut self.eventloop;
        let pending = &mut self.pending;
        let wait_ack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                        let refused: Vec<&String> = topics
                            .iter()
                            .zip(ack.return_codes.iter())
                            .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
                            .map(|(topic, _)| topic)
                            .collect();
                        if !refused.is_empty() {
                            return Err(BrokerError::Protocol(format!(
                                "broker refused subscription to {refused:?}"
                            )));
                        }
                        return Ok(());
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        pending.push_back(BrokerInbound::Publish {
                            topic: p.topic,
                            payload: p.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        };
        timeout(self.ack_timeout, wait_ack)
            .await
            .map_err(|_| BrokerError::Transport("timed out waiting for SUBACK".into()))??;

        debug!(topics = topics.len(), "subscriptions acknowledged");
        Ok(())
    }

    async fn next_inbound(&mut self) -> Result<BrokerInbound, BrokerError> {
        if let Some(buffered) = self.pending.pop_front() {
            return Ok(buffered);
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    return Ok(BrokerInbound::Publish {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    })
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    return Ok(BrokerInbound::Closed("broker sent DISCONNECT".into()))
                }
                Ok(_) => {}
                Err(e) => return Err(map_connection_error(e)),
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }
        // laisse l'EventLoop émettre le DISCONNECT avant le drop du socket
        let eventloop = &mut self.eventloop;
        let _ = timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}

fn check_connack(code: ConnectReturnCode) -> Result<(), BrokerError> {
    match code {
        ConnectReturnCode::Success => Ok(()),
        other => Err(refused(other)),
    }
}

fn refused(code: ConnectReturnCode) -> BrokerError {
    match code {
        ConnectReturnCode::BadUserNamePassword => {
            BrokerError::Auth("connection refused: bad username or password".into())
        }
        ConnectReturnCode::NotAuthorized => {
            BrokerError::Auth("connection refused: not authorized".into())
        }
        ConnectReturnCode::ServiceUnavailable => {
            BrokerError::Transport("connection refused: server unavailable".into())
        }
        ConnectReturnCode::RefusedProtocolVersion => {
            BrokerError::Protocol("connection refused: unsupported protocol version".into())
        }
        ConnectReturnCode::BadClientId => {
            BrokerError::Protocol("connection refused: client identifier rejected".into())
        }
        ConnectReturnCode::Success => BrokerError::Protocol("unexpected CONNACK".into()),
    }
}

fn map_connection_error(e: ConnectionError) -> BrokerError {
    match e {
        ConnectionError::ConnectionRefused(code) => refused(code),
        other => BrokerError::Transport(other.to_string()),
    }
}
