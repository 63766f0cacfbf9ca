use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use liburanus::{AgentError, Inbound, Outbound, Transport};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uranus_protocol::{AgentStatus, StatusMessage, Topics, topic_matches};

const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_QUEUE: usize = 256;
const MAX_PACKET_BYTES: usize = 256 * 1024;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const OFFLINE_FLUSH: Duration = Duration::from_secs(2);

/// MQTT-backed [`Transport`].
///
/// The connection is driven by [`MqttTransport::run`]; subscriptions made
/// through the trait are remembered and re-established on every ConnAck.
/// Publishing never waits on the network: when the request queue is full
/// the message is dropped and the caller gets an error.
pub struct MqttTransport {
    client: AsyncClient,
    topics: Topics,
    subscriptions: RwLock<Vec<(String, mpsc::Sender<Inbound>)>>,
}

impl MqttTransport {
    pub fn new(broker_url: &str, topics: Topics) -> Result<(Arc<Self>, EventLoop)> {
        let options = mqtt_options(broker_url, &topics)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE);
        Ok((
            Arc::new(Self {
                client,
                topics,
                subscriptions: RwLock::new(Vec::new()),
            }),
            eventloop,
        ))
    }

    /// Poll the connection until `shutdown` fires, then announce offline
    /// and disconnect.
    pub async fn run(self: Arc<Self>, mut eventloop: EventLoop, shutdown: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(code = ?ack.code, "connected to broker");
                    backoff = INITIAL_BACKOFF;
                    self.on_connected().await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => self.route(publish).await,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, retry_in = ?backoff, "broker connection error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        self.go_offline(&mut eventloop).await;
    }

    async fn on_connected(&self) {
        for (pattern, _) in self.subscriptions.read().await.iter() {
            match self.client.try_subscribe(pattern.as_str(), QoS::AtLeastOnce) {
                Ok(()) => debug!(topic = %pattern, "subscribed"),
                Err(err) => warn!(topic = %pattern, error = %err, "resubscribe failed"),
            }
        }
        self.try_publish_status(AgentStatus::Online);
    }

    async fn route(&self, publish: Publish) {
        let subscriptions = self.subscriptions.read().await;
        for (pattern, sink) in subscriptions.iter() {
            if !topic_matches(pattern, &publish.topic) {
                continue;
            }
            let inbound = Inbound {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            };
            if let Err(err) = sink.try_send(inbound) {
                warn!(topic = %publish.topic, error = %err, "dropping inbound message");
            }
        }
    }

    fn try_publish_status(&self, status: AgentStatus) {
        let message = Outbound::Status(StatusMessage::new(self.topics.agent_id(), status));
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode status");
                return;
            }
        };
        if let Err(err) = self
            .client
            .try_publish(self.topics.status(), QoS::AtLeastOnce, true, payload)
        {
            warn!(?status, error = %err, "failed to publish status");
        }
    }

    async fn go_offline(&self, eventloop: &mut EventLoop) {
        info!("announcing offline and disconnecting from broker");
        self.try_publish_status(AgentStatus::Offline);
        if let Err(err) = self.client.try_disconnect() {
            debug!(error = %err, "disconnect request failed");
            return;
        }
        let flushed = tokio::time::timeout(OFFLINE_FLUSH, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("broker did not drain before shutdown");
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, message: Outbound) -> Result<(), AgentError> {
        let payload = message
            .to_json()
            .map_err(|e| AgentError::TransportDisconnected(format!("encode failed: {e}")))?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, message.is_retained(), payload)
            .map_err(|e| AgentError::TransportDisconnected(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str, sink: mpsc::Sender<Inbound>) -> Result<(), AgentError> {
        self.subscriptions
            .write()
            .await
            .push((pattern.to_string(), sink));
        self.client
            .try_subscribe(pattern, QoS::AtLeastOnce)
            .map_err(|e| AgentError::TransportDisconnected(e.to_string()))
    }
}

fn mqtt_options(broker_url: &str, topics: &Topics) -> Result<MqttOptions> {
    let (host, port) = broker_endpoint(broker_url)?;
    let mut options = MqttOptions::new(format!("uranus-{}", topics.agent_id()), host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(false);
    options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);

    let will = serde_json::to_vec(&StatusMessage::new(topics.agent_id(), AgentStatus::Offline))
        .context("failed to encode last will")?;
    options.set_last_will(LastWill::new(topics.status(), will, QoS::AtLeastOnce, true));
    Ok(options)
}

/// Split `mqtt://host:port` into its parts.
pub fn broker_endpoint(url: &str) -> Result<(String, u16)> {
    let rest = match url.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => bail!("unsupported broker scheme `{scheme}`"),
        None => url,
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid broker port in {url}"))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(anyhow!("broker url {url} has no host"));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            broker_endpoint("mqtt://mqtt.qfdk.me:1883").expect("parse"),
            ("mqtt.qfdk.me".to_string(), 1883)
        );
        assert_eq!(
            broker_endpoint("tcp://10.0.0.5").expect("parse"),
            ("10.0.0.5".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            broker_endpoint("broker.local:2883").expect("parse"),
            ("broker.local".to_string(), 2883)
        );
        assert!(broker_endpoint("ws://broker:80").is_err());
        assert!(broker_endpoint("mqtt://:1883").is_err());
        assert!(broker_endpoint("mqtt://host:http").is_err());
    }

    #[test]
    fn options_carry_identity_and_retained_last_will() {
        let topics = Topics::new("uranus", "a1");
        let options = mqtt_options("mqtt://localhost:1883", &topics).expect("options");
        assert_eq!(options.client_id(), "uranus-a1");
        assert_eq!(options.keep_alive(), KEEP_ALIVE);

        let will = options.last_will().expect("last will");
        assert_eq!(will.topic, "uranus/status");
        assert!(will.retain);
        let status: StatusMessage = serde_json::from_slice(&will.message).expect("will payload");
        assert_eq!(status.uuid, "a1");
        assert_eq!(status.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn inbound_publishes_reach_matching_subscribers() {
        let (transport, _eventloop) =
            MqttTransport::new("mqtt://localhost:1883", Topics::new("uranus", "a1")).expect("transport");
        let (tx, mut rx) = mpsc::channel(4);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        transport
            .subscribe("uranus/command/a1", tx)
            .await
            .expect("subscribe");
        transport
            .subscribe("uranus/command/other", other_tx)
            .await
            .expect("subscribe");

        transport
            .route(Publish::new(
                "uranus/command/a1",
                QoS::AtLeastOnce,
                br#"{"command":"status"}"#.to_vec(),
            ))
            .await;

        let inbound = rx.recv().await.expect("inbound");
        assert_eq!(inbound.topic, "uranus/command/a1");
        assert_eq!(inbound.payload, br#"{"command":"status"}"#.to_vec());
        assert!(other_rx.try_recv().is_err());
    }
}
