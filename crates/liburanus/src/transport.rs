use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::warn;

use uranus_protocol::{
    ControlMessage, HeartbeatMessage, OutputMessage, ResponseMessage, StatusMessage,
    topic_matches,
};

use crate::error::AgentError;

/// Everything the agent ever sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Response(ResponseMessage),
    Output(OutputMessage),
    Control(ControlMessage),
    Status(StatusMessage),
    Heartbeat(HeartbeatMessage),
}

impl Outbound {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Outbound::Response(m) => serde_json::to_vec(m),
            Outbound::Output(m) => serde_json::to_vec(m),
            Outbound::Control(m) => serde_json::to_vec(m),
            Outbound::Status(m) => serde_json::to_vec(m),
            Outbound::Heartbeat(m) => serde_json::to_vec(m),
        }
    }

    /// Presence messages are kept by the broker as last known state.
    pub fn is_retained(&self) -> bool {
        matches!(self, Outbound::Status(_))
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Capability the dispatcher and forwarders publish through.
///
/// Implementations must survive their peer going away: a failed publish is
/// reported to the caller, never turned into a panic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, message: Outbound) -> Result<(), AgentError>;

    /// Route messages whose topic matches `pattern` into `sink`.
    async fn subscribe(&self, pattern: &str, sink: mpsc::Sender<Inbound>) -> Result<(), AgentError>;
}

/// A published message as seen on the receiving end of a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub message: Outbound,
}

/// In-process transport backed by channels.
///
/// Publications are queued for whoever owns the receiver returned by
/// [`ChannelTransport::new`]; inbound traffic is injected with
/// [`ChannelTransport::deliver`].
pub struct ChannelTransport {
    outbound: mpsc::Sender<Publication>,
    subscriptions: RwLock<Vec<(String, mpsc::Sender<Inbound>)>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Publication>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound,
                subscriptions: RwLock::new(Vec::new()),
            },
            rx,
        )
    }

    /// Hand an inbound message to every matching subscriber. Returns how
    /// many accepted it.
    pub async fn deliver(&self, topic: &str, payload: Vec<u8>) -> usize {
        let subscriptions = self.subscriptions.read().await;
        let mut delivered = 0;
        for (pattern, sink) in subscriptions.iter() {
            if !topic_matches(pattern, topic) {
                continue;
            }
            let inbound = Inbound {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sink.send(inbound).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, topic: &str, message: Outbound) -> Result<(), AgentError> {
        let publication = Publication {
            topic: topic.to_string(),
            message,
        };
        match self.outbound.try_send(publication) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(topic, "outbound queue full");
                Err(AgentError::TransportDisconnected(
                    "outbound queue full".to_string(),
                ))
            }
            Err(TrySendError::Closed(_)) => Err(AgentError::TransportDisconnected(
                "connection closed".to_string(),
            )),
        }
    }

    async fn subscribe(&self, pattern: &str, sink: mpsc::Sender<Inbound>) -> Result<(), AgentError> {
        self.subscriptions
            .write()
            .await
            .push((pattern.to_string(), sink));
        Ok(())
    }
}
