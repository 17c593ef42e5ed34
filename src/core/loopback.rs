//! In-process message bus.
//!
//! Implements both [`Publisher`] and [`Connector`] with exact-topic routing
//! and retained messages, so the consumer and the device machine can talk to
//! each other without a broker. Used by the integration tests and for local
//! experiments.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use greenbee_mqtt::{config::validate_concrete_topic, Backoff, InboundMessage, TransferError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    publisher::{PublishError, Publisher},
    transport::{Connector, InboundSession},
};

enum Delivery {
    Message(InboundMessage),
    Lost(String),
}

struct Subscriber {
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<u64, Subscriber>,
    retained: HashMap<String, Bytes>,
    log: Vec<InboundMessage>,
    next_id: u64,
    refuse_connects: u32,
}

#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector whose failed attempts retry after `backoff`.
    pub fn connector(&self, backoff: Backoff) -> LoopbackConnector {
        LoopbackConnector {
            bus: self.clone(),
            backoff,
        }
    }

    /// Opens a session directly, bypassing refusal injection.
    pub fn session(&self) -> LoopbackSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.insert(
            id,
            Subscriber {
                topics: HashSet::new(),
                tx,
            },
        );
        LoopbackSession {
            id,
            bus: self.clone(),
            rx,
            closed: false,
        }
    }

    /// Makes the next `count` connector attempts fail.
    pub fn refuse_connects(&self, count: u32) {
        self.state().refuse_connects = count;
    }

    /// Drops every open session with a connection error.
    pub fn sever_all(&self) {
        let mut state = self.state();
        for (_, subscriber) in state.subscribers.drain() {
            let _ = subscriber
                .tx
                .send(Delivery::Lost("loopback connection severed".into()));
        }
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.state().log.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.state()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.state().subscribers.len()
    }

    fn deliver(&self, topic: &str, payload: Bytes, retain: bool) {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        };
        let mut state = self.state();
        state.log.push(message.clone());
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload);
            }
        }

        let live = InboundMessage {
            retain: false,
            ..message
        };
        state.subscribers.retain(|_, subscriber| {
            if !subscriber.topics.contains(topic) {
                return true;
            }
            subscriber.tx.send(Delivery::Message(live.clone())).is_ok()
        });
        trace!("Loopback delivered message on '{}'", topic);
    }

    fn add_subscription(&self, id: u64, topic: &str) -> Result<(), TransferError> {
        let mut state = self.state();
        let retained = state.retained.get(topic).cloned();
        let subscriber = state.subscribers.get_mut(&id).ok_or(TransferError::Closed)?;
        subscriber.topics.insert(topic.to_string());
        if let Some(payload) = retained {
            let _ = subscriber.tx.send(Delivery::Message(InboundMessage {
                topic: topic.to_string(),
                payload,
                retain: true,
            }));
        }
        Ok(())
    }

    fn remove_session(&self, id: u64) {
        self.state().subscribers.remove(&id);
    }
}

#[async_trait]
impl Publisher for LoopbackBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError> {
        validate_concrete_topic(topic)
            .map_err(|_| TransferError::InvalidTopic(topic.to_string()))?;
        self.deliver(topic, Bytes::from(payload), retain);
        Ok(())
    }
}

pub struct LoopbackSession {
    id: u64,
    bus: LoopbackBus,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

#[async_trait]
impl InboundSession for LoopbackSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        validate_concrete_topic(topic)
            .map_err(|_| TransferError::InvalidTopic(topic.to_string()))?;
        self.bus.add_subscription(self.id, topic)?;
        debug!("Loopback session {} subscribed to {}", self.id, topic);
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransferError> {
        if self.closed {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Delivery::Message(message)) => Ok(Some(message)),
            Some(Delivery::Lost(reason)) => {
                self.closed = true;
                Err(TransferError::ConnectionKernel(reason))
            }
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        if !self.closed {
            self.closed = true;
            self.bus.remove_session(self.id);
            debug!("Loopback session {} disconnected", self.id);
        }
        Ok(())
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.bus.remove_session(self.id);
    }
}

pub struct LoopbackConnector {
    bus: LoopbackBus,
    backoff: Backoff,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn InboundSession>, TransferError> {
        {
            let mut state = self.bus.state();
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(TransferError::ConnectionKernel(
                    "loopback connection refused".into(),
                ));
            }
        }
        Ok(Box::new(self.bus.session()))
    }

    fn backoff(&self) -> Backoff {
        self.backoff.clone()
    }
}

/// Backoff suited to tests: 10 ms steps, at most `attempts` retries.
pub fn quick_backoff(attempts: u32) -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(50), 2.0)
        .with_max_attempts(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(session: &mut LoopbackSession) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(1), session.next_message())
            .await
            .expect("message expected")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exact_topic_routing() {
        let bus = LoopbackBus::new();
        let mut session = bus.session();
        session.subscribe("sensores/medicao").await.unwrap();

        bus.publish("sensores/status", b"sleeping".to_vec(), false).await.unwrap();
        bus.publish("sensores/medicao", b"{}".to_vec(), false).await.unwrap();

        let message = next(&mut session).await;
        assert_eq!(message.topic, "sensores/medicao");
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_retained_message_replayed_on_subscribe() {
        let bus = LoopbackBus::new();
        bus.publish("sensores/processo", b"iniciar".to_vec(), true).await.unwrap();

        let mut session = bus.session();
        session.subscribe("sensores/processo").await.unwrap();
        let message = next(&mut session).await;
        assert!(message.retain);
        assert_eq!(&message.payload[..], b"iniciar");
    }

    #[tokio::test]
    async fn test_sever_reports_error_then_none() {
        let bus = LoopbackBus::new();
        let mut session = bus.session();
        session.subscribe("a/b").await.unwrap();
        bus.sever_all();

        assert!(session.next_message().await.is_err());
        assert!(session.next_message().await.unwrap().is_none());
        assert_eq!(bus.session_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let bus = LoopbackBus::new();
        let connector = bus.connector(quick_backoff(1));
        bus.refuse_connects(1);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.backoff().max_attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let bus = LoopbackBus::new();
        let mut session = bus.session();
        assert_eq!(bus.session_count(), 1);
        session.disconnect().await.unwrap();
        assert_eq!(bus.session_count(), 0);
        assert!(session.next_message().await.unwrap().is_none());
        assert!(matches!(
            session.subscribe("a/b").await,
            Err(TransferError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_wildcard_publish_rejected() {
        let bus = LoopbackBus::new();
        assert!(bus.publish("sensores/#", Vec::new(), false).await.is_err());
    }
}
