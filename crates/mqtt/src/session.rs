//! Single broker connection with explicit lifecycle.
//!
//! A `Session` owns one rumqttc event loop. Unlike the reconnecting
//! [`ConnectionKernel`](crate::connection::ConnectionKernel) it never retries:
//! a failed connect, a refused subscription or a dropped connection is
//! returned to the caller, who decides what to do next.
//!
//! ```ignore
//! let mut session = Session::connect(&config).await?;
//! session.subscribe("sensores/medicao").await?;
//! while let Some(message) = session.next_message().await? {
//!     route(&message).await;
//! }
//! ```
//!
//! Inbound messages come out of [`Session::next_message`] in the order the
//! broker delivered them. Publishing from other tasks goes through a cloned
//! [`SessionHandle`]; those requests only reach the wire while the owner keeps
//! draining `next_message`.

use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, trace, warn};

use super::{
    client::ClientBuilder,
    config::{validate_concrete_topic, Config},
    error::TransferError,
    state::ConnectionState,
    topic::TopicNamespace,
};

/// Upper bound on how long `disconnect` keeps the event loop alive to flush
/// the DISCONNECT packet.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(2);

/// One message received from the broker, with the base topic stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

pub struct Session {
    client: AsyncClient,
    event_loop: EventLoop,
    namespace: TopicNamespace,
    qos: QoS,
    timeout: Duration,
    pending: VecDeque<InboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
    closed: bool,
}

impl Session {
    /// Connects using `config` and waits for the broker's CONNACK.
    pub async fn connect(config: &Config) -> Result<Self, TransferError> {
        Self::connect_with(ClientBuilder::from_config(config)?, config).await
    }

    /// Like [`Session::connect`], with a pre-configured builder (last will, etc).
    pub async fn connect_with(
        builder: ClientBuilder,
        config: &Config,
    ) -> Result<Self, TransferError> {
        let (client, mut event_loop) = builder.build();
        event_loop
            .network_options
            .set_connection_timeout(config.connection_timeout);

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let mut session = Self {
            client,
            event_loop,
            namespace: TopicNamespace::new(&config.base_topic),
            qos: config.qos()?,
            timeout: Duration::from_secs(config.connection_timeout),
            pending: VecDeque::new(),
            state_tx,
            closed: false,
        };

        info!("Connecting to MQTT broker {}:{}", config.host, config.port);
        if let Err(e) = session.await_connack().await {
            session.set_state(ConnectionState::Disconnected(e.to_string()));
            return Err(e);
        }
        session.set_state(ConnectionState::Connected);
        info!("Connected to MQTT broker {}:{}", config.host, config.port);
        Ok(session)
    }

    async fn await_connack(&mut self) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let polled = tokio::time::timeout_at(deadline, self.event_loop.poll())
                .await
                .map_err(|_| TransferError::ConnectTimeout(self.timeout.as_secs()))?;

            match polled? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(rumqttc::ConnectionError::ConnectionRefused(code).into()),
                    };
                }
                other => trace!("Event before CONNACK: {:?}", other),
            }
        }
    }

    /// Subscribes to a concrete topic and waits for the SUBACK.
    ///
    /// Messages that arrive while waiting are queued for `next_message`.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), TransferError> {
        self.ensure_open()?;
        let full_topic = self.namespace.apply(topic);
        self.client.subscribe(full_topic.clone(), self.qos).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let polled = tokio::time::timeout_at(deadline, self.event_loop.poll())
                .await
                .map_err(|_| TransferError::ConnectTimeout(self.timeout.as_secs()))?;

            match polled {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack.return_codes.contains(&SubscribeReasonCode::Failure) {
                        warn!("Broker rejected subscription to '{}'", full_topic);
                        return Err(TransferError::SubscribeRejected(topic.to_string()));
                    }
                    info!("Subscribed to topic: {} (full: {})", topic, full_topic);
                    return Ok(());
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = self.inbound(publish);
                    self.pending.push_back(message);
                }
                Ok(other) => trace!("Event while awaiting SUBACK: {:?}", other),
                Err(e) => return Err(self.lost(e)),
            }
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), TransferError> {
        self.ensure_open()?;
        self.handle().publish(topic, payload, retain).await
    }

    /// Waits for the next inbound message.
    ///
    /// Returns `Ok(None)` once the session is closed, either by
    /// [`Session::disconnect`], by a handle's `disconnect`, or by the broker.
    /// A network failure is returned as an error and closes the session.
    pub async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransferError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        if self.closed {
            return Ok(None);
        }

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(self.inbound(publish)));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Disconnected by broker");
                    self.closed = true;
                    self.set_state(ConnectionState::Disconnected(
                        "Disconnected by broker".into(),
                    ));
                    return Ok(None);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("DISCONNECT sent, closing session");
                    self.closed = true;
                    self.set_state(ConnectionState::Closed);
                    return Ok(None);
                }
                Ok(other) => trace!("Session event: {:?}", other),
                Err(e) => return Err(self.lost(e)),
            }
        }
    }

    /// Sends DISCONNECT and flushes it. Idempotent.
    pub async fn disconnect(&mut self) -> Result<(), TransferError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.client.try_disconnect() {
            warn!("Could not queue DISCONNECT: {}", e);
            self.set_state(ConnectionState::Closed);
            return Ok(());
        }

        let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("DISCONNECT not flushed within {:?}", DISCONNECT_FLUSH);
        }

        self.set_state(ConnectionState::Closed);
        info!("MQTT session closed");
        Ok(())
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            qos: self.qos,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        if self.closed {
            Err(TransferError::Closed)
        } else {
            Ok(())
        }
    }

    fn inbound(&self, publish: rumqttc::Publish) -> InboundMessage {
        trace!("Received publish on topic {}", publish.topic);
        InboundMessage {
            topic: self.namespace.strip(&publish.topic).to_string(),
            payload: publish.payload,
            retain: publish.retain,
        }
    }

    fn lost(&mut self, err: rumqttc::ConnectionError) -> TransferError {
        self.closed = true;
        self.set_state(ConnectionState::Disconnected(err.to_string()));
        err.into()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Session state: {}", state);
                *current = state;
                true
            }
        });
    }
}

/// Cloneable publishing side of a [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    client: AsyncClient,
    namespace: TopicNamespace,
    qos: QoS,
}

impl SessionHandle {
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), TransferError> {
        validate_concrete_topic(topic).map_err(|_| TransferError::InvalidTopic(topic.to_string()))?;
        let full_topic = self.namespace.apply(topic);
        let payload = payload.into();
        debug!("Publishing {} bytes to '{}'", payload.len(), full_topic);
        self.client
            .publish(full_topic, self.qos, retain, payload)
            .await?;
        Ok(())
    }

    /// Asks the owning session to close; its `next_message` then returns `None`.
    pub async fn disconnect(&self) -> Result<(), TransferError> {
        self.client.disconnect().await?;
        Ok(())
    }
}
