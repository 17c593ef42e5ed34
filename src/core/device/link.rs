//! Receive side of a device.
//!
//! A background task drains the device's inbound session and records process
//! commands and bind responses into [`DeviceSignals`].

use std::sync::Arc;

use greenbee_mqtt::InboundMessage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{signals::DeviceSignals, DeviceError};
use crate::{
    config::topics::TopicsConfig,
    core::{
        protocol::{decode, BindResponse, ProcessCommand},
        transport::InboundSession,
    },
};

pub struct DeviceLink {
    cancel: CancellationToken,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

impl DeviceLink {
    /// Subscribes `session` to the process and bind response topics and
    /// starts the receive task.
    pub async fn attach(
        mut session: Box<dyn InboundSession>,
        topics: &TopicsConfig,
        signals: Arc<DeviceSignals>,
    ) -> Result<Self, DeviceError> {
        for topic in topics.device_inbound() {
            session.subscribe(topic).await?;
        }

        let cancel = CancellationToken::new();
        let receiver = Receiver {
            process_topic: topics.process.clone(),
            response_topic: topics.bind_response.clone(),
            signals,
        };
        let closed = CancellationToken::new();
        let done = closed.clone().drop_guard();
        let run = receiver.run(session, cancel.clone());
        let task = tokio::spawn(async move {
            let _done = done;
            run.await
        });
        Ok(Self {
            cancel,
            closed,
            task,
        })
    }

    /// True once the receive task has ended, e.g. after a lost connection.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the receive task ends. No further commands or bind
    /// responses are recorded after that.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stops the receive task and disconnects its session.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Device receive task failed: {}", e);
        }
    }
}

struct Receiver {
    process_topic: String,
    response_topic: String,
    signals: Arc<DeviceSignals>,
}

impl Receiver {
    async fn run(self, mut session: Box<dyn InboundSession>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = session.next_message() => Some(next),
            };
            match next {
                None => {
                    if let Err(e) = session.disconnect().await {
                        warn!("Error while disconnecting device session: {}", e);
                    }
                    return;
                }
                Some(Ok(Some(message))) => self.absorb(&message),
                Some(Ok(None)) => {
                    info!("Device session closed");
                    return;
                }
                Some(Err(e)) => {
                    error!("Device lost its connection: {}", e);
                    return;
                }
            }
        }
    }

    fn absorb(&self, message: &InboundMessage) {
        if message.topic == self.process_topic {
            match ProcessCommand::from_payload(&message.payload) {
                Ok(command) => {
                    info!("Received process command '{}'", command);
                    self.signals.record_command(command);
                }
                Err(e) => warn!("Ignoring process message: {}", e),
            }
        } else if message.topic == self.response_topic {
            match decode::<BindResponse>(&message.payload) {
                Ok(response) => {
                    self.signals.offer_bind_response(response);
                }
                Err(e) => warn!("Ignoring malformed bind response: {}", e),
            }
        } else {
            debug!("Device ignoring message on '{}'", message.topic);
        }
    }
}
