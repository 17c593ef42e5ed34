//! Consumer lifecycle: `Stopped -> Running -> Stopped`.
//!
//! [`Consumer::start`] spawns exactly one worker task. The worker connects
//! through the [`Connector`] (retrying with its backoff until `stop()` or the
//! attempt cap), subscribes to the three inbound topics and then feeds every
//! message through the [`Dispatcher`], awaiting each handler before reading
//! the next message.
//!
//! A lost connection ends the worker; there is no automatic reconnect. A
//! panicking handler only costs the message that triggered it.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::FutureExt;
use greenbee_mqtt::{BackoffError, InboundMessage, TransferError};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    bind::BindHandler, measurement::MeasurementHandler, router::Dispatcher, router::Router,
    unbind::UnbindHandler,
};
use crate::{
    config::{consumer::ConsumerConfig, topics::TopicsConfig},
    core::{
        identity::{ClockIdentity, IdentityAllocator},
        publisher::Publisher,
        registry::Registry,
        transport::{Connector, InboundSession},
    },
};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransferError),

    #[error("Giving up on the broker: {0}")]
    RetriesExhausted(#[from] BackoffError),

    #[error("Consumer must be started from within a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Running,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Consumer {
    dispatcher: Arc<Dispatcher>,
    connector: Arc<dyn Connector>,
    inbound_topics: Vec<String>,
    stop_timeout: Duration,
    worker: Mutex<Option<Worker>>,
    state_tx: Arc<watch::Sender<ConsumerState>>,
}

impl Consumer {
    pub fn new(
        registry: Arc<dyn Registry>,
        publisher: Arc<dyn Publisher>,
        connector: Arc<dyn Connector>,
        topics: &TopicsConfig,
        config: &ConsumerConfig,
    ) -> Self {
        Self::with_identity(
            registry,
            publisher,
            connector,
            Arc::new(ClockIdentity),
            topics,
            config,
        )
    }

    pub fn with_identity(
        registry: Arc<dyn Registry>,
        publisher: Arc<dyn Publisher>,
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityAllocator>,
        topics: &TopicsConfig,
        config: &ConsumerConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            Router::new(topics),
            BindHandler::new(
                registry.clone(),
                publisher,
                identity,
                &topics.bind_response,
                config.identity_attempts,
            ),
            MeasurementHandler::new(registry, config.placeholder_soc),
            UnbindHandler,
        );
        let (state_tx, _) = watch::channel(ConsumerState::Stopped);
        Self {
            dispatcher: Arc::new(dispatcher),
            connector,
            inbound_topics: topics.inbound().iter().map(|t| t.to_string()).collect(),
            stop_timeout: config.stop_timeout(),
            worker: Mutex::new(None),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker. A no-op while a worker is still alive.
    pub fn start(&self) -> Result<(), ConsumerError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConsumerError::NoRuntime)?;

        let mut slot = self.worker_slot();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            warn!("Consumer already running, start ignored");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let task = WorkerTask {
            dispatcher: self.dispatcher.clone(),
            connector: self.connector.clone(),
            topics: self.inbound_topics.clone(),
            cancel: cancel.clone(),
        };
        let state_tx = self.state_tx.clone();
        state_tx.send_replace(ConsumerState::Running);

        let handle = runtime.spawn(async move {
            match task.run().await {
                Ok(()) => info!("Consumer worker finished"),
                Err(e) => error!("Consumer worker ended: {}", e),
            }
            state_tx.send_replace(ConsumerState::Stopped);
        });
        *slot = Some(Worker { cancel, handle });
        info!("Consumer started");
        Ok(())
    }

    /// Cancels the worker and waits up to `stop_timeout` for it.
    pub async fn stop(&self) {
        let Some(worker) = self.worker_slot().take() else {
            debug!("Consumer not running, stop ignored");
            return;
        };

        worker.cancel.cancel();
        let abort = worker.handle.abort_handle();
        match tokio::time::timeout(self.stop_timeout, worker.handle).await {
            Ok(Ok(())) => info!("Consumer stopped"),
            Ok(Err(e)) => error!("Consumer worker failed: {}", e),
            Err(_) => {
                warn!(
                    "Consumer worker did not stop within {:?}, abandoning it",
                    self.stop_timeout
                );
                abort.abort();
            }
        }
        self.state_tx.send_replace(ConsumerState::Stopped);
    }
}

struct WorkerTask {
    dispatcher: Arc<Dispatcher>,
    connector: Arc<dyn Connector>,
    topics: Vec<String>,
    cancel: CancellationToken,
}

impl WorkerTask {
    async fn run(self) -> Result<(), ConsumerError> {
        let Some(mut session) = self.connect().await? else {
            return Ok(());
        };

        for topic in &self.topics {
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = session.subscribe(topic) => Some(result),
            };
            match subscribed {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    close(session.as_mut()).await;
                    return Err(e.into());
                }
                None => {
                    close(session.as_mut()).await;
                    return Ok(());
                }
            }
        }
        info!("Consumer listening on {}", self.topics.join(", "));

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                next = session.next_message() => Some(next),
            };
            match next {
                None => {
                    debug!("Stop requested, closing inbound session");
                    close(session.as_mut()).await;
                    return Ok(());
                }
                Some(Ok(Some(message))) => self.dispatch(message).await,
                Some(Ok(None)) => {
                    info!("Inbound session closed");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Connects, retrying with the connector's backoff. `None` if cancelled.
    async fn connect(&self) -> Result<Option<Box<dyn InboundSession>>, ConsumerError> {
        let mut backoff = self.connector.backoff();
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                attempt = self.connector.connect() => attempt,
            };
            match attempt {
                Ok(session) => return Ok(Some(session)),
                Err(e) => {
                    let delay = backoff.next_sleep().inspect_err(|_| {
                        error!("Could not connect to the broker: {}", e);
                    })?;
                    warn!(
                        "Broker connection failed, retrying in {:.2}s: {}",
                        delay.as_secs_f64(),
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        let outcome = AssertUnwindSafe(self.dispatcher.dispatch(&message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(outcome) => debug!("Handled message on '{}': {:?}", message.topic, outcome),
            Err(panic) => error!(
                "Handler panicked on topic '{}': {}",
                message.topic,
                panic_message(panic.as_ref())
            ),
        }
    }
}

async fn close(session: &mut dyn InboundSession) {
    if let Err(e) = session.disconnect().await {
        warn!("Error while disconnecting inbound session: {}", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
