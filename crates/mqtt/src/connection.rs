//! Self-healing connection used by the outbound publisher.
//!
//! ```text
//! Publisher (AsyncClient clones, any task)
//!     ↓
//! ConnectionKernel (polls the event loop, reconnects with backoff)
//!     ↓
//! rumqttc EventLoop
//! ```
//!
//! The kernel drives the event loop on its own task so publishes issued from
//! anywhere reach the broker. Transient failures put it into
//! `Reconnecting(delay)` and the next poll reconnects; fatal failures and an
//! exhausted backoff end the task with an error.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{backoff::Backoff, error::TransferError, state::ConnectionState};

pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    is_connected: Arc<AtomicBool>,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            is_connected: Arc::new(AtomicBool::new(false)),
            backoff,
            cancel,
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Shared flag mirroring `ConnectionState::Connected`.
    pub fn is_connected(&self) -> Arc<AtomicBool> {
        self.is_connected.clone()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    /// Runs until cancelled, a fatal error, or backoff exhaustion.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();
        info!("Starting connection event loop...");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, closing connection");
                    self.is_connected.store(false, Ordering::Release);
                    if let Err(e) = self.client.try_disconnect() {
                        warn!("Error sending disconnect packet: {}", e);
                    }
                    // Best effort: give the event loop one chance to flush DISCONNECT.
                    let _ = tokio::time::timeout(Duration::from_millis(500), self.event_loop.poll()).await;
                    self.update_state(ConnectionState::Closed);
                    return Ok(());
                }

                polled = self.event_loop.poll() => match polled {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        self.is_connected.store(false, Ordering::Release);

                        if is_fatal_error(&e) {
                            error!("Fatal connection error: {}", root_cause(&e));
                            self.update_state(ConnectionState::Disconnected(e.to_string()));
                            return Err(e.into());
                        }

                        match self.backoff.next_sleep() {
                            Ok(delay) => {
                                warn!(
                                    "Reconnecting in {:.2} seconds due to error: {}",
                                    delay.as_secs_f64(),
                                    root_cause(&e)
                                );
                                self.update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));
                                tokio::select! {
                                    _ = self.cancel.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                            Err(exhausted) => {
                                error!("Maximum retry attempts exceeded: {}", exhausted);
                                self.update_state(ConnectionState::Disconnected(exhausted.to_string()));
                                return Err(exhausted.into());
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                self.is_connected.store(true, Ordering::Release);
                self.backoff.reset();
                self.update_state(ConnectionState::Connected);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.is_connected.store(false, Ordering::Release);
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(Packet::Publish(publish)) => {
                debug!("Ignoring publish on '{}' (publisher connection)", publish.topic);
            }
            other => trace!("Kernel event: {:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,
        ConnectionError::Tls(_) => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

pub(crate) fn is_fatal_error(err: &ConnectionError) -> bool {
    classify_connection_error(err) == Disposition::Fatal
}

/// Innermost message of an error chain, without surrounding quotes.
pub(crate) fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
