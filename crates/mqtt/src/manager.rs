//! Assembly of the reconnecting outbound connection.
//!
//! [`MqttManager::build_and_start`] builds the client, spawns the
//! [`ConnectionKernel`] and hands back an [`MqttInstance`]. Shutdown is
//! ordered: in-flight publishes drain first, then the kernel is cancelled.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rumqttc::{AsyncClient, QoS};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    backoff::Backoff, client::ClientBuilder, config::Config, connection::ConnectionKernel,
    error::TransferError, state::ConnectionState, topic::TopicNamespace,
};

/// Counts publishes in progress so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

pub struct MqttManager {
    config: Config,
}

impl MqttManager {
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(Config {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the client and spawns the connection kernel.
    ///
    /// Returns as soon as the kernel task is running; the connection itself
    /// comes up asynchronously (watch [`MqttInstance::state`]).
    pub fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            "Building MQTT publisher connection to {}:{} (client id: {})",
            self.config.host, self.config.port, self.config.client_id
        );

        let qos = self.config.qos()?;
        let (client, event_loop) = ClientBuilder::from_config(&self.config)?.build();

        let connection_cancel = CancellationToken::new();
        let mut kernel = ConnectionKernel::new(
            client.clone(),
            event_loop,
            Backoff::from_config(&self.config),
            connection_cancel.clone(),
        );
        let state_rx = kernel.subscribe_state();

        let kernel_done = CancellationToken::new();
        {
            let done = kernel_done.clone().drop_guard();
            tokio::spawn(async move {
                let _done = done;
                if let Err(e) = kernel.run().await {
                    error!("MQTT connection kernel exited with error: {}", e);
                }
            });
        }

        let shutdown = CancellationToken::new();
        let drain = Arc::new(PublishDrain::new());
        {
            let shutdown = shutdown.clone();
            let drain = drain.clone();
            let connection_cancel = connection_cancel.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                drain.wait_idle().await;
                connection_cancel.cancel();
            });
        }

        Ok(MqttInstance {
            client,
            namespace: TopicNamespace::new(&self.config.base_topic),
            qos,
            state_rx,
            shutdown,
            drain,
            connection_cancel,
            kernel_done,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MqttInstance {
    client: AsyncClient,
    namespace: TopicNamespace,
    qos: QoS,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    drain: Arc<PublishDrain>,
    connection_cancel: CancellationToken,
    kernel_done: CancellationToken,
}

impl MqttInstance {
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn namespace(&self) -> &TopicNamespace {
        &self.namespace
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn publish_drain(&self) -> Arc<PublishDrain> {
        self.drain.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// True once the connection kernel has exited and nothing will be
    /// published any more.
    pub fn is_closed(&self) -> bool {
        self.kernel_done.is_cancelled()
    }

    /// Resolves when the connection kernel exits: after [`shutdown`], on a
    /// fatal connection error or when the reconnect attempts run out.
    ///
    /// [`shutdown`]: MqttInstance::shutdown
    pub async fn closed(&self) {
        self.kernel_done.cancelled().await
    }

    /// Waits for pending publishes, then stops the connection kernel.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain.wait_idle().await;
        self.connection_cancel.cancel();
        debug!("MQTT publisher connection shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_drain_waits_for_guards() {
        let drain = Arc::new(PublishDrain::new());
        let guard = drain.enter();
        assert_eq!(drain.inflight(), 1);

        let waiter = {
            let drain = drain.clone();
            tokio::spawn(async move { drain.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should become idle")
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_idle_without_guards() {
        let drain = PublishDrain::new();
        tokio::time::timeout(Duration::from_millis(100), drain.wait_idle())
            .await
            .expect("idle drain returns immediately");
    }

    #[tokio::test]
    async fn test_build_and_start_and_shutdown() {
        let manager = MqttManager::from_config(Config {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "manager-test".into(),
            ..Default::default()
        });
        let instance = manager.build_and_start().unwrap();
        assert_eq!(instance.qos(), QoS::AtMostOnce);
        assert!(!instance.is_shutting_down());

        instance.shutdown().await;
        assert!(instance.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(2), instance.closed())
            .await
            .expect("kernel should exit after shutdown");
        assert!(instance.is_closed());
    }

    #[tokio::test]
    async fn test_closed_when_reconnects_run_out() {
        let manager = MqttManager::from_config(Config {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "manager-giveup".into(),
            reconnect_delay: 1,
            max_reconnect_delay: 1,
            max_reconnect_attempts: 1,
            ..Default::default()
        });
        let instance = manager.build_and_start().unwrap();

        tokio::time::timeout(Duration::from_secs(10), instance.closed())
            .await
            .expect("kernel should give up");
        assert!(instance.is_closed());
        assert!(!instance.is_shutting_down());
        assert!(!instance.state().borrow().is_connected());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let manager = MqttManager::from_config(Config {
            keep_alive: 1,
            ..Default::default()
        });
        assert!(manager.build_and_start().is_err());
    }
}
