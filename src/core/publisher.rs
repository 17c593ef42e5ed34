//! Outbound publishing seam.
//!
//! Handlers and the device machine publish through [`Publisher`] so they run
//! unchanged against the reconnecting MQTT publisher, a session handle, or
//! the in-process loopback bus.

use serde::Serialize;
use tracing::info;

use super::protocol::ProcessCommand;
use crate::config::topics::TopicsConfig;

pub type PublishError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), PublishError>;
}

/// Serialises `value` as JSON and publishes it without retain.
pub async fn publish_json<T: Serialize + ?Sized>(
    publisher: &dyn Publisher,
    topic: &str,
    value: &T,
) -> Result<(), PublishError> {
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, payload, false).await
}

/// Publishes `iniciar` or `finalizar` on the process topic.
///
/// A retained command also reaches devices that connect later.
pub async fn send_process_command(
    publisher: &dyn Publisher,
    topics: &TopicsConfig,
    command: ProcessCommand,
    retained: bool,
) -> Result<(), PublishError> {
    publisher
        .publish(&topics.process, command.as_str().as_bytes().to_vec(), retained)
        .await?;
    info!(
        "Sent process command '{}' on {} (retain={})",
        command, topics.process, retained
    );
    Ok(())
}

#[async_trait::async_trait]
impl Publisher for greenbee_mqtt::Publisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError> {
        greenbee_mqtt::Publisher::publish(self, topic, payload, retain)
            .await
            .map_err(|e| Box::new(e) as _)
    }
}

#[async_trait::async_trait]
impl Publisher for greenbee_mqtt::SessionHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError> {
        greenbee_mqtt::SessionHandle::publish(self, topic, payload, retain)
            .await
            .map_err(|e| Box::new(e) as _)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every publish; optionally fails them all.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) sent: Mutex<Vec<(String, Vec<u8>, bool)>>,
        pub(crate) failing: bool,
    }

    impl RecordingPublisher {
        pub(crate) fn failing() -> Self {
            Self {
                failing: true,
                ..Default::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<(String, Vec<u8>, bool)> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn json_on(&self, topic: &str) -> Vec<serde_json::Value> {
            self.sent()
                .into_iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, payload, _)| serde_json::from_slice(&payload).unwrap())
                .collect()
        }

        pub(crate) fn text_on(&self, topic: &str) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, payload, _)| String::from_utf8(payload).unwrap())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
        ) -> Result<(), PublishError> {
            if self.failing {
                return Err("broker unreachable".into());
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, retain));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::{testing::RecordingPublisher, *};

    #[tokio::test]
    #[traced_test]
    async fn test_send_process_command() {
        let publisher = RecordingPublisher::default();
        let topics = TopicsConfig::default();

        send_process_command(&publisher, &topics, ProcessCommand::Start, true)
            .await
            .unwrap();
        send_process_command(&publisher, &topics, ProcessCommand::Finish, false)
            .await
            .unwrap();

        let sent = publisher.sent();
        assert_eq!(sent[0], ("sensores/processo".into(), b"iniciar".to_vec(), true));
        assert_eq!(sent[1], ("sensores/processo".into(), b"finalizar".to_vec(), false));
        assert!(logs_contain("Sent process command 'iniciar'"));
    }

    #[tokio::test]
    async fn test_publish_json() {
        let publisher = RecordingPublisher::default();
        publish_json(&publisher, "sensores/bind/unbind", &serde_json::json!({"id": "5"}))
            .await
            .unwrap();
        assert_eq!(
            publisher.json_on("sensores/bind/unbind"),
            vec![serde_json::json!({"id": "5"})]
        );
    }

    #[tokio::test]
    async fn test_failure_is_returned() {
        let publisher = RecordingPublisher::failing();
        let topics = TopicsConfig::default();
        assert!(send_process_command(&publisher, &topics, ProcessCommand::Start, false)
            .await
            .is_err());
    }
}
