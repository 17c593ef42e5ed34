//! Exact-topic demultiplexing of inbound messages.

use std::collections::HashMap;

use greenbee_mqtt::InboundMessage;
use tracing::warn;

use super::{
    bind::{BindHandler, BindOutcome},
    measurement::{MeasurementHandler, MeasurementOutcome},
    unbind::{UnbindHandler, UnbindOutcome},
};
use crate::config::topics::TopicsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Measurement,
    BindRequest,
    Unbind,
}

/// Topic table built from the `[topics]` configuration.
#[derive(Debug, Clone)]
pub struct Router {
    table: HashMap<String, Route>,
}

impl Router {
    pub fn new(topics: &TopicsConfig) -> Self {
        let table = HashMap::from([
            (topics.measurement.clone(), Route::Measurement),
            (topics.bind_request.clone(), Route::BindRequest),
            (topics.unbind.clone(), Route::Unbind),
        ]);
        Self { table }
    }

    /// Case-sensitive exact match; no wildcards.
    pub fn route(&self, topic: &str) -> Option<Route> {
        self.table.get(topic).copied()
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Bind(BindOutcome),
    Measurement(MeasurementOutcome),
    Unbind(UnbindOutcome),
    Unrouted,
}

pub struct Dispatcher {
    router: Router,
    bind: BindHandler,
    measurement: MeasurementHandler,
    unbind: UnbindHandler,
}

impl Dispatcher {
    pub fn new(
        router: Router,
        bind: BindHandler,
        measurement: MeasurementHandler,
        unbind: UnbindHandler,
    ) -> Self {
        Self {
            router,
            bind,
            measurement,
            unbind,
        }
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Dispatch {
        match self.router.route(&message.topic) {
            Some(Route::BindRequest) => Dispatch::Bind(self.bind.handle(&message.payload).await),
            Some(Route::Measurement) => {
                Dispatch::Measurement(self.measurement.handle(&message.payload).await)
            }
            Some(Route::Unbind) => Dispatch::Unbind(self.unbind.handle(&message.payload)),
            None => {
                warn!("No handler for topic '{}', message dropped", message.topic);
                Dispatch::Unrouted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::core::{
        identity::ClockIdentity, publisher::testing::RecordingPublisher,
        registry::InMemoryRegistry,
    };

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(InMemoryRegistry::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let topics = TopicsConfig::default();
        Dispatcher::new(
            Router::new(&topics),
            BindHandler::new(
                registry.clone(),
                publisher,
                Arc::new(ClockIdentity),
                &topics.bind_response,
                3,
            ),
            MeasurementHandler::new(registry, 100.0),
            UnbindHandler,
        )
    }

    #[test]
    fn test_route_table() {
        let router = Router::new(&TopicsConfig::default());
        assert_eq!(router.route("sensores/medicao"), Some(Route::Measurement));
        assert_eq!(router.route("sensores/bind/request"), Some(Route::BindRequest));
        assert_eq!(router.route("sensores/bind/unbind"), Some(Route::Unbind));
        assert_eq!(router.route("sensores/bind/response"), None);
        assert_eq!(router.route("SENSORES/MEDICAO"), None);
        assert_eq!(router.route("sensores/medicao/"), None);
    }

    #[test]
    fn test_route_table_follows_config() {
        let topics = TopicsConfig {
            measurement: "estufa/leituras".into(),
            ..Default::default()
        };
        let router = Router::new(&topics);
        assert_eq!(router.route("estufa/leituras"), Some(Route::Measurement));
        assert_eq!(router.route("sensores/medicao"), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unmatched_topic_is_dropped() {
        let outcome = dispatcher()
            .dispatch(&InboundMessage::new("sensores/desconhecido", "{}"))
            .await;
        assert_eq!(outcome, Dispatch::Unrouted);
        assert!(logs_contain("No handler for topic 'sensores/desconhecido'"));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_handlers() {
        let dispatcher = dispatcher();
        let unbind = dispatcher
            .dispatch(&InboundMessage::new("sensores/bind/unbind", r#"{"id":"4"}"#))
            .await;
        assert!(matches!(unbind, Dispatch::Unbind(UnbindOutcome::Acknowledged(_))));

        let measurement = dispatcher
            .dispatch(&InboundMessage::new("sensores/medicao", "garbage"))
            .await;
        assert_eq!(measurement, Dispatch::Measurement(MeasurementOutcome::Malformed));

        let bind = dispatcher
            .dispatch(&InboundMessage::new(
                "sensores/bind/request",
                r#"{"req_id":"r","nome":"n"}"#,
            ))
            .await;
        assert!(matches!(bind, Dispatch::Bind(BindOutcome::Failed(_))));
    }
}
