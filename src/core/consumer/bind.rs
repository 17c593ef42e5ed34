//! Bind protocol: assigns an identity to a sensor joining the active process.
//!
//! 1. Decode `{"req_id", "nome"}`; malformed requests are dropped silently.
//! 2. Look up the active process; without one the device gets `status: "fail"`.
//! 3. Draw a candidate id and check it is not bound yet (bounded retries).
//! 4. Register the binding and answer `status: "ok"` with the id.
//!
//! The response echoes `req_id` verbatim. Nothing is kept between requests.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core::{
    identity::IdentityAllocator,
    model::{Process, SensorBinding, SensorId},
    protocol::{decode, BindRequest, BindResponse},
    publisher::{publish_json, Publisher},
    registry::{Registry, RegistryError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFailure {
    NoActiveProcess,
    /// Every candidate id was already bound.
    IdentityExhausted,
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// Dropped without a response.
    Malformed,
    Failed(BindFailure),
    Bound(SensorBinding),
}

pub struct BindHandler {
    registry: Arc<dyn Registry>,
    publisher: Arc<dyn Publisher>,
    identity: Arc<dyn IdentityAllocator>,
    response_topic: String,
    identity_attempts: u8,
}

impl BindHandler {
    /// `identity_attempts` of zero skips the uniqueness check.
    pub fn new(
        registry: Arc<dyn Registry>,
        publisher: Arc<dyn Publisher>,
        identity: Arc<dyn IdentityAllocator>,
        response_topic: &str,
        identity_attempts: u8,
    ) -> Self {
        Self {
            registry,
            publisher,
            identity,
            response_topic: response_topic.to_string(),
            identity_attempts,
        }
    }

    pub async fn handle(&self, payload: &[u8]) -> BindOutcome {
        let request: BindRequest = match decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Discarding malformed bind request: {}", e);
                return BindOutcome::Malformed;
            }
        };
        info!(
            "Bind request req_id={} from '{}'",
            request.req_id, request.name
        );

        match self.bind(&request).await {
            Ok(binding) => {
                self.respond(BindResponse::ok(&request.req_id, binding.sensor_id))
                    .await;
                info!(
                    "Sensor '{}' bound as {} in process {}",
                    request.name, binding.sensor_id, binding.process_id
                );
                BindOutcome::Bound(binding)
            }
            Err(failure) => {
                self.respond(BindResponse::fail(&request.req_id)).await;
                BindOutcome::Failed(failure)
            }
        }
    }

    async fn bind(&self, request: &BindRequest) -> Result<SensorBinding, BindFailure> {
        let process = match self.registry.find_active_process().await {
            Ok(Some(process)) => process,
            Ok(None) => {
                warn!("No active process, rejecting bind req_id={}", request.req_id);
                return Err(BindFailure::NoActiveProcess);
            }
            Err(e) => {
                error!("Active process lookup failed: {}", e);
                return Err(BindFailure::Registry);
            }
        };

        let sensor_id = self.allocate(&process).await?;
        self.registry
            .register_sensor(sensor_id, process.id)
            .await
            .map_err(|e| {
                error!("Could not register sensor {}: {}", sensor_id, e);
                BindFailure::Registry
            })
    }

    async fn allocate(&self, process: &Process) -> Result<SensorId, BindFailure> {
        if self.identity_attempts == 0 {
            return Ok(self.identity.allocate());
        }

        for attempt in 1..=self.identity_attempts {
            let candidate = self.identity.allocate();
            match self.registry.find_sensor(candidate).await {
                Ok(None) => return Ok(candidate),
                Ok(Some(existing)) => debug!(
                    "Candidate id {} already bound in process {} (attempt {}/{})",
                    candidate, existing.process_id, attempt, self.identity_attempts
                ),
                Err(RegistryError::NotFound(_)) => return Ok(candidate),
                Err(e) => {
                    error!("Sensor lookup failed while allocating an id: {}", e);
                    return Err(BindFailure::Registry);
                }
            }
        }

        warn!(
            "No free sensor id after {} attempts for process {}",
            self.identity_attempts, process.id
        );
        Err(BindFailure::IdentityExhausted)
    }

    async fn respond(&self, response: BindResponse) {
        if let Err(e) = publish_json(self.publisher.as_ref(), &self.response_topic, &response).await
        {
            error!(
                "Failed to publish bind response for req_id={}: {}",
                response.req_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::{
        identity::ScriptedIdentity,
        publisher::testing::RecordingPublisher,
        registry::{InMemoryRegistry, ProcessAdmin},
    };

    const RESPONSES: &str = "sensores/bind/response";

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        publisher: Arc<RecordingPublisher>,
        handler: BindHandler,
    }

    fn fixture_with(ids: Vec<u64>, attempts: u8, publisher: RecordingPublisher) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let publisher = Arc::new(publisher);
        let handler = BindHandler::new(
            registry.clone(),
            publisher.clone(),
            Arc::new(ScriptedIdentity::new(ids)),
            RESPONSES,
            attempts,
        );
        Fixture {
            registry,
            publisher,
            handler,
        }
    }

    fn fixture(ids: Vec<u64>) -> Fixture {
        fixture_with(ids, 3, RecordingPublisher::default())
    }

    #[tokio::test]
    async fn test_bind_with_active_process() {
        let f = fixture(vec![4242]);
        let process = f.registry.create_process("P1").await.unwrap();

        let outcome = f.handler.handle(br#"{"req_id":"r1","nome":"s1"}"#).await;

        let binding = match outcome {
            BindOutcome::Bound(binding) => binding,
            other => panic!("expected a binding, got {other:?}"),
        };
        assert_eq!(binding.process_id, process.id);
        assert_eq!(binding.sensor_id, SensorId(4242));
        assert_eq!(
            f.publisher.json_on(RESPONSES),
            vec![json!({"req_id": "r1", "id": "4242", "status": "ok"})]
        );
        let stored = f.registry.find_sensor(SensorId(4242)).await.unwrap().unwrap();
        assert_eq!(stored.process_id, process.id);
    }

    #[tokio::test]
    async fn test_bind_without_active_process() {
        let f = fixture(vec![1]);
        let outcome = f.handler.handle(br#"{"req_id":"r2","nome":"s2"}"#).await;

        assert_eq!(outcome, BindOutcome::Failed(BindFailure::NoActiveProcess));
        assert_eq!(
            f.publisher.json_on(RESPONSES),
            vec![json!({"req_id": "r2", "id": "", "status": "fail"})]
        );
        assert_eq!(f.registry.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_after_process_ended() {
        let f = fixture(vec![1]);
        let process = f.registry.create_process("P1").await.unwrap();
        f.registry.end_process(process.id).await.unwrap();

        let outcome = f.handler.handle(br#"{"req_id":"r3","nome":"s3"}"#).await;
        assert_eq!(outcome, BindOutcome::Failed(BindFailure::NoActiveProcess));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_requests_get_no_response() {
        let f = fixture(vec![1]);
        f.registry.create_process("P1").await.unwrap();

        let payloads: [&[u8]; 4] = [
            b"{not json",
            br#"{"req_id":"r4"}"#,
            br#"{"nome":"s4"}"#,
            br#"{"req_id":4,"nome":"s4"}"#,
        ];
        for payload in payloads {
            assert_eq!(f.handler.handle(payload).await, BindOutcome::Malformed);
        }
        assert!(f.publisher.sent().is_empty());
        assert_eq!(f.registry.binding_count().await, 0);
        assert!(logs_contain("Discarding malformed bind request"));
    }

    #[tokio::test]
    async fn test_name_alias_accepted() {
        let f = fixture(vec![77]);
        f.registry.create_process("P1").await.unwrap();
        let outcome = f.handler.handle(br#"{"req_id":"r5","name":"s5"}"#).await;
        assert!(matches!(outcome, BindOutcome::Bound(_)));
    }

    #[tokio::test]
    async fn test_registry_outage_yields_failure_response() {
        let f = fixture(vec![1]);
        f.registry.create_process("P1").await.unwrap();
        f.registry.set_offline(true);

        let outcome = f.handler.handle(br#"{"req_id":"r6","nome":"s6"}"#).await;
        assert_eq!(outcome, BindOutcome::Failed(BindFailure::Registry));
        assert_eq!(
            f.publisher.json_on(RESPONSES),
            vec![json!({"req_id": "r6", "id": "", "status": "fail"})]
        );
    }

    #[tokio::test]
    async fn test_collision_retries_next_candidate() {
        let f = fixture(vec![10, 10, 11]);
        f.registry.create_process("P1").await.unwrap();

        let first = f.handler.handle(br#"{"req_id":"a","nome":"x"}"#).await;
        let second = f.handler.handle(br#"{"req_id":"b","nome":"y"}"#).await;

        assert!(matches!(first, BindOutcome::Bound(ref b) if b.sensor_id == SensorId(10)));
        assert!(matches!(second, BindOutcome::Bound(ref b) if b.sensor_id == SensorId(11)));
        assert_eq!(f.registry.binding_count().await, 2);
    }

    #[tokio::test]
    async fn test_collision_exhausts_attempts() {
        let f = fixture(vec![10]);
        f.registry.create_process("P1").await.unwrap();

        f.handler.handle(br#"{"req_id":"a","nome":"x"}"#).await;
        let outcome = f.handler.handle(br#"{"req_id":"b","nome":"y"}"#).await;

        assert_eq!(outcome, BindOutcome::Failed(BindFailure::IdentityExhausted));
        let responses = f.publisher.json_on(RESPONSES);
        assert_eq!(responses[1], json!({"req_id": "b", "id": "", "status": "fail"}));
    }

    #[tokio::test]
    async fn test_unchecked_collision_fails_at_insert() {
        let f = fixture_with(vec![10], 0, RecordingPublisher::default());
        f.registry.create_process("P1").await.unwrap();

        f.handler.handle(br#"{"req_id":"a","nome":"x"}"#).await;
        let outcome = f.handler.handle(br#"{"req_id":"b","nome":"y"}"#).await;
        assert_eq!(outcome, BindOutcome::Failed(BindFailure::Registry));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_failure_is_logged_not_raised() {
        let f = fixture_with(vec![5], 3, RecordingPublisher::failing());
        f.registry.create_process("P1").await.unwrap();

        let outcome = f.handler.handle(br#"{"req_id":"r7","nome":"s7"}"#).await;
        assert!(matches!(outcome, BindOutcome::Bound(_)));
        assert!(logs_contain("Failed to publish bind response for req_id=r7"));
    }
}
