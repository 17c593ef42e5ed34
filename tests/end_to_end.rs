//! Device and consumer talking over the in-process loopback bus.

use std::{sync::Arc, time::Duration};

use greenbee::{
    config::{consumer::ConsumerConfig, device::DeviceConfig, topics::TopicsConfig},
    core::{
        consumer::Consumer,
        device::{
            DeviceError, DeviceLink, DeviceMachine, DeviceSignals, DeviceState, StopReason,
            SyntheticSensor,
        },
        loopback::{quick_backoff, LoopbackBus},
        protocol::{BindResponse, BindStatus, ProcessCommand},
        publisher::send_process_command,
        registry::{InMemoryRegistry, ProcessAdmin, Registry},
    },
};

struct World {
    bus: LoopbackBus,
    registry: Arc<InMemoryRegistry>,
    consumer: Consumer,
    topics: TopicsConfig,
}

impl World {
    async fn start() -> World {
        let bus = LoopbackBus::new();
        let registry = Arc::new(InMemoryRegistry::new());
        let topics = TopicsConfig::default();
        let consumer = Consumer::new(
            registry.clone(),
            Arc::new(bus.clone()),
            Arc::new(bus.connector(quick_backoff(0))),
            &topics,
            &ConsumerConfig::default(),
        );
        consumer.start().unwrap();
        eventually(|| bus.session_count() == 1).await;
        // Subscriptions follow the connect.
        tokio::time::sleep(Duration::from_millis(50)).await;
        World {
            bus,
            registry,
            consumer,
            topics,
        }
    }

    async fn device(&self) -> (DeviceMachine, Arc<DeviceSignals>, DeviceLink) {
        self.device_with_interval(0).await
    }

    async fn device_with_interval(
        &self,
        measurement_interval: u64,
    ) -> (DeviceMachine, Arc<DeviceSignals>, DeviceLink) {
        let signals = Arc::new(DeviceSignals::new());
        let link = DeviceLink::attach(Box::new(self.bus.session()), &self.topics, signals.clone())
            .await
            .unwrap();
        let machine = DeviceMachine::new(
            Arc::new(self.bus.clone()),
            signals.clone(),
            Box::new(SyntheticSensor),
            self.topics.clone(),
            DeviceConfig {
                name: "esp32_e2e".into(),
                measurement_interval,
                bind_timeout_ms: 1000,
                bind_poll_interval_ms: 10,
                wait_poll_interval_ms: 10,
            },
        );
        (machine, signals, link)
    }

    async fn command(&self, command: ProcessCommand) {
        send_process_command(&self.bus, &self.topics, command, true)
            .await
            .unwrap();
    }

    fn bind_responses(&self) -> Vec<BindResponse> {
        self.bus
            .published_on(&self.topics.bind_response)
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn step_until(machine: &mut DeviceMachine, target: DeviceState) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while machine.state() != target {
            assert!(!machine.state().is_terminal(), "halted in {}", machine.state());
            machine.step().await.unwrap();
        }
    })
    .await
    .expect("target state not reached");
}

#[tokio::test]
async fn test_sensor_lifecycle_with_active_process() {
    let world = World::start().await;
    let process = world.registry.create_process("P1").await.unwrap();
    let (mut machine, signals, link) = world.device().await;

    world.command(ProcessCommand::Start).await;
    step_until(&mut machine, DeviceState::Medicao).await;

    let sensor_id = machine.sensor_id().unwrap();
    let responses = world.bind_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, BindStatus::Ok);
    assert_eq!(responses[0].assigned_id(), Some(sensor_id));
    let binding = world.registry.find_sensor(sensor_id).await.unwrap().unwrap();
    assert_eq!(binding.process_id, process.id);

    // Two readings, then the stop command.
    step_until(&mut machine, DeviceState::DeepSleep).await;
    step_until(&mut machine, DeviceState::Medicao).await;
    world.command(ProcessCommand::Finish).await;
    eventually(|| signals.stop_requested()).await;

    assert_eq!(machine.run().await.unwrap(), StopReason::Completed);
    link.close().await;

    let registry = world.registry.clone();
    let rows = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let rows = registry.measurements_for_process(process.id).await.unwrap();
            if rows.len() == 2 {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("measurements not stored");
    assert!(rows.iter().all(|row| row.sensor_id == sensor_id));
    assert!(rows.iter().all(|row| (0.0..=100.0).contains(&row.rh)));

    let status: Vec<_> = world
        .bus
        .published_on(&world.topics.status)
        .iter()
        .map(|payload| String::from_utf8(payload.to_vec()).unwrap())
        .collect();
    assert_eq!(status, vec!["sleeping", "cleanup", "shutdown"]);
    assert_eq!(world.bus.published_on(&world.topics.unbind).len(), 1);

    // Unbind keeps the history.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(world.registry.binding_count().await, 1);
    assert_eq!(world.registry.measurement_count().await, 2);

    world.consumer.stop().await;
}

#[tokio::test]
async fn test_bind_rejected_without_active_process() {
    let world = World::start().await;
    let (mut machine, _signals, link) = world.device().await;

    world.command(ProcessCommand::Start).await;
    assert_eq!(machine.run().await.unwrap(), StopReason::BindRejected);
    link.close().await;

    let responses = world.bind_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, BindStatus::Fail);
    assert_eq!(responses[0].id, "");
    assert!(world.bus.published_on(&world.topics.measurement).is_empty());
    assert_eq!(world.registry.binding_count().await, 0);

    world.consumer.stop().await;
}

#[tokio::test]
async fn test_bind_times_out_when_consumer_is_down() {
    let world = World::start().await;
    world.registry.create_process("P1").await.unwrap();
    world.consumer.stop().await;

    let (mut machine, _signals, link) = world.device().await;
    world.command(ProcessCommand::Start).await;

    assert_eq!(machine.run().await.unwrap(), StopReason::BindTimedOut);
    assert!(world.bind_responses().is_empty());
    assert_eq!(world.registry.binding_count().await, 0);
    link.close().await;
}

#[tokio::test]
async fn test_each_device_gets_its_own_identity() {
    let world = World::start().await;
    let process = world.registry.create_process("P1").await.unwrap();
    world.command(ProcessCommand::Start).await;

    let (mut first, _, first_link) = world.device().await;
    let (mut second, _, second_link) = world.device().await;
    step_until(&mut first, DeviceState::Medicao).await;
    step_until(&mut second, DeviceState::Medicao).await;

    let (a, b) = (first.sensor_id().unwrap(), second.sensor_id().unwrap());
    assert_ne!(a, b);
    for id in [a, b] {
        let binding = world.registry.find_sensor(id).await.unwrap().unwrap();
        assert_eq!(binding.process_id, process.id);
    }

    first_link.close().await;
    second_link.close().await;
    world.consumer.stop().await;
}

#[tokio::test]
async fn test_measuring_device_stops_when_connection_is_lost() {
    let world = World::start().await;
    world.registry.create_process("P1").await.unwrap();
    let (mut machine, _signals, link) = world.device_with_interval(1).await;

    world.command(ProcessCommand::Start).await;
    step_until(&mut machine, DeviceState::Medicao).await;
    assert!(!link.is_closed());

    world.bus.sever_all();
    let outcome = tokio::time::timeout(Duration::from_secs(3), machine.run_linked(&link))
        .await
        .expect("lost connection not noticed");
    assert!(matches!(outcome, Err(DeviceError::ConnectionLost)));
    assert!(link.is_closed());
    assert!(!machine.state().is_terminal());

    link.close().await;
    world.consumer.stop().await;
}

#[tokio::test]
async fn test_linked_run_completes_while_connected() {
    let world = World::start().await;
    world.registry.create_process("P1").await.unwrap();
    let (mut machine, signals, link) = world.device().await;

    world.command(ProcessCommand::Start).await;
    step_until(&mut machine, DeviceState::Medicao).await;
    world.command(ProcessCommand::Finish).await;
    eventually(|| signals.stop_requested()).await;

    assert_eq!(machine.run_linked(&link).await.unwrap(), StopReason::Completed);
    assert!(!link.is_closed());
    link.close().await;
    world.consumer.stop().await;
}
