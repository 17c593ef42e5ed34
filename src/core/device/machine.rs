//! Sensor-side state machine.
//!
//! ```text
//! AGUARDE --iniciar--> BIND --ok--> MEDICAO --no stop--> DEEP_SLEEP --wake--> MEDICAO
//!                        |             `--finalizar seen--> CLEANUP --> SHUTDOWN --> STOPPED
//!                        `--fail / timeout--> STOPPED
//! ```
//!
//! Each [`DeviceMachine::step`] performs exactly one transition. The bind
//! request is sent once; a rejection or timeout halts the machine.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    link::DeviceLink,
    sensor::Sensor,
    signals::DeviceSignals,
    state::{DeviceState, StopReason},
    DeviceError,
};
use crate::{
    config::{device::DeviceConfig, topics::TopicsConfig},
    core::{
        model::SensorId,
        protocol::{BindRequest, BindStatus, DeviceStatus, MeasurementMessage, UnbindMessage},
        publisher::{publish_json, Publisher},
    },
};

pub struct DeviceMachine {
    state: DeviceState,
    sensor_id: Option<SensorId>,
    publisher: Arc<dyn Publisher>,
    signals: Arc<DeviceSignals>,
    sensor: Box<dyn Sensor>,
    topics: TopicsConfig,
    config: DeviceConfig,
}

impl DeviceMachine {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        signals: Arc<DeviceSignals>,
        sensor: Box<dyn Sensor>,
        topics: TopicsConfig,
        config: DeviceConfig,
    ) -> Self {
        Self {
            state: DeviceState::Aguarde,
            sensor_id: None,
            publisher,
            signals,
            sensor,
            topics,
            config,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Identity received from the server, once bound.
    pub fn sensor_id(&self) -> Option<SensorId> {
        self.sensor_id
    }

    /// Steps until the machine halts.
    pub async fn run(&mut self) -> Result<StopReason, DeviceError> {
        info!("Device '{}' waiting for the start command", self.config.name);
        loop {
            if let DeviceState::Stopped(reason) = self.step().await? {
                return Ok(reason);
            }
        }
    }

    /// Like [`run`](Self::run), but gives up with
    /// [`DeviceError::ConnectionLost`] as soon as `link` stops receiving.
    pub async fn run_linked(&mut self, link: &DeviceLink) -> Result<StopReason, DeviceError> {
        let outcome = tokio::select! {
            outcome = self.run() => Some(outcome),
            _ = link.closed() => None,
        };
        match outcome {
            Some(outcome) => outcome,
            None => {
                error!(
                    "Device '{}' lost its broker connection in state {}",
                    self.config.name, self.state
                );
                Err(DeviceError::ConnectionLost)
            }
        }
    }

    pub async fn step(&mut self) -> Result<DeviceState, DeviceError> {
        let next = match self.state {
            DeviceState::Aguarde => self.wait_for_start().await,
            DeviceState::Bind => self.bind().await,
            DeviceState::Medicao => self.measure().await?,
            DeviceState::DeepSleep => self.deep_sleep().await,
            DeviceState::Cleanup => self.cleanup().await?,
            DeviceState::Shutdown => {
                self.send_status(DeviceStatus::Shutdown).await;
                info!("Device '{}' shut down", self.config.name);
                DeviceState::Stopped(StopReason::Completed)
            }
            stopped @ DeviceState::Stopped(_) => stopped,
        };
        if next != self.state {
            debug!("Device state {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(next)
    }

    async fn wait_for_start(&self) -> DeviceState {
        if self.signals.start_requested() {
            return DeviceState::Bind;
        }
        tokio::time::sleep(self.config.wait_poll_interval()).await;
        DeviceState::Aguarde
    }

    async fn bind(&mut self) -> DeviceState {
        let request = BindRequest {
            req_id: Uuid::new_v4().to_string(),
            name: self.config.name.clone(),
        };
        self.signals.expect_bind(&request.req_id);
        match publish_json(self.publisher.as_ref(), &self.topics.bind_request, &request).await {
            Ok(()) => info!("Requested sensor id with req_id={}", request.req_id),
            Err(e) => error!("Failed to publish bind request: {}", e),
        }

        let deadline = Instant::now() + self.config.bind_timeout();
        loop {
            if let Some(response) = self.signals.take_bind_response() {
                match (response.status, response.assigned_id()) {
                    (BindStatus::Ok, Some(id)) => {
                        info!("Bound as sensor {}", id);
                        self.sensor_id = Some(id);
                        return DeviceState::Medicao;
                    }
                    (BindStatus::Ok, None) => {
                        error!("Bind response carried an unusable id '{}'", response.id);
                        return DeviceState::Stopped(StopReason::BindRejected);
                    }
                    (BindStatus::Fail, _) => {
                        error!("Server refused bind req_id={}", request.req_id);
                        return DeviceState::Stopped(StopReason::BindRejected);
                    }
                }
            }
            if Instant::now() >= deadline {
                error!(
                    "No bind response within {:?}, giving up",
                    self.config.bind_timeout()
                );
                return DeviceState::Stopped(StopReason::BindTimedOut);
            }
            tokio::time::sleep(self.config.bind_poll_interval()).await;
        }
    }

    async fn measure(&mut self) -> Result<DeviceState, DeviceError> {
        let id = self.sensor_id.ok_or(DeviceError::Unbound)?;
        let reading = MeasurementMessage {
            id,
            medicao: self.sensor.read(),
        };
        match publish_json(self.publisher.as_ref(), &self.topics.measurement, &reading).await {
            Ok(()) => info!("Sent reading {:.2} as sensor {}", reading.medicao, id),
            Err(e) => error!("Failed to publish reading: {}", e),
        }

        if self.signals.stop_requested() {
            Ok(DeviceState::Cleanup)
        } else {
            Ok(DeviceState::DeepSleep)
        }
    }

    async fn deep_sleep(&self) -> DeviceState {
        self.send_status(DeviceStatus::Sleeping).await;
        debug!("Sleeping for {:?}", self.config.measurement_interval());
        tokio::time::sleep(self.config.measurement_interval()).await;
        DeviceState::Medicao
    }

    async fn cleanup(&mut self) -> Result<DeviceState, DeviceError> {
        let id = self.sensor_id.ok_or(DeviceError::Unbound)?;
        self.send_status(DeviceStatus::Cleanup).await;
        match publish_json(
            self.publisher.as_ref(),
            &self.topics.unbind,
            &UnbindMessage { id },
        )
        .await
        {
            Ok(()) => info!("Released sensor id {}", id),
            Err(e) => error!("Failed to publish unbind notice: {}", e),
        }
        Ok(DeviceState::Shutdown)
    }

    async fn send_status(&self, status: DeviceStatus) {
        let payload = status.as_str().as_bytes().to_vec();
        if let Err(e) = self
            .publisher
            .publish(&self.topics.status, payload, false)
            .await
        {
            warn!("Failed to publish status '{}': {}", status, e);
        }
    }
}
