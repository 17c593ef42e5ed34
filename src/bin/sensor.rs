//! Sensor simulator.
//!
//! Connects to the broker, waits for `iniciar`, binds, then publishes a
//! synthetic humidity reading every interval until `finalizar`. Exits with
//! status 1 when the broker connection is lost.
//!
//! ```bash
//! greenbee-sensor --broker-host 127.0.0.1 --sensor-name esp32_1 --interval 5
//! ```

use std::{path::PathBuf, process, sync::Arc};

use clap::Parser;
use greenbee::{
    config::Config,
    core::device::{
        DeviceError, DeviceLink, DeviceMachine, DeviceSignals, StopReason, SyntheticSensor,
    },
    logger::LoggerManager,
    print_error,
};
use greenbee_mqtt::{Backoff, Session, TransferError};
use tracing::{error, info, warn};
use validator::Validate;

#[derive(Parser, Debug)]
#[command(name = "greenbee-sensor")]
#[command(about = "Simulated humidity sensor speaking the greenbee bind protocol", long_about = None)]
struct Args {
    /// Configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Name sent in the bind request
    #[arg(long)]
    sensor_name: Option<String>,

    /// Seconds between readings
    #[arg(long)]
    interval: Option<u64>,

    /// How long to wait for the bind response
    #[arg(long)]
    bind_timeout_ms: Option<u64>,
}

impl Args {
    fn into_config(self) -> Config {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path).unwrap_or_else(|e| {
                print_error!("{}", e);
                process::exit(1);
            }),
            None => Config::default(),
        };
        if let Some(host) = self.broker_host {
            cfg.transport.host = host;
        }
        if let Some(port) = self.broker_port {
            cfg.transport.port = port;
        }
        if let Some(name) = self.sensor_name {
            cfg.device.name = name;
        }
        if let Some(interval) = self.interval {
            cfg.device.measurement_interval = interval;
        }
        if let Some(timeout) = self.bind_timeout_ms {
            cfg.device.bind_timeout_ms = timeout;
        }
        if let Err(e) = cfg.validate() {
            print_error!("Invalid configuration: {}", e);
            process::exit(1);
        }
        cfg
    }
}

async fn connect(cfg: &Config) -> Result<Session, TransferError> {
    let transport = cfg.transport.with_client_suffix("sensor");
    let mut backoff = Backoff::from_config(&transport);
    loop {
        match Session::connect(&transport).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                let delay = backoff.next_sleep()?;
                warn!(
                    "Broker connection failed, retrying in {:.2}s: {}",
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cfg = Args::parse().into_config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });

    info!(
        "Sensor '{}' connecting to {}:{}",
        cfg.device.name, cfg.transport.host, cfg.transport.port
    );
    let session = connect(&cfg).await.unwrap_or_else(|e| {
        error!("Could not connect to the broker: {}", e);
        process::exit(1);
    });
    let publisher = Arc::new(session.handle());

    let signals = Arc::new(DeviceSignals::new());
    let link = DeviceLink::attach(Box::new(session), &cfg.topics, signals.clone())
        .await
        .unwrap_or_else(|e| {
            error!("Failed to subscribe: {}", e);
            process::exit(1);
        });

    let mut machine = DeviceMachine::new(
        publisher,
        signals,
        Box::new(SyntheticSensor),
        cfg.topics.clone(),
        cfg.device.clone(),
    );

    let outcome = tokio::select! {
        outcome = machine.run_linked(&link) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let code = match outcome {
        Some(Ok(StopReason::Completed)) => 0,
        Some(Ok(reason)) => {
            error!("Sensor halted: {:?}", reason);
            2
        }
        Some(Err(DeviceError::ConnectionLost)) => {
            error!("Sensor stopped: connection lost");
            1
        }
        Some(Err(e)) => {
            error!("Sensor failed: {}", e);
            1
        }
        None => {
            info!("Received Ctrl+C, leaving in state {}", machine.state());
            0
        }
    };

    link.close().await;
    process::exit(code);
}
