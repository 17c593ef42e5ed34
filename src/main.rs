use std::{
    process,
    sync::{Arc, OnceLock},
};

use greenbee::{
    config::Config,
    core::{
        consumer::{Consumer, ConsumerState},
        publisher::Publisher,
        registry::{self, RegistryHandles},
        transport::MqttConnector,
    },
    logger::LoggerManager,
    print_error,
};
use greenbee_mqtt::MqttManager;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

async fn open_registry(cfg: &Config) -> RegistryHandles {
    let handles = registry::open(&cfg.registry).unwrap_or_else(|e| {
        error!("Failed to open registry: {}", e);
        process::exit(1);
    });
    info!("Registry backend: {:?}", cfg.registry.backend);

    if let Some(name) = &cfg.registry.bootstrap_process {
        match handles.ensure_active_process(name).await {
            Ok(process) => info!("Active process: {} ('{}')", process.id, process.name),
            Err(e) => warn!("Could not bootstrap process '{}': {}", name, e),
        }
    }
    handles
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting greenbee version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.transport);
    info!("Log level: {}", cfg.logger.level);

    let handles = open_registry(cfg).await;

    info!("Starting MQTT publisher...");
    let instance = MqttManager::from_config(cfg.transport.with_client_suffix("pub"))
        .build_and_start()
        .map(Arc::new)
        .unwrap_or_else(|e| {
            error!("Failed to build and start MQTT kernel: {}", e);
            process::exit(1);
        });
    let publisher: Arc<dyn Publisher> =
        Arc::new(greenbee_mqtt::Publisher::new(instance.clone()));

    let connector = MqttConnector::new(cfg.transport.with_client_suffix("sub"));
    let consumer = Consumer::new(
        handles.gateway.clone(),
        publisher,
        Arc::new(connector),
        &cfg.topics,
        &cfg.consumer,
    );
    consumer.start().unwrap_or_else(|e| {
        error!("Failed to start consumer: {}", e);
        process::exit(1);
    });

    let mut state = consumer.subscribe_state();
    let failure = tokio::select! {
        _ = state.wait_for(|s| *s == ConsumerState::Stopped) => {
            Some("Consumer stopped unexpectedly")
        }
        _ = instance.closed() => Some("MQTT publisher connection lost"),
        _ = tokio::signal::ctrl_c() => None,
    };
    match failure {
        Some(reason) => error!("{}, shutting down", reason),
        None => info!("Received Ctrl+C, initiating graceful shutdown..."),
    }

    consumer.stop().await;
    instance.shutdown().await;
    info!("Shutdown complete");
    if failure.is_some() {
        process::exit(1);
    }
    Ok(())
}
