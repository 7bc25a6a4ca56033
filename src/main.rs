mod config;
mod elterm;
mod mqtt;
mod notifier;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::elterm::server::EltermServer;
use crate::elterm::{StatusObject, fields};
use crate::mqtt::client::{MqttClient, MqttMessage, parse_command_topic};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting lokalterm-to-mqtt bridge (mqtt={}:{}, appliance={} on {}:{})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.appliance.name,
        config.appliance.listen_host,
        config.appliance.listen_port,
    );

    // Channels
    let (mqtt_cmd_tx, mut mqtt_cmd_rx) = mpsc::channel::<MqttMessage>(100);
    let (status_tx, status_rx) = mpsc::channel::<StatusObject>(100);
    let (snapshot_tx, snapshot_rx) = mpsc::channel::<StatusObject>(100);

    let server = EltermServer::new(config.appliance.clone(), status_tx);
    if let Err(e) = server.start().await {
        error!(
            "Failed to listen on {}:{}: {}",
            config.appliance.listen_host, config.appliance.listen_port, e
        );
        std::process::exit(1);
    }

    // Throttle between the appliance and the broker
    let notifier_handle = tokio::spawn(notifier::run(
        status_rx,
        snapshot_tx,
        notifier::THROTTLE_INTERVAL,
    ));

    let mqtt_client = MqttClient::new(&config);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(mqtt_cmd_tx, snapshot_rx).await;
    });

    let topic_prefix = config.mqtt.topic_prefix.clone();
    let device_topic = config.appliance.topic_name.clone();

    // Main loop: route MQTT commands to the appliance + handle shutdown
    loop {
        tokio::select! {
            Some(msg) = mqtt_cmd_rx.recv() => {
                let Some((topic_name, key)) = parse_command_topic(&msg.topic, &topic_prefix) else {
                    continue;
                };
                if topic_name != device_topic {
                    warn!("Unknown device in command topic: {}", topic_name);
                    continue;
                }
                let current = server.last_status().await;
                match fields::build_command(key, &msg.payload, current.as_ref()) {
                    Some(request) => server.submit(request).await,
                    None => warn!("Could not build command: key={}, value={}", key, msg.payload),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    server.stop().await;
    notifier_handle.abort();
    mqtt_handle.abort();
    info!("lokalterm-to-mqtt bridge stopped");
}
