use std::collections::HashMap;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::elterm::StatusObject;
use crate::elterm::fields::{self, VOLATILE_KEYS};

pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: publish "offline" when the bridge drops off the broker.
        let lwt = rumqttc::LastWill::new(
            config.bridge_status_topic(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config: config.clone(),
        }
    }

    /// Run the MQTT event loop. Subscribes to the command topics on connect,
    /// forwards incoming publish messages through command_tx, and publishes
    /// the throttled snapshots received from snapshot_rx.
    pub async fn run(
        mut self,
        command_tx: mpsc::Sender<MqttMessage>,
        mut snapshot_rx: mpsc::Receiver<StatusObject>,
    ) {
        let command_filter = self.config.command_topic_filter();
        let mut last_values: HashMap<&'static str, String> = HashMap::new();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");

                            // try_* so a full request queue cannot stall the poll loop.
                            let topic = self.config.bridge_status_topic();
                            if let Err(e) = self
                                .client
                                .try_publish(&topic, QoS::AtLeastOnce, true, "online")
                            {
                                error!("Failed to publish online status: {}", e);
                            }

                            if let Err(e) = self
                                .client
                                .try_subscribe(&command_filter, QoS::AtLeastOnce)
                            {
                                error!("Failed to subscribe to {}: {}", command_filter, e);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let msg = MqttMessage {
                                topic: publish.topic.clone(),
                                payload: String::from_utf8_lossy(&publish.payload).to_string(),
                            };
                            if command_tx.send(msg).await.is_err() {
                                warn!("Command channel closed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(snapshot) = snapshot_rx.recv() => {
                    publish_snapshot(&self.client, &self.config, &snapshot, &mut last_values);
                }
            }
        }
    }
}

/// Queue the full snapshot and every changed state value.
///
/// Never waits on the request queue: while the broker is unreachable the
/// queue fills up and updates are dropped. A dropped state value is not
/// remembered in `last_values`, so the next snapshot offers it again.
fn publish_snapshot(
    client: &AsyncClient,
    config: &Config,
    snapshot: &StatusObject,
    last_values: &mut HashMap<&'static str, String>,
) {
    let topic = config.snapshot_topic();
    let body = serde_json::Value::Object(snapshot.clone()).to_string();
    if let Err(e) = client.try_publish(&topic, QoS::AtMostOnce, true, body.into_bytes()) {
        warn!("Dropped snapshot for {}: {}", topic, e);
    }

    for update in fields::state_updates(snapshot) {
        if last_values.get(update.key) == Some(&update.value) {
            continue;
        }
        let topic = config.state_topic(update.key);
        let retain = !VOLATILE_KEYS.contains(&update.key);
        debug!("Publishing {}: {}", topic, update.value);
        let payload = update.value.as_bytes();
        if let Err(e) = client.try_publish(&topic, QoS::AtMostOnce, retain, payload) {
            debug!("Dropped update for {}: {}", topic, e);
            continue;
        }
        last_values.insert(update.key, update.value);
    }
}

/// Parse a command topic into (device topic name, command key).
/// Expected format: {prefix}/{topic_name}/command/{key}
pub fn parse_command_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (topic_name, rest) = rest.split_once('/')?;
    let key = rest.strip_prefix("command/")?;
    if topic_name.is_empty() || key.is_empty() {
        return None;
    }
    Some((topic_name, key))
}
