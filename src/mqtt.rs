use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;

use crate::config;
use crate::reading::{ComfortBand, TemperatureReading};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct ReadingMqttMessage<'a> {
    name: &'a str,
    temperature: f64,
    band: ComfortBand,
    timestamp: String,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "temp-monitor-rs".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "monitor".to_string()),
            },
            eventloop,
        )
    }

    /// Drives the connection; publishes only leave once this is polled.
    pub async fn event_loop(eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connection acknowledged");
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(_))) => {
                    debug!("Publish acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    // back off instead of spinning while the broker is unreachable
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    fn topic(&self, device_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(device_name)
        )
    }

    /// Topic and payload announcing `reading`; unnamed devices go out as `unknown`.
    fn reading_message<'a>(
        &self,
        reading: &'a TemperatureReading,
        band: ComfortBand,
    ) -> (String, ReadingMqttMessage<'a>) {
        let name = reading.device_name.as_deref().unwrap_or("unknown");
        (
            self.topic(name),
            ReadingMqttMessage {
                name,
                temperature: reading.temperature,
                band,
                timestamp: reading.timestamp.to_rfc3339(),
                retained: false,
            },
        )
    }

    pub async fn announce_reading(
        &self,
        reading: &TemperatureReading,
        band: ComfortBand,
    ) -> anyhow::Result<()> {
        let (topic, message) = self.reading_message(reading, band);
        info!(
            "Announcing {}°C ({:?}) from {} on MQTT",
            message.temperature, band, message.name
        );
        self.client
            .publish(
                topic,
                QoS::AtMostOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
