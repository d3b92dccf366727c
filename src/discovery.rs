use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, oneshot, watch};

use crate::accessory::AccessoryDirectory;
use crate::hap::{DiscoveryError, HapClient};
use crate::messages::ClientEvent;
use crate::reading::TemperatureReading;

/// How long a discovery call waits for the directory before giving up.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

const CURRENT_TEMPERATURE_TYPES: [&str; 3] = [
    "CurrentTemperature",
    "11",
    "00000011-0000-1000-8000-0026BB765291",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureDevice {
    pub name: String,
    pub device_id: String,
    pub aid: u64,
    pub iid: u64,
    pub temperature: f64,
    pub host: String,
    pub port: u16,
}

/// A result slot that accepts exactly one value. Later resolves are ignored.
pub struct ResolveOnce<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
    settled: watch::Sender<bool>,
}

impl<T> ResolveOnce<T> {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let (settled, _) = watch::channel(false);
        (
            Arc::new(ResolveOnce {
                sender: Mutex::new(Some(tx)),
                settled,
            }),
            rx,
        )
    }

    /// Returns `false` when the slot was already filled.
    pub fn resolve(&self, value: T) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // the receiver may be gone already; the slot still counts as filled
                let _ = tx.send(value);
                self.settled.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub async fn settled(&self) {
        let mut rx = self.settled.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;
    }
}

fn is_temperature_characteristic(type_tag: &str, description: Option<&str>) -> bool {
    CURRENT_TEMPERATURE_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(type_tag))
        || description.is_some_and(|d| d.contains("Temperature"))
}

/// Every temperature characteristic in directory order.
pub fn temperature_devices(directory: &AccessoryDirectory) -> Vec<TemperatureDevice> {
    let mut devices = Vec::new();
    for (device_id, accessory) in directory.iter() {
        info!(
            "Checking device: {} {}",
            device_id,
            accessory.name.as_deref().unwrap_or("")
        );
        for service in &accessory.services {
            debug!("  service {} (type {})", service.iid, service.type_tag);
            for characteristic in &service.characteristics {
                if !is_temperature_characteristic(
                    &characteristic.type_tag,
                    characteristic.description.as_deref(),
                ) {
                    continue;
                }
                let Some(temperature) = characteristic.value else {
                    debug!(
                        "Skipping temperature characteristic {}.{} on {} without a numeric value",
                        characteristic.aid, characteristic.iid, device_id
                    );
                    continue;
                };

                info!("Found temperature sensor: {}°C", temperature);
                devices.push(TemperatureDevice {
                    name: accessory
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("Device-{}", device_id)),
                    device_id: device_id.to_string(),
                    aid: characteristic.aid,
                    iid: characteristic.iid,
                    temperature,
                    host: accessory.host.clone(),
                    port: accessory.port,
                });
            }
        }
    }
    devices
}

type Outcome = Result<Vec<TemperatureDevice>, DiscoveryError>;

/// Opens a fresh client per call and reads the first temperature characteristic it exposes.
pub struct TemperatureDiscovery<F> {
    connect: F,
    timeout: Duration,
}

impl<F, C> TemperatureDiscovery<F>
where
    F: Fn() -> Result<C, DiscoveryError> + Send + Sync + 'static,
    C: HapClient,
{
    pub fn new(connect: F, timeout: Duration) -> Self {
        TemperatureDiscovery { connect, timeout }
    }

    /// Races the directory listing against the timeout; whichever settles first wins.
    pub async fn discover_devices(&self) -> Outcome {
        let client = Arc::new((self.connect)()?);
        let (outcome, settled) = ResolveOnce::<Outcome>::new();

        let events = client.subscribe();
        tokio::spawn(listen_for_directory(
            client.clone(),
            events,
            outcome.clone(),
        ));

        let timeout = self.timeout;
        let timer = outcome.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer.resolve(Ok(Vec::new())) {
                info!("No temperature sensors found, resolving with empty result");
            }
        });

        settled.await.unwrap_or(Err(DiscoveryError::ClientClosed))
    }

    /// Never fails: discovery errors are logged and become `None`.
    pub async fn get_temperature(&self) -> Option<TemperatureReading> {
        info!("Fetching temperature from HomeKit...");

        let devices = match self.discover_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                error!("Error fetching temperature: {}", err);
                return None;
            }
        };

        let Some(device) = devices.into_iter().next() else {
            info!("No HomeKit devices with temperature sensors found");
            return None;
        };
        info!(
            "Found device: {} ({} characteristic {}.{} at {}:{})",
            device.name, device.device_id, device.aid, device.iid, device.host, device.port
        );

        let reading = TemperatureReading {
            temperature: device.temperature,
            timestamp: Local::now(),
            device_name: Some(device.name),
        };
        info!(
            "Temperature: {}°C at {}",
            reading.temperature,
            reading.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        Some(reading)
    }
}

async fn listen_for_directory<C: HapClient>(
    client: Arc<C>,
    mut events: broadcast::Receiver<ClientEvent>,
    outcome: Arc<ResolveOnce<Outcome>>,
) {
    loop {
        tokio::select! {
            _ = outcome.settled() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Ready) => {
                    info!("HAP client ready, getting accessories...");
                    let result = client.accessories().await.map(|directory| {
                        info!("Discovered accessories: {}", directory.len());
                        temperature_devices(&directory)
                    });
                    if let Err(err) = &result {
                        error!("Error discovering accessories: {}", err);
                    }
                    if !outcome.resolve(result) {
                        debug!("Directory arrived after discovery had settled, ignoring it");
                    }
                }
                Ok(ClientEvent::Hap(event)) => info!("HAP event received: {}", event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} HAP client events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    outcome.resolve(Err(DiscoveryError::ClientClosed));
                    break;
                }
            }
        }
    }
}
