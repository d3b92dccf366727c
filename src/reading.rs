use chrono::{DateTime, Local};
use log::info;
use serde_derive::Serialize;

/// Readings above this are too warm.
pub const HIGH_THRESHOLD: f64 = 25.0;
/// Readings below this are too cold.
pub const LOW_THRESHOLD: f64 = 18.0;

#[derive(Clone, Debug, PartialEq)]
pub struct TemperatureReading {
    pub temperature: f64,
    pub timestamp: DateTime<Local>,
    pub device_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComfortBand {
    High,
    Low,
    Comfortable,
}

impl ComfortBand {
    pub fn notice(&self) -> &'static str {
        match self {
            ComfortBand::High => "Temperature is high - consider turning on AC",
            ComfortBand::Low => "Temperature is low - consider turning on heating",
            ComfortBand::Comfortable => "Temperature is comfortable",
        }
    }
}

/// Both thresholds are inclusive on the comfortable side.
pub fn classify(temperature: f64) -> ComfortBand {
    if temperature > HIGH_THRESHOLD {
        ComfortBand::High
    } else if temperature < LOW_THRESHOLD {
        ComfortBand::Low
    } else {
        ComfortBand::Comfortable
    }
}

/// Logs the reading with its comfort notice and hands back the band.
pub fn process_reading(reading: &TemperatureReading) -> ComfortBand {
    info!("Processing temperature reading:");
    info!(
        "   Device: {}",
        reading.device_name.as_deref().unwrap_or("unknown")
    );
    info!("   Temperature: {}°C", reading.temperature);
    info!("   Time: {}", reading.timestamp.format("%Y-%m-%d %H:%M:%S"));

    let band = classify(reading.temperature);
    info!("{}", band.notice());
    band
}
