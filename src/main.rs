use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

mod accessory;
mod config;
mod discovery;
mod hap;
mod messages;
mod monitor;
mod mqtt;
mod reading;
mod scheduler;

/// Hourly HomeKit temperature monitor.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file; built-in defaults apply when it is missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    // a panic anywhere, spawned tasks included, takes the whole process down
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Uncaught panic: {}", panic_info);
        default_hook(panic_info);
        std::process::exit(1);
    }));

    if let Err(err) = run(Cli::parse()).await {
        error!("Fatal error: {:?}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::AppConfig::load(&cli.config)?;
    info!(
        "HAP discovery window {}s, refresh every {}s",
        config.hap.timeout_seconds, config.hap.refresh_seconds
    );

    let hap_config = config.hap.clone();
    let discovery = discovery::TemperatureDiscovery::new(
        move || hap::IpHapClient::connect(&hap_config),
        discovery::DISCOVERY_TIMEOUT,
    );

    let mqtt_client = config.mqtt.as_ref().map(|mqtt_config| {
        let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        tokio::spawn(async move {
            mqtt::MqttClient::event_loop(&mut eventloop).await;
        });
        client
    });

    let mut core = monitor::Monitor::new(
        scheduler::CronScheduler::new(),
        discovery,
        mqtt_client.clone(),
    );
    core.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down temperature monitor...");
    if core.is_running() {
        core.stop();
    }

    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect().await {
            error!("Error disconnecting MQTT client: {:?}", err);
        }
    }

    Ok(())
}
