use std::sync::Arc;

use futures::future::BoxFuture;
use log::{error, info, warn};

use crate::discovery::TemperatureDiscovery;
use crate::hap::{DiscoveryError, HapClient};
use crate::mqtt::MqttClient;
use crate::reading::process_reading;
use crate::scheduler::{Job, Scheduler};

/// Top of every hour.
pub const HOURLY: &str = "0 * * * *";

/// Owns the running flag and the hourly registration.
pub struct Monitor<S, F> {
    running: bool,
    scheduler: S,
    discovery: Arc<TemperatureDiscovery<F>>,
    mqtt: Option<MqttClient>,
}

impl<S, F, C> Monitor<S, F>
where
    S: Scheduler,
    F: Fn() -> Result<C, DiscoveryError> + Send + Sync + 'static,
    C: HapClient,
{
    pub fn new(scheduler: S, discovery: TemperatureDiscovery<F>, mqtt: Option<MqttClient>) -> Self {
        Monitor {
            running: false,
            scheduler,
            discovery: Arc::new(discovery),
            mqtt,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Registers the hourly check and kicks off one right away. A second call is a no-op.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.running {
            warn!("Temperature monitoring is already running");
            return Ok(());
        }

        self.running = true;
        info!("Starting hourly temperature monitoring...");

        let discovery = self.discovery.clone();
        let mqtt = self.mqtt.clone();
        let job: Job = Arc::new(move || -> BoxFuture<'static, ()> {
            let discovery = discovery.clone();
            let mqtt = mqtt.clone();
            Box::pin(async move {
                info!("Scheduled temperature check...");
                check_temperature(&discovery, mqtt.as_ref()).await;
            })
        });

        self.scheduler.schedule(HOURLY, job)?;
        info!("Hourly monitoring scheduled (runs at the top of every hour)");

        info!("Getting initial temperature reading...");
        let discovery = self.discovery.clone();
        let mqtt = self.mqtt.clone();
        tokio::spawn(async move {
            check_temperature(&discovery, mqtt.as_ref()).await;
        });

        Ok(())
    }

    // TODO: keep the registration handle and cancel it here; the hourly check keeps firing after stop.
    pub fn stop(&mut self) {
        self.running = false;
        info!("Temperature monitoring stopped");
    }
}

async fn check_temperature<F, C>(discovery: &TemperatureDiscovery<F>, mqtt: Option<&MqttClient>)
where
    F: Fn() -> Result<C, DiscoveryError> + Send + Sync + 'static,
    C: HapClient,
{
    let Some(reading) = discovery.get_temperature().await else {
        return;
    };
    let band = process_reading(&reading);

    if let Some(mqtt) = mqtt {
        if let Err(err) = mqtt.announce_reading(&reading, band).await {
            error!("Error announcing reading: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::discovery::DISCOVERY_TIMEOUT;
    use crate::hap::IpHapClient;

    #[derive(Clone, Default)]
    struct CountingScheduler {
        registrations: Arc<AtomicUsize>,
        expressions: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Scheduler for CountingScheduler {
        fn schedule(&mut self, expression: &str, _job: Job) -> anyhow::Result<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            self.expressions.lock().unwrap().push(expression.to_string());
            Ok(())
        }
    }

    fn unreachable_discovery()
    -> TemperatureDiscovery<impl Fn() -> Result<IpHapClient, DiscoveryError> + Send + Sync + 'static>
    {
        TemperatureDiscovery::new(|| Err(DiscoveryError::ClientClosed), DISCOVERY_TIMEOUT)
    }

    #[tokio::test]
    async fn test_start_twice_registers_once() {
        let scheduler = CountingScheduler::default();
        let mut monitor = Monitor::new(scheduler.clone(), unreachable_discovery(), None);

        monitor.start().unwrap();
        monitor.start().unwrap();

        assert!(monitor.is_running());
        assert_eq!(scheduler.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(*scheduler.expressions.lock().unwrap(), vec![HOURLY.to_string()]);
    }

    #[tokio::test]
    async fn test_stop_keeps_registration() {
        let scheduler = CountingScheduler::default();
        let mut monitor = Monitor::new(scheduler.clone(), unreachable_discovery(), None);

        monitor.start().unwrap();
        monitor.stop();
        assert!(!monitor.is_running());

        // restarting after stop registers a second hourly job
        monitor.start().unwrap();
        assert_eq!(scheduler.registrations.load(Ordering::SeqCst), 2);
    }
}
