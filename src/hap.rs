//! HomeKit Accessory Protocol client for IP accessories.
//!
//! Instances are found over mDNS (`_hap._tcp`) and queried with
//! `GET /accessories`, sending the pin in the `Authorization` header the way
//! Homebridge's insecure mode expects.

use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{Instant, interval_at, sleep};

use crate::accessory::{AccessoryDirectory, HapAccessories};
use crate::config::HapConfig;
use crate::discovery::DISCOVERY_TIMEOUT;
use crate::messages::ClientEvent;

const HAP_SERVICE_TYPE: &str = "_hap._tcp.local.";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS browser failed: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("HAP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HAP client closed before the directory was ready")]
    ClientClosed,
}

/// An accessory-protocol connection, opened once per discovery call.
pub trait HapClient: Send + Sync + 'static {
    /// Event stream; subscribe before requesting anything.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;

    /// Fetches the full accessory directory.
    fn accessories(
        &self,
    ) -> impl Future<Output = Result<AccessoryDirectory, DiscoveryError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HapInstance {
    pub fullname: String,
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl HapInstance {
    pub fn from_service_info(info: &ServiceInfo) -> Self {
        let fullname = info.get_fullname();
        let name = fullname
            .strip_suffix(HAP_SERVICE_TYPE)
            .map(|n| n.trim_end_matches('.'))
            .unwrap_or(fullname)
            .to_string();

        let addresses = info.get_addresses();
        let host = addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addresses.iter().next())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| info.get_hostname().trim_end_matches('.').to_string());

        HapInstance {
            fullname: fullname.to_string(),
            id: info
                .get_property_val_str("id")
                .map(str::to_string)
                .unwrap_or_else(|| name.clone()),
            name,
            host,
            port: info.get_port(),
        }
    }

    /// Whether an mDNS removal for `fullname` refers to this instance.
    pub fn is_named(&self, fullname: &str) -> bool {
        self.fullname == fullname
    }

    pub fn accessories_url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("http://[{}]:{}/accessories", addr, self.port),
            _ => format!("http://{}:{}/accessories", self.host, self.port),
        }
    }
}

/// Lists accessories of known instances over HTTP.
pub struct AccessoryFetcher {
    http: reqwest::Client,
    pin: String,
}

impl AccessoryFetcher {
    pub fn new(pin: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        Ok(AccessoryFetcher {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            pin: pin.to_string(),
        })
    }

    async fn fetch(&self, instance: &HapInstance) -> Result<AccessoryDirectory, DiscoveryError> {
        let response: HapAccessories = self
            .http
            .get(instance.accessories_url())
            .header("Authorization", &self.pin)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.into_directory(&instance.id, &instance.host, instance.port))
    }

    /// Queries every instance at once and merges the listings in instance order.
    ///
    /// Instances that fail to answer are skipped; the call only fails when all of them do.
    pub async fn fetch_all(
        &self,
        instances: &[HapInstance],
    ) -> Result<AccessoryDirectory, DiscoveryError> {
        let results = join_all(instances.iter().map(|instance| self.fetch(instance))).await;

        let mut directory = AccessoryDirectory::new();
        let mut answered = false;
        let mut last_error = None;
        for (instance, result) in instances.iter().zip(results) {
            match result {
                Ok(found) => {
                    answered = true;
                    directory.extend(found);
                }
                Err(err) => {
                    warn!("Could not list accessories of {}: {}", instance.name, err);
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if !answered => Err(err),
            _ => Ok(directory),
        }
    }
}

pub struct IpHapClient {
    fetcher: AccessoryFetcher,
    daemon: ServiceDaemon,
    events: broadcast::Sender<ClientEvent>,
    instances: Arc<Mutex<Vec<HapInstance>>>,
}

impl IpHapClient {
    /// Starts browsing for HAP instances. `Ready` fires once the discovery
    /// window elapses and again on every refresh.
    pub fn connect(config: &HapConfig) -> Result<Self, DiscoveryError> {
        let fetcher = AccessoryFetcher::new(&config.pin, config.fetch_timeout(DISCOVERY_TIMEOUT))?;
        let daemon = ServiceDaemon::new()?;
        let browse = daemon.browse(HAP_SERVICE_TYPE)?;

        let (events, _) = broadcast::channel(16);
        let instances = Arc::new(Mutex::new(Vec::<HapInstance>::new()));

        let level = if config.debug {
            log::Level::Info
        } else {
            log::Level::Debug
        };
        let window = config.discovery_window();
        let refresh = config.refresh_interval();
        let tx = events.clone();
        let found = instances.clone();

        tokio::spawn(async move {
            let ready_at = sleep(window);
            tokio::pin!(ready_at);
            let mut refresh_ticks = interval_at(Instant::now() + window + refresh, refresh);
            let mut ready = false;

            loop {
                tokio::select! {
                    event = browse.recv_async() => match event {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let instance = HapInstance::from_service_info(&info);
                            log::log!(level, "Resolved HAP instance {} at {}:{}", instance.name, instance.host, instance.port);
                            if ready {
                                let _ = tx.send(ClientEvent::Hap(json!({
                                    "event": "instanceResolved",
                                    "id": instance.id,
                                    "name": instance.name,
                                })));
                            }
                            let mut known = found.lock().unwrap_or_else(PoisonError::into_inner);
                            known.retain(|k| k.id != instance.id);
                            known.push(instance);
                        }
                        Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                            log::log!(level, "HAP instance {} went away", fullname);
                            if ready {
                                let _ = tx.send(ClientEvent::Hap(json!({
                                    "event": "instanceRemoved",
                                    "fullname": fullname,
                                })));
                            }
                            found
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .retain(|k| !k.is_named(&fullname));
                        }
                        Ok(other) => debug!("mDNS event: {:?}", other),
                        Err(_) => {
                            debug!("mDNS browse channel closed");
                            break;
                        }
                    },
                    _ = &mut ready_at, if !ready => {
                        ready = true;
                        let _ = tx.send(ClientEvent::Ready);
                    }
                    _ = refresh_ticks.tick() => {
                        let _ = tx.send(ClientEvent::Ready);
                    }
                }
            }
        });

        Ok(IpHapClient {
            fetcher,
            daemon,
            events,
            instances,
        })
    }

    fn known_instances(&self) -> Vec<HapInstance> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HapClient for IpHapClient {
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn accessories(&self) -> Result<AccessoryDirectory, DiscoveryError> {
        let instances = self.known_instances();
        self.fetcher.fetch_all(&instances).await
    }
}

impl Drop for IpHapClient {
    fn drop(&mut self) {
        if let Err(err) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[test]
    fn test_instance_from_service_info() {
        let info = ServiceInfo::new(
            HAP_SERVICE_TYPE,
            "Homebridge 3A1F",
            "homebridge.local.",
            "192.168.1.20",
            51826,
            &[("id", "CC:22:3D:E3:CE:30"), ("md", "homebridge")][..],
        )
        .unwrap();

        let instance = HapInstance::from_service_info(&info);
        assert_eq!(instance.id, "CC:22:3D:E3:CE:30");
        assert_eq!(instance.name, "Homebridge 3A1F");
        assert_eq!(instance.host, "192.168.1.20");
        assert_eq!(instance.port, 51826);
    }

    #[test]
    fn test_accessories_url() {
        let mut instance = HapInstance {
            fullname: "bridge._hap._tcp.local.".to_string(),
            id: "id".to_string(),
            name: "bridge".to_string(),
            host: "192.168.1.20".to_string(),
            port: 51826,
        };
        assert_eq!(
            instance.accessories_url(),
            "http://192.168.1.20:51826/accessories"
        );

        instance.host = "fe80::1".to_string();
        assert_eq!(instance.accessories_url(), "http://[fe80::1]:51826/accessories");
    }

    #[test]
    fn test_removal_matches_full_service_name() {
        let info = ServiceInfo::new(
            HAP_SERVICE_TYPE,
            "Kitchen Bridge v2.1",
            "kitchen.local.",
            "192.168.1.30",
            51827,
            &[("id", "0E:2C:51:AA:10:02")][..],
        )
        .unwrap();

        let instance = HapInstance::from_service_info(&info);
        assert_eq!(instance.name, "Kitchen Bridge v2.1");
        assert!(instance.is_named("Kitchen Bridge v2.1._hap._tcp.local."));
        assert!(!instance.is_named("Kitchen Bridge v2._hap._tcp.local."));
        assert!(!instance.is_named("Kitchen Bridge v2.1 (2)._hap._tcp.local."));
    }

    const LISTING_JSON: &str = r#"{"accessories":[{"aid":1,"services":[
        {"iid":1,"type":"3E","characteristics":[{"iid":2,"type":"23","value":"Bedroom"}]},
        {"iid":8,"type":"8A","characteristics":[{"iid":9,"type":"11","value":22.5}]}
    ]}]}"#;

    fn local_instance(port: u16) -> HapInstance {
        HapInstance {
            fullname: format!("bridge-{}._hap._tcp.local.", port),
            id: format!("bridge-{}", port),
            name: format!("bridge-{}", port),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Answers one request with `status` and `body`, handing back the raw request.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (HapInstance, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/hap+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        (local_instance(port), rx)
    }

    /// Accepts a connection and never answers it.
    async fn serve_nothing() -> HapInstance {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        local_instance(port)
    }

    #[tokio::test]
    async fn test_fetch_all_skips_failing_instance() {
        let (broken, _) = serve_once("500 Internal Server Error", "").await;
        let (bridge, request) = serve_once("200 OK", LISTING_JSON).await;
        let fetcher = AccessoryFetcher::new("031-45-154", Duration::from_secs(2)).unwrap();

        let directory = fetcher
            .fetch_all(&[broken, bridge.clone()])
            .await
            .unwrap();

        let entries: Vec<_> = directory.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, bridge.id);
        assert_eq!(entries[0].1.name.as_deref(), Some("Bedroom"));
        assert_eq!(entries[0].1.port, bridge.port);

        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /accessories"));
        assert!(request.contains("authorization: 031-45-154"));
    }

    #[tokio::test]
    async fn test_fetch_all_keeps_instance_order() {
        let (first, _) = serve_once("200 OK", LISTING_JSON).await;
        let (second, _) = serve_once("200 OK", LISTING_JSON).await;
        let fetcher = AccessoryFetcher::new("031-45-154", Duration::from_secs(2)).unwrap();

        let directory = fetcher
            .fetch_all(&[second.clone(), first.clone()])
            .await
            .unwrap();

        let ids: Vec<_> = directory.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_fetch_all_fails_when_every_instance_fails() {
        let (first, _) = serve_once("500 Internal Server Error", "").await;
        let (second, _) = serve_once("470 Connection Authorization Required", "").await;
        let fetcher = AccessoryFetcher::new("000-00-000", Duration::from_secs(2)).unwrap();

        let result = fetcher.fetch_all(&[first, second]).await;
        assert!(matches!(result, Err(DiscoveryError::Http(_))));
    }

    #[tokio::test]
    async fn test_fetch_all_with_no_instances_is_empty() {
        let fetcher = AccessoryFetcher::new("031-45-154", Duration::from_secs(2)).unwrap();
        assert!(fetcher.fetch_all(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_instance_does_not_delay_others() {
        let stalled = serve_nothing().await;
        let (bridge, _) = serve_once("200 OK", LISTING_JSON).await;
        let fetcher = AccessoryFetcher::new("031-45-154", Duration::from_secs(1)).unwrap();

        let start = std::time::Instant::now();
        let directory = fetcher.fetch_all(&[stalled, bridge.clone()]).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(3));
        let ids: Vec<_> = directory.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec![bridge.id]);
    }
}
