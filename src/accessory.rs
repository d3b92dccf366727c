//! Snapshot of the accessories exposed on the HAP bus.
//!
//! The wire structs mirror the JSON body of `GET /accessories`; the public
//! structs are the flattened view discovery walks over.

use serde_derive::Deserialize;

/// Characteristic type `23` (`Name`), used to label accessories.
const NAME_TYPES: [&str; 3] = ["23", "Name", "00000023-0000-1000-8000-0026BB765291"];

#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub aid: u64,
    pub iid: u64,
    pub type_tag: String,
    pub description: Option<String>,
    /// `None` when the reported value is missing or not a number.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub iid: u64,
    pub type_tag: String,
    pub characteristics: Vec<Characteristic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accessory {
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub services: Vec<Service>,
}

/// Device identifier to accessory, kept in the order the client reported them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessoryDirectory {
    entries: Vec<(String, Accessory)>,
}

impl AccessoryDirectory {
    pub fn new() -> Self {
        AccessoryDirectory::default()
    }

    pub fn insert(&mut self, device_id: impl Into<String>, accessory: Accessory) {
        self.entries.push((device_id.into(), accessory));
    }

    pub fn extend(&mut self, other: AccessoryDirectory) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Accessory)> {
        self.entries.iter().map(|(id, acc)| (id.as_str(), acc))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Deserialize, Debug)]
pub struct HapAccessories {
    pub accessories: Vec<HapAccessory>,
}

#[derive(Deserialize, Debug)]
pub struct HapAccessory {
    pub aid: u64,
    #[serde(default)]
    pub services: Vec<HapService>,
}

#[derive(Deserialize, Debug)]
pub struct HapService {
    pub iid: u64,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub characteristics: Vec<HapCharacteristic>,
}

#[derive(Deserialize, Debug)]
pub struct HapCharacteristic {
    pub iid: u64,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    pub description: Option<String>,
}

impl HapAccessories {
    /// Builds directory entries for one HAP instance.
    ///
    /// The primary accessory (aid 1) is keyed by the instance id, bridged
    /// accessories by `{instance_id}/{aid}`.
    pub fn into_directory(self, instance_id: &str, host: &str, port: u16) -> AccessoryDirectory {
        let mut directory = AccessoryDirectory::new();
        for accessory in self.accessories {
            let device_id = if accessory.aid == 1 {
                instance_id.to_string()
            } else {
                format!("{}/{}", instance_id, accessory.aid)
            };

            let name = accessory
                .services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .find(|c| is_name_type(&c.type_tag))
                .and_then(|c| c.value.as_ref())
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);

            let aid = accessory.aid;
            let services = accessory
                .services
                .into_iter()
                .map(|service| Service {
                    iid: service.iid,
                    type_tag: service.type_tag,
                    characteristics: service
                        .characteristics
                        .into_iter()
                        .map(|c| Characteristic {
                            aid,
                            iid: c.iid,
                            type_tag: c.type_tag,
                            description: c.description,
                            value: c.value.as_ref().and_then(serde_json::Value::as_f64),
                        })
                        .collect(),
                })
                .collect();

            directory.insert(
                device_id,
                Accessory {
                    name,
                    host: host.to_string(),
                    port,
                    services,
                },
            );
        }
        directory
    }
}

fn is_name_type(type_tag: &str) -> bool {
    NAME_TYPES.iter().any(|t| t.eq_ignore_ascii_case(type_tag))
}
