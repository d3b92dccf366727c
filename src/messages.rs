/// Notifications broadcast by an accessory-protocol client to its subscribers.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The directory can be requested. Repeats on every refresh.
    Ready,
    /// Unsolicited protocol traffic; informational only.
    Hap(serde_json::Value),
}
