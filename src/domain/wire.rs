use crate::domain::{NotificationInput, NotificationKind};
use serde::Deserialize;
use serde_json::Value;

pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_PRICE_ALERT: &str = "price_alert";
pub const EVENT_AVAILABLE: &str = "event_available";

/// One server-pushed frame:
///   { "event": <name>, "data": { ... }, "id"?: <string> }
///
/// `id` is the stable server-assigned dedup key when the backend provides
/// one. Without it the store synthesizes a local counter id, and redelivery
/// after a reconnect is not deduplicated.
#[derive(Debug, Deserialize)]
pub struct WireFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub id: Option<String>,
}

/// Parse a text frame. Non-JSON or envelope-shaped-wrong input yields `None`;
/// the caller counts the drop.
pub fn parse_frame(text: &str) -> Option<WireFrame> {
    serde_json::from_str(text).ok()
}

#[derive(Debug, Deserialize)]
struct GenericEnvelope {
    #[serde(default)]
    id: Option<String>,
    kind: String,
    title: String,
    message: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    read: bool,
}

// Only the fields the synthesized message needs; the full data object rides
// along as the payload.
#[derive(Debug, Deserialize)]
struct PriceAlertData {
    event_name: String,
    new_price: f64,
}

#[derive(Debug, Deserialize)]
struct EventAvailableData {
    name: String,
}

/// Translate one recognized frame into exactly one ingest candidate.
/// Unrecognized event names and mismatched data shapes yield `None` and are
/// never an error.
pub fn normalize_frame(frame: WireFrame) -> Option<NotificationInput> {
    match frame.event.as_str() {
        EVENT_NOTIFICATION => {
            let envelope: GenericEnvelope = serde_json::from_value(frame.data).ok()?;
            Some(NotificationInput {
                id: frame.id.or(envelope.id),
                kind: NotificationKind::parse(&envelope.kind),
                title: envelope.title,
                message: envelope.message,
                payload: envelope.payload,
                read: envelope.read,
            })
        }
        EVENT_PRICE_ALERT => {
            let alert: PriceAlertData = serde_json::from_value(frame.data.clone()).ok()?;
            Some(NotificationInput {
                id: frame.id,
                kind: NotificationKind::PriceAlert,
                title: "Price Drop Alert!".to_string(),
                message: format!(
                    "{} tickets dropped to ${}",
                    alert.event_name, alert.new_price
                ),
                payload: frame.data,
                read: false,
            })
        }
        EVENT_AVAILABLE => {
            let event: EventAvailableData = serde_json::from_value(frame.data.clone()).ok()?;
            Some(NotificationInput {
                id: frame.id,
                kind: NotificationKind::EventAvailable,
                title: "New Event Available!".to_string(),
                message: format!("{} tickets are now available", event.name),
                payload: frame.data,
                read: false,
            })
        }
        _ => None,
    }
}
