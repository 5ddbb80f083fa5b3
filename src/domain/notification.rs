use serde_json::Value;
use time::OffsetDateTime;

/// Closed-ish set of notification categories. Wire events carrying a kind
/// string outside this set collapse to `Other` instead of being rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotificationKind {
    PriceAlert,
    EventAvailable,
    System,
    Other,
}

impl NotificationKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "price_alert" => NotificationKind::PriceAlert,
            "event_available" => NotificationKind::EventAvailable,
            "system" => NotificationKind::System,
            _ => NotificationKind::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            NotificationKind::PriceAlert => "price_alert",
            NotificationKind::EventAvailable => "event_available",
            NotificationKind::System => "system",
            NotificationKind::Other => "other",
        }
    }
}

/// A stored notification. Owned exclusively by the store once ingested;
/// `read` only changes through store operations.
#[derive(Clone, Debug)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// Structured data carried from the source event. Opaque to the core.
    pub payload: Value,
    /// Ingestion time, not the server's event time.
    pub created_at: OffsetDateTime,
    pub read: bool,
}

/// Candidate produced by wire-event normalization, before the store assigns
/// an id (when the source supplied none) and an ingestion timestamp.
#[derive(Clone, Debug)]
pub struct NotificationInput {
    pub id: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub payload: Value,
    pub read: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestResult {
    Inserted,
    /// An entry with the same id already exists. First arrival wins; the
    /// existing entry (including its read state) is untouched.
    DuplicateIgnored,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryFilter {
    All,
    Unread,
    ByKind(NotificationKind),
}

impl QueryFilter {
    pub fn matches(self, notification: &Notification) -> bool {
        match self {
            QueryFilter::All => true,
            QueryFilter::Unread => !notification.read,
            QueryFilter::ByKind(kind) => notification.kind == kind,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortOrder {
    Newest,
    Oldest,
}
