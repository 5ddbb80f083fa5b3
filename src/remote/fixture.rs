use crate::domain::{EVENT_AVAILABLE, EVENT_PRICE_ALERT, WireFrame, normalize_frame};
use crate::session::SessionWatch;
use crate::store::SharedStore;
use serde_json::json;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

const FIXTURE_SHOWS: &[(&str, f64, f64)] = &[
    ("The Midnight Echoes", 80.0, 45.0),
    ("Harbor Lights Festival", 95.0, 62.5),
    ("Static Bloom", 55.0, 38.0),
    ("Copper Canyon Revival", 70.0, 49.0),
];

/// Stand-in event source for offline runs. Synthesizes wire frames on a timer
/// and feeds them through the same normalize/ingest path the live channel
/// uses, so everything downstream of the store behaves identically.
pub struct FixtureSource {
    store: SharedStore,
    session_rx: SessionWatch,
    interval: Duration,
    count: u64,
}

impl FixtureSource {
    pub fn new(store: SharedStore, session_rx: SessionWatch, interval: Duration, count: u64) -> Self {
        Self {
            store,
            session_rx,
            interval,
            count,
        }
    }

    /// Emit `count` events, then return. Logout stops emission early, same
    /// as it tears down the live channel.
    pub async fn run(mut self) {
        loop {
            if self.session_rx.borrow_and_update().is_some() {
                break;
            }
            if self.session_rx.changed().await.is_err() {
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut produced: u64 = 0;

        while produced < self.count {
            tokio::select! {
                biased;
                changed = self.session_rx.changed() => {
                    if changed.is_err() || self.session_rx.borrow().is_none() {
                        tracing::debug!(produced, "fixture source stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(input) = normalize_frame(synth_frame(produced)) {
                        let _ = self.store.ingest(input);
                    }
                    produced += 1;
                }
            }
        }
    }
}

fn synth_frame(seq: u64) -> WireFrame {
    let (name, old_price, new_price) = FIXTURE_SHOWS[(seq as usize / 2) % FIXTURE_SHOWS.len()];
    let (event, data) = if seq % 2 == 0 {
        (EVENT_AVAILABLE, json!({ "name": name }))
    } else {
        (
            EVENT_PRICE_ALERT,
            json!({
                "event_name": name,
                "new_price": new_price,
                "old_price": old_price,
            }),
        )
    };
    WireFrame {
        event: event.to_string(),
        data,
        id: Some(format!("demo-{seq}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NotificationKind, QueryFilter, SortOrder};
    use crate::session::{SessionHandle, SessionToken};
    use crate::store::NotificationStore;
    use std::collections::HashSet;

    #[tokio::test]
    async fn emits_the_requested_number_of_events_then_stops() {
        let store = SharedStore::new(NotificationStore::new());
        let (handle, session_rx) = SessionHandle::new();
        handle.login(SessionToken::new("demo"));

        let source = FixtureSource::new(store.clone(), session_rx, Duration::from_millis(1), 4);
        source.run().await;

        assert_eq!(store.len(), 4);
        assert_eq!(store.unread_count(), 4);
        let ids = store
            .query(QueryFilter::All, SortOrder::Newest)
            .iter()
            .map(|n| n.id.clone())
            .collect::<HashSet<_>>();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn alternates_availability_and_price_alerts() {
        let store = SharedStore::new(NotificationStore::new());
        let (handle, session_rx) = SessionHandle::new();
        handle.login(SessionToken::new("demo"));

        FixtureSource::new(store.clone(), session_rx, Duration::from_millis(1), 2)
            .run()
            .await;

        let entries = store.query(QueryFilter::All, SortOrder::Oldest);
        assert_eq!(entries[0].kind, NotificationKind::EventAvailable);
        assert_eq!(entries[1].kind, NotificationKind::PriceAlert);
    }

    #[tokio::test]
    async fn logout_stops_emission_early() {
        let store = SharedStore::new(NotificationStore::new());
        let (handle, session_rx) = SessionHandle::new();
        handle.login(SessionToken::new("demo"));

        let source = FixtureSource::new(
            store.clone(),
            session_rx,
            Duration::from_millis(20),
            10_000,
        );
        let task = tokio::spawn(source.run());

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.logout();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("source stops after logout")
            .expect("task completes");
        assert!(store.len() < 100);
    }
}
