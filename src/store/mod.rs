use crate::domain::{IngestResult, Notification, NotificationInput, QueryFilter, SortOrder};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;

/// Receives each newly inserted unread notification, exactly once.
/// Implemented by the permission gate; tests plug in counting sinks.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, notification: &Notification);
}

/// Ordered, deduplicated, read-state-tracked collection of notifications.
///
/// Entries are kept newest-first: ingestion prepends, so enumeration order is
/// newest `created_at` first with ties broken by most-recent insertion. The
/// struct holds no lock of its own; see [`SharedStore`] for cross-task use.
pub struct NotificationStore {
    entries: Vec<Notification>,
    unread: usize,
    next_local_id: u64,
    sink: Option<Arc<dyn DeliverySink>>,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            unread: 0,
            next_local_id: 0,
            sink: None,
        }
    }

    pub fn with_sink(sink: Arc<dyn DeliverySink>) -> Self {
        let mut store = Self::new();
        store.sink = Some(sink);
        store
    }

    /// Ingest one candidate. Dedup is keyed on id: first arrival wins and
    /// later duplicates leave the stored entry (including its read state)
    /// untouched. Candidates without an id get a locally synthesized one,
    /// unique within this store.
    pub fn ingest(&mut self, input: NotificationInput) -> IngestResult {
        let (result, pending) = self.ingest_deferred(input);
        if let (Some(notification), Some(sink)) = (pending, &self.sink) {
            sink.deliver(&notification);
        }
        result
    }

    /// `ingest` with sink delivery left to the caller: the second element is
    /// the notification to deliver, if any. Lets [`SharedStore`] run the sink
    /// outside its lock scope.
    fn ingest_deferred(
        &mut self,
        input: NotificationInput,
    ) -> (IngestResult, Option<Notification>) {
        let id = match input.id {
            Some(id) => id,
            // A caller-supplied id may have claimed an earlier counter value;
            // skip past it. An id-less candidate is never a duplicate.
            None => loop {
                self.next_local_id += 1;
                let candidate = format!("local-{}", self.next_local_id);
                if !self.entries.iter().any(|entry| entry.id == candidate) {
                    break candidate;
                }
            },
        };

        if self.entries.iter().any(|entry| entry.id == id) {
            return (IngestResult::DuplicateIgnored, None);
        }

        let notification = Notification {
            id,
            kind: input.kind,
            title: input.title,
            message: input.message,
            payload: input.payload,
            created_at: OffsetDateTime::now_utc(),
            read: input.read,
        };

        let mut pending = None;
        if !notification.read {
            self.unread += 1;
            if self.sink.is_some() {
                pending = Some(notification.clone());
            }
        }
        self.entries.insert(0, notification);
        (IngestResult::Inserted, pending)
    }

    /// Flip one entry to read. Returns false (and changes nothing) when the
    /// id is absent or the entry is already read.
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) else {
            return false;
        };
        if entry.read {
            return false;
        }
        entry.read = true;
        self.unread -= 1;
        true
    }

    /// Idempotent: unread count is 0 afterwards no matter the prior state.
    pub fn mark_all_read(&mut self) {
        for entry in &mut self.entries {
            entry.read = true;
        }
        self.unread = 0;
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let Some(index) = self.entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let removed = self.entries.remove(index);
        if !removed.read {
            self.unread -= 1;
        }
        true
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.unread = 0;
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot query: re-evaluated against current state on each call, never
    /// a live cursor, never mutates read state.
    pub fn query(&self, filter: QueryFilter, sort: SortOrder) -> Vec<Notification> {
        let matched = self
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned();
        match sort {
            SortOrder::Newest => matched.collect(),
            SortOrder::Oldest => {
                let mut out = matched.collect::<Vec<_>>();
                out.reverse();
                out
            }
        }
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle sharing one store between the channel task and consumers.
///
/// Every operation is a single lock scope and nothing awaits while holding
/// the guard, so no caller ever observes a half-applied mutation.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<NotificationStore>>,
}

impl SharedStore {
    pub fn new(store: NotificationStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut NotificationStore) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn ingest(&self, input: NotificationInput) -> IngestResult {
        let (result, pending) = self.with(|store| {
            let (result, pending) = store.ingest_deferred(input);
            let pending = pending.map(|notification| (store.sink.clone(), notification));
            (result, pending)
        });
        // Delivery can be slow (platform notifier); it runs after the lock is
        // released so concurrent store operations never stall behind it.
        if let Some((Some(sink), notification)) = pending {
            sink.deliver(&notification);
        }
        result
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.with(|store| store.mark_read(id))
    }

    pub fn mark_all_read(&self) {
        self.with(NotificationStore::mark_all_read);
    }

    pub fn delete(&self, id: &str) -> bool {
        self.with(|store| store.delete(id))
    }

    pub fn clear_all(&self) {
        self.with(NotificationStore::clear_all);
    }

    pub fn unread_count(&self) -> usize {
        self.with(|store| store.unread_count())
    }

    pub fn len(&self) -> usize {
        self.with(|store| store.len())
    }

    pub fn query(&self, filter: QueryFilter, sort: SortOrder) -> Vec<Notification> {
        self.with(|store| store.query(filter, sort))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NotificationKind;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn input(id: Option<&str>, kind: NotificationKind) -> NotificationInput {
        NotificationInput {
            id: id.map(str::to_string),
            kind,
            title: "title".to_string(),
            message: "message".to_string(),
            payload: Value::Null,
            read: false,
        }
    }

    fn recount_unread(store: &NotificationStore) -> usize {
        store
            .query(QueryFilter::All, SortOrder::Newest)
            .iter()
            .filter(|entry| !entry.read)
            .count()
    }

    struct CountingSink(AtomicUsize);

    impl DeliverySink for CountingSink {
        fn deliver(&self, _notification: &Notification) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_ingest_is_idempotent() {
        let mut store = NotificationStore::new();
        assert_eq!(
            store.ingest(input(Some("x"), NotificationKind::PriceAlert)),
            IngestResult::Inserted
        );
        assert_eq!(
            store.ingest(input(Some("x"), NotificationKind::PriceAlert)),
            IngestResult::DuplicateIgnored
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn duplicate_does_not_resurrect_read_state() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("x"), NotificationKind::System));
        assert!(store.mark_read("x"));
        assert_eq!(
            store.ingest(input(Some("x"), NotificationKind::System)),
            IngestResult::DuplicateIgnored
        );
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn unread_count_matches_recount_after_mixed_operations() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        store.ingest(input(Some("b"), NotificationKind::EventAvailable));
        store.ingest(input(Some("c"), NotificationKind::System));
        store.ingest(input(None, NotificationKind::Other));
        assert_eq!(store.unread_count(), recount_unread(&store));

        store.mark_read("b");
        assert_eq!(store.unread_count(), recount_unread(&store));

        store.delete("a");
        assert_eq!(store.unread_count(), recount_unread(&store));

        // Deleting an already-read entry must not touch the counter.
        store.delete("b");
        assert_eq!(store.unread_count(), recount_unread(&store));

        store.mark_all_read();
        assert_eq!(store.unread_count(), 0);
        assert_eq!(store.unread_count(), recount_unread(&store));

        store.clear_all();
        assert_eq!(store.unread_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn mark_all_read_twice_is_idempotent() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        store.ingest(input(Some("b"), NotificationKind::System));
        store.mark_all_read();
        assert_eq!(store.unread_count(), 0);
        store.mark_all_read();
        assert_eq!(store.unread_count(), 0);
        assert!(
            store
                .query(QueryFilter::All, SortOrder::Newest)
                .iter()
                .all(|entry| entry.read)
        );
    }

    #[test]
    fn absent_id_operations_are_no_ops() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("a"), NotificationKind::System));
        assert!(!store.mark_read("missing"));
        assert!(!store.delete("missing"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(), 1);

        // Already-read is also a no-op, not an error.
        assert!(store.mark_read("a"));
        assert!(!store.mark_read("a"));
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn query_returns_newest_first_with_insertion_tiebreak() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("t1"), NotificationKind::PriceAlert));
        store.ingest(input(Some("t2"), NotificationKind::PriceAlert));
        store.ingest(input(Some("t3"), NotificationKind::PriceAlert));

        let newest = store.query(QueryFilter::All, SortOrder::Newest);
        let ids = newest.iter().map(|n| n.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["t3", "t2", "t1"]);

        let oldest = store.query(QueryFilter::All, SortOrder::Oldest);
        let ids = oldest.iter().map(|n| n.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn query_filters_by_kind_and_unread() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        store.ingest(input(Some("b"), NotificationKind::System));
        store.mark_read("a");

        let unread = store.query(QueryFilter::Unread, SortOrder::Newest);
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "b");

        let alerts = store.query(
            QueryFilter::ByKind(NotificationKind::PriceAlert),
            SortOrder::Newest,
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, "a");

        // Querying never flips read flags.
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn deleted_id_never_reappears_in_queries() {
        let mut store = NotificationStore::new();
        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        store.ingest(input(Some("b"), NotificationKind::System));
        assert!(store.delete("a"));
        for filter in [
            QueryFilter::All,
            QueryFilter::Unread,
            QueryFilter::ByKind(NotificationKind::PriceAlert),
        ] {
            assert!(
                store
                    .query(filter, SortOrder::Newest)
                    .iter()
                    .all(|entry| entry.id != "a")
            );
        }
        // Delete-after-delete must not throw or decrement anything.
        assert!(!store.delete("a"));
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn synthesized_ids_are_unique_within_the_store() {
        let mut store = NotificationStore::new();
        store.ingest(input(None, NotificationKind::Other));
        store.ingest(input(None, NotificationKind::Other));
        let ids = store
            .query(QueryFilter::All, SortOrder::Newest)
            .iter()
            .map(|entry| entry.id.clone())
            .collect::<Vec<_>>();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn sink_fires_exactly_once_per_unread_insert() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let mut store = NotificationStore::with_sink(sink.clone());

        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        // Duplicate: no delivery.
        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        // Already-read candidate: inserted but not delivered.
        let mut read_input = input(Some("b"), NotificationKind::System);
        read_input.read = true;
        assert_eq!(store.ingest(read_input), IngestResult::Inserted);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn synthesized_id_skips_a_colliding_wire_id() {
        let mut store = NotificationStore::new();
        // The wire happens to hand out an id shaped like a counter id.
        assert_eq!(
            store.ingest(input(Some("local-1"), NotificationKind::System)),
            IngestResult::Inserted
        );
        assert_eq!(
            store.ingest(input(None, NotificationKind::Other)),
            IngestResult::Inserted
        );
        assert_eq!(store.len(), 2);
        assert_eq!(store.unread_count(), 2);
        let ids = store
            .query(QueryFilter::All, SortOrder::Newest)
            .iter()
            .map(|entry| entry.id.clone())
            .collect::<Vec<_>>();
        assert_ne!(ids[0], ids[1]);
    }

    /// Reads the store back through the shared handle from inside `deliver`.
    /// Deadlocks if delivery ever runs while the store lock is held.
    struct ReentrantSink {
        store: Mutex<Option<SharedStore>>,
        observed_unread: AtomicUsize,
    }

    impl DeliverySink for ReentrantSink {
        fn deliver(&self, _notification: &Notification) {
            let guard = self.store.lock().expect("store slot");
            if let Some(store) = guard.as_ref() {
                self.observed_unread
                    .store(store.unread_count(), Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn shared_store_delivery_runs_outside_the_lock() {
        let sink = Arc::new(ReentrantSink {
            store: Mutex::new(None),
            observed_unread: AtomicUsize::new(usize::MAX),
        });
        let store = SharedStore::new(NotificationStore::with_sink(sink.clone()));
        *sink.store.lock().expect("store slot") = Some(store.clone());

        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        assert_eq!(sink.observed_unread.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_store_operations_round_trip() {
        let store = SharedStore::new(NotificationStore::new());
        store.ingest(input(Some("a"), NotificationKind::PriceAlert));
        store.ingest(input(Some("b"), NotificationKind::System));
        assert_eq!(store.len(), 2);
        assert_eq!(store.unread_count(), 2);
        assert!(store.mark_read("a"));
        assert_eq!(store.unread_count(), 1);
        store.mark_all_read();
        assert_eq!(store.unread_count(), 0);
        assert!(store.delete("b"));
        store.clear_all();
        assert_eq!(store.len(), 0);
    }
}
