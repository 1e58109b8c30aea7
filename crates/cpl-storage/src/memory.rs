use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cpl_core::{EventRecord, TextTerm};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::{
    rank_in_memory, tickets_column, EventFilter, EventStore, IndexEntry, RankedEvent, StoreError, StoreResult,
    StoreTransaction, YearIndex,
};

type EventTable = BTreeMap<String, EventRecord>;

/// Process-local store. A transaction holds the write lock for its whole
/// lifetime, so reconciliations against one instance never interleave.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    table: Arc<RwLock<EventTable>>,
    batch_writes: Arc<AtomicUsize>,
    fail_on_batch: Arc<AtomicUsize>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds committed state directly, bypassing transactions.
    pub async fn with_events(events: impl IntoIterator<Item = EventRecord>) -> Self {
        let store = Self::new();
        {
            let mut table = store.table.write().await;
            for event in events {
                table.insert(event.id.clone(), event);
            }
        }
        store
    }

    /// Makes the `nth` batch write from now on (1-based) fail as if the
    /// backing store went away.
    pub fn fail_on_batch(&self, nth: usize) {
        let already = self.batch_writes.load(Ordering::SeqCst);
        self.fail_on_batch.store(already + nth, Ordering::SeqCst);
    }

    /// Number of batch write calls seen so far, including failed ones.
    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> EventTable {
        self.table.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<EventRecord> {
        self.table.read().await.get(id).cloned()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.table).write_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            batch_writes: Arc::clone(&self.batch_writes),
            fail_on_batch: Arc::clone(&self.fail_on_batch),
        }))
    }

    async fn load_events(&self, filter: &EventFilter) -> StoreResult<Vec<EventRecord>> {
        let table = self.table.read().await;
        let mut events: Vec<EventRecord> = table
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn rank_events(&self, year: i32, terms: &[TextTerm]) -> StoreResult<Vec<RankedEvent>> {
        let events = self.load_events(&EventFilter::active(year)).await?;
        Ok(events
            .into_iter()
            .filter_map(|event| {
                rank_in_memory(&event, terms).map(|(title_rank, search_rank)| RankedEvent {
                    event,
                    title_rank,
                    search_rank,
                })
            })
            .collect())
    }
}

struct MemoryTransaction {
    guard: OwnedRwLockWriteGuard<EventTable>,
    working: EventTable,
    batch_writes: Arc<AtomicUsize>,
    fail_on_batch: Arc<AtomicUsize>,
}

impl MemoryTransaction {
    fn count_batch(&self) -> StoreResult<()> {
        let seen = self.batch_writes.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == self.fail_on_batch.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on batch write {seen}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn read_year_index(&mut self, year: i32) -> StoreResult<YearIndex> {
        Ok(self
            .working
            .values()
            .filter(|event| event.year == year)
            .map(|event| {
                (
                    event.id.clone(),
                    IndexEntry {
                        active: event.active,
                        last_modified: event.last_modified,
                    },
                )
            })
            .collect())
    }

    async fn batch_insert(&mut self, records: &[EventRecord]) -> StoreResult<()> {
        self.count_batch()?;
        if let Some(existing) = records.iter().find(|r| self.working.contains_key(&r.id)) {
            return Err(StoreError::DuplicateId(existing.id.clone()));
        }
        for record in records {
            tickets_column(record)?;
        }
        for record in records {
            self.working.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn batch_update(&mut self, records: &[EventRecord]) -> StoreResult<()> {
        self.count_batch()?;
        if let Some(missing) = records.iter().find(|r| !self.working.contains_key(&r.id)) {
            return Err(StoreError::UnknownId(missing.id.clone()));
        }
        for record in records {
            tickets_column(record)?;
        }
        for record in records {
            self.working.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn batch_deactivate(&mut self, ids: &[String]) -> StoreResult<()> {
        self.count_batch()?;
        for id in ids {
            if let Some(event) = self.working.get_mut(id) {
                event.active = false;
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!(staged = self.working.len(), "discarding in-memory transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn event(id: &str, title: &str, description: &str) -> EventRecord {
        let start: DateTime<Utc> = Utc.with_ymd_and_hms(2018, 8, 2, 14, 0, 0).single().expect("valid start");
        EventRecord {
            id: id.to_string(),
            category: "BGM".into(),
            year: 2018,
            active: true,
            title: title.to_string(),
            short_description: description.to_string(),
            long_description: String::new(),
            event_type: "BGM - Board Game".into(),
            game_system: String::new(),
            short_category: "BGM".into(),
            cluster_key: id.to_string(),
            start_time: start,
            duration_minutes: 60,
            end_time: start + Duration::minutes(60),
            location: String::new(),
            room_name: String::new(),
            table_number: String::new(),
            tickets_available: 4,
            last_modified: start,
        }
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let store = MemoryEventStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.batch_insert(&[event("BGM18000001", "Catan", "")]).await.expect("insert");
        tx.commit().await.expect("commit");

        let loaded = store
            .load_events(&EventFilter::active(2018))
            .await
            .expect("load events");
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.batch_writes(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryEventStore::with_events([event("BGM18000001", "Catan", "")]).await;
        {
            let mut tx = store.begin().await.expect("begin");
            tx.batch_deactivate(&["BGM18000001".to_string()])
                .await
                .expect("deactivate");
            tx.batch_insert(&[event("BGM18000002", "Azul", "")])
                .await
                .expect("insert");
        }
        let table = store.snapshot().await;
        assert_eq!(table.len(), 1);
        assert!(table["BGM18000001"].active);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_unavailable() {
        let store = MemoryEventStore::new();
        store.fail_on_batch(2);
        let mut tx = store.begin().await.expect("begin");
        tx.batch_insert(&[event("BGM18000001", "Catan", "")])
            .await
            .expect("first insert");
        let err = tx
            .batch_insert(&[event("BGM18000002", "Azul", "")])
            .await
            .expect_err("insert fails");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn insert_of_existing_id_is_rejected() {
        let store = MemoryEventStore::with_events([event("BGM18000001", "Catan", "")]).await;
        let mut tx = store.begin().await.expect("begin");
        let err = tx
            .batch_insert(&[event("BGM18000001", "Catan", "")])
            .await
            .expect_err("insert fails");
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "BGM18000001"));
    }

    #[tokio::test]
    async fn ticket_counts_beyond_the_column_are_rejected() {
        let store = MemoryEventStore::with_events([event("BGM18000001", "Catan", "")]).await;
        let mut flooded = event("BGM18000002", "Azul", "");
        flooded.tickets_available = u32::MAX;

        let mut tx = store.begin().await.expect("begin");
        let err = tx
            .batch_insert(&[event("BGM18000003", "Root", ""), flooded])
            .await
            .expect_err("insert fails");
        assert!(matches!(
            err,
            StoreError::TicketsOutOfRange { ref id, tickets } if id == "BGM18000002" && tickets == u32::MAX
        ));

        let mut flooded = event("BGM18000001", "Catan", "");
        flooded.tickets_available = i32::MAX as u32 + 1;
        let err = tx.batch_update(&[flooded]).await.expect_err("update fails");
        assert!(matches!(err, StoreError::TicketsOutOfRange { .. }));
        tx.commit().await.expect("commit");

        let table = store.snapshot().await;
        assert_eq!(table.len(), 1);
        assert_eq!(table["BGM18000001"].tickets_available, 4);
    }

    #[tokio::test]
    async fn ranking_honours_negation_and_title_hits() {
        let store = MemoryEventStore::with_events([
            event("BGM18000001", "Dragon Quest", "slay the dragon"),
            event("BGM18000002", "Space Opera", "dragons in space"),
            event("BGM18000003", "Farm Life", "tractors"),
        ])
        .await;

        let ranked = store
            .rank_events(2018, &[TextTerm::from_sanitized("dragon")])
            .await
            .expect("rank events");
        assert_eq!(ranked.len(), 2);
        let quest = ranked.iter().find(|r| r.event.id == "BGM18000001").expect("quest ranked");
        let opera = ranked.iter().find(|r| r.event.id == "BGM18000002").expect("opera ranked");
        assert_eq!(quest.title_rank, 1.0);
        assert_eq!(opera.title_rank, 0.0);

        let ranked = store
            .rank_events(
                2018,
                &[
                    TextTerm::from_sanitized("!dragon"),
                    TextTerm::from_sanitized("space opera"),
                ],
            )
            .await
            .expect("rank events");
        assert!(ranked.is_empty());

        let everything = store.rank_events(2018, &[]).await.expect("rank events");
        assert_eq!(everything.len(), 3);
        assert!(everything.iter().all(|r| r.title_rank == 1.0 && r.search_rank == 1.0));
    }
}
