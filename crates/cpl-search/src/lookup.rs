use std::collections::BTreeMap;

use cpl_core::{parse_identity, ConventionCalendar, ConventionDay, EventRecord};
use cpl_storage::{EventFilter, EventStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::SearchError;

/// An event together with every session of the same group in its year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLookup {
    pub main: EventRecord,
    pub events_per_day: BTreeMap<ConventionDay, Vec<EventRecord>>,
    pub total_tickets: u64,
    pub related_ids: Vec<String>,
}

/// Looks `id` up in its own year, inactive sessions included so that stale
/// links still resolve.
pub async fn lookup_event(
    store: &dyn EventStore,
    id: &str,
    calendar: &ConventionCalendar,
) -> Result<EventLookup, SearchError> {
    let identity = parse_identity(id)?;
    let records = store
        .load_events(&EventFilter::active(identity.year).including_inactive())
        .await?;

    let main = records
        .iter()
        .find(|r| r.id == id)
        .cloned()
        .ok_or_else(|| SearchError::UnknownEvent(id.to_string()))?;
    let key = main.group_key();

    let mut events_per_day: BTreeMap<ConventionDay, Vec<EventRecord>> = BTreeMap::new();
    let mut total_tickets = 0u64;
    let mut related_ids = Vec::new();
    for record in records.into_iter().filter(|r| r.group_key() == key) {
        total_tickets += u64::from(record.tickets_available);
        if record.id != main.id {
            related_ids.push(record.id.clone());
        }
        if let Some(day) = calendar.day_of(record.start_time) {
            events_per_day.entry(day).or_default().push(record);
        }
    }

    info!(id, related = related_ids.len(), "looked up event");
    Ok(EventLookup {
        main,
        events_per_day,
        total_tickets,
        related_ids,
    })
}

/// Active event count per event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub name: String,
    pub code: String,
    pub count: usize,
}

pub fn summarize_categories(records: &[EventRecord]) -> Vec<CategorySummary> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records.iter().filter(|r| r.active) {
        *counts.entry(record.event_type.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(name, count)| CategorySummary {
            name: name.to_string(),
            code: name.split_whitespace().next().unwrap_or_default().to_string(),
            count,
        })
        .collect()
}

pub async fn load_category_summary(
    store: &dyn EventStore,
    year: i32,
) -> StoreResult<Vec<CategorySummary>> {
    let records = store.load_events(&EventFilter::active(year)).await?;
    Ok(summarize_categories(&records))
}
