use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use cpl_core::{ConventionCalendar, ConventionDay, EventRecord, GroupKey, ParsedQuery};
use cpl_storage::{EventFilter, EventStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Every session sharing a cluster key, category and title, with ticket
/// availability per convention day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    pub representative_id: String,
    pub name: String,
    pub description: String,
    pub short_category: String,
    pub game_system: String,
    pub session_count: u32,
    pub total_tickets: u64,
    pub wed_tickets: u64,
    pub thu_tickets: u64,
    pub fri_tickets: u64,
    pub sat_tickets: u64,
    pub sun_tickets: u64,
    pub title_rank: f32,
    pub search_rank: f32,
}

impl EventGroup {
    fn seed(record: &EventRecord, title_rank: f32, search_rank: f32) -> Self {
        Self {
            representative_id: record.id.clone(),
            name: record.title.clone(),
            description: record.short_description.clone(),
            short_category: record.short_category.clone(),
            game_system: record.game_system.clone(),
            session_count: 0,
            total_tickets: 0,
            wed_tickets: 0,
            thu_tickets: 0,
            fri_tickets: 0,
            sat_tickets: 0,
            sun_tickets: 0,
            title_rank,
            search_rank,
        }
    }

    fn represent(&mut self, record: &EventRecord) {
        self.representative_id = record.id.clone();
        self.description = record.short_description.clone();
        self.game_system = record.game_system.clone();
    }

    fn add_session(&mut self, day: ConventionDay, tickets: u32) {
        let tickets = u64::from(tickets);
        self.session_count += 1;
        self.total_tickets += tickets;
        let slot = match day {
            ConventionDay::Wed => &mut self.wed_tickets,
            ConventionDay::Thu => &mut self.thu_tickets,
            ConventionDay::Fri => &mut self.fri_tickets,
            ConventionDay::Sat => &mut self.sat_tickets,
            ConventionDay::Sun => &mut self.sun_tickets,
        };
        *slot += tickets;
    }

    pub fn tickets_on(&self, day: ConventionDay) -> u64 {
        match day {
            ConventionDay::Wed => self.wed_tickets,
            ConventionDay::Thu => self.thu_tickets,
            ConventionDay::Fri => self.fri_tickets,
            ConventionDay::Sat => self.sat_tickets,
            ConventionDay::Sun => self.sun_tickets,
        }
    }

    pub fn has_tickets(&self) -> bool {
        self.total_tickets > 0
    }
}

/// Aggregates members by group key. Members starting outside the convention
/// days, or on a day not in `days`, do not contribute. An empty `days` allows
/// every convention day. Ranks are the minimum over contributing members.
pub(crate) fn aggregate<'a, I>(
    members: I,
    calendar: &ConventionCalendar,
    days: &BTreeSet<ConventionDay>,
) -> Vec<EventGroup>
where
    I: IntoIterator<Item = (&'a EventRecord, f32, f32)>,
{
    let mut groups: BTreeMap<GroupKey, (DateTime<Utc>, EventGroup)> = BTreeMap::new();
    for (record, title_rank, search_rank) in members {
        let Some(day) = calendar.day_of(record.start_time) else {
            debug!(id = %record.id, "session outside the convention days");
            continue;
        };
        if !days.is_empty() && !days.contains(&day) {
            continue;
        }

        match groups.entry(record.group_key()) {
            Entry::Vacant(slot) => {
                let (_, group) =
                    slot.insert((record.start_time, EventGroup::seed(record, title_rank, search_rank)));
                group.add_session(day, record.tickets_available);
            }
            Entry::Occupied(mut slot) => {
                let (earliest, group) = slot.get_mut();
                let earlier = (record.start_time, record.id.as_str())
                    < (*earliest, group.representative_id.as_str());
                if earlier {
                    *earliest = record.start_time;
                    group.represent(record);
                }
                group.title_rank = group.title_rank.min(title_rank);
                group.search_rank = group.search_rank.min(search_rank);
                group.add_session(day, record.tickets_available);
            }
        }
    }
    groups.into_values().map(|(_, group)| group).collect()
}

fn browse_order(a: &EventGroup, b: &EventGroup) -> Ordering {
    b.has_tickets()
        .cmp(&a.has_tickets())
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.representative_id.cmp(&b.representative_id))
}

fn relevance_order(a: &EventGroup, b: &EventGroup) -> Ordering {
    b.title_rank
        .total_cmp(&a.title_rank)
        .then_with(|| b.search_rank.total_cmp(&a.search_rank))
        .then_with(|| b.total_tickets.cmp(&a.total_tickets))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.representative_id.cmp(&b.representative_id))
}

/// Groups the active records of `short_category` in `year`. Groups with
/// tickets left sort first, then by title.
pub fn build_event_groups(
    records: &[EventRecord],
    short_category: &str,
    year: i32,
    days: &BTreeSet<ConventionDay>,
    calendar: &ConventionCalendar,
) -> Vec<EventGroup> {
    let members = records
        .iter()
        .filter(|r| r.active && r.year == year && r.short_category == short_category)
        .map(|r| (r, 1.0, 1.0));
    let mut groups = aggregate(members, calendar, days);
    groups.sort_by(browse_order);
    groups
}

pub async fn load_event_groups(
    store: &dyn EventStore,
    short_category: &str,
    year: i32,
    days: &BTreeSet<ConventionDay>,
    calendar: &ConventionCalendar,
) -> StoreResult<Vec<EventGroup>> {
    let records = store
        .load_events(&EventFilter::active(year).in_category(short_category))
        .await?;
    let groups = build_event_groups(&records, short_category, year, days, calendar);
    info!(
        category = short_category,
        year,
        sessions = records.len(),
        groups = groups.len(),
        "built event groups"
    );
    Ok(groups)
}

/// Runs `query` against the store's ranked retrieval, applies the hour and
/// day filters and returns the matching groups, most relevant first.
pub async fn search_groups(
    store: &dyn EventStore,
    query: &ParsedQuery,
    calendar: &ConventionCalendar,
) -> StoreResult<Vec<EventGroup>> {
    let ranked = store.rank_events(query.year, &query.text_terms()).await?;
    let matched = ranked.len();

    let members = ranked
        .iter()
        .filter(|r| {
            query.accepts_hours(
                calendar.local_hour(r.event.start_time),
                calendar.local_hour(r.event.end_time),
            )
        })
        .map(|r| (&r.event, r.title_rank, r.search_rank));
    let mut groups = aggregate(members, calendar, &BTreeSet::new());

    if !query.days.is_empty() {
        groups.retain(|g| query.days.iter().any(|day| g.tickets_on(*day) > 0));
    }
    groups.sort_by(relevance_order);

    info!(
        raw_query = %query.raw_query,
        year = query.year,
        matched,
        groups = groups.len(),
        "search complete"
    );
    Ok(groups)
}
