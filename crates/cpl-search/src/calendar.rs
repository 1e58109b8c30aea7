use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use cpl_core::{ConventionCalendar, ConventionDay, EventRecord, StaleReference};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Where presentation links for an event point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub catalog_base_url: String,
    pub planner_base_path: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            catalog_base_url: "https://www.gencon.com/events".to_string(),
            planner_base_path: "/event".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_base_url: std::env::var("CPL_CATALOG_BASE_URL")
                .unwrap_or(defaults.catalog_base_url),
            planner_base_path: std::env::var("CPL_PLANNER_BASE_PATH")
                .unwrap_or(defaults.planner_base_path),
        }
    }

    pub fn catalog_url(&self, record: &EventRecord) -> Option<String> {
        record.catalog_number().map(|number| {
            format!("{}/{}", self.catalog_base_url.trim_end_matches('/'), number)
        })
    }

    pub fn planner_path(&self, id: &str) -> String {
        format!("{}/{}", self.planner_base_path.trim_end_matches('/'), id)
    }
}

/// One block on a user's calendar: overlapping starred sessions of the same
/// event on the same day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEventCluster {
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub similar_count: u32,
    pub representative_id: String,
    pub short_category: String,
    pub short_description: String,
    pub catalog_url: Option<String>,
    pub planner_path: String,
}

impl CalendarEventCluster {
    fn open(record: &EventRecord, links: &LinkConfig) -> Self {
        Self {
            title: record.title.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            similar_count: 1,
            representative_id: record.id.clone(),
            short_category: record.short_category.clone(),
            short_description: record.short_description.clone(),
            catalog_url: links.catalog_url(record),
            planner_path: links.planner_path(&record.id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarMerge {
    pub clusters: Vec<CalendarEventCluster>,
    pub stale: Vec<StaleReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum DayBucket {
    Convention(ConventionDay),
    Off(NaiveDate),
}

/// Collapses the starred sessions into calendar blocks. Starred ids missing
/// from `loaded`, or loaded but inactive, are reported as stale.
pub fn merge_starred_events(
    starred_ids: &[String],
    loaded: &[EventRecord],
    calendar: &ConventionCalendar,
    links: &LinkConfig,
) -> CalendarMerge {
    let by_id: HashMap<&str, &EventRecord> = loaded.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut seen = HashSet::new();
    let mut stale = Vec::new();
    let mut buckets: BTreeMap<(DayBucket, &str), Vec<&EventRecord>> = BTreeMap::new();
    for id in starred_ids {
        if !seen.insert(id.as_str()) {
            continue;
        }
        match by_id.get(id.as_str()) {
            Some(&record) if record.active => {
                let day = match calendar.day_of(record.start_time) {
                    Some(day) => DayBucket::Convention(day),
                    None => DayBucket::Off(calendar.local_date(record.start_time)),
                };
                buckets
                    .entry((day, record.cluster_key.as_str()))
                    .or_default()
                    .push(record);
            }
            _ => {
                warn!(id = %id, "starred event no longer resolves to an active event");
                stale.push(StaleReference { id: id.clone() });
            }
        }
    }

    let mut clusters = Vec::new();
    for mut sessions in buckets.into_values() {
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        let mut sessions = sessions.into_iter();
        let Some(first) = sessions.next() else {
            continue;
        };
        let mut current = CalendarEventCluster::open(first, links);
        for record in sessions {
            if record.start_time > current.end_time {
                clusters.push(current);
                current = CalendarEventCluster::open(record, links);
            } else {
                current.end_time = current.end_time.max(record.end_time);
                current.similar_count += 1;
            }
        }
        clusters.push(current);
    }
    clusters.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.representative_id.cmp(&b.representative_id))
    });

    info!(
        starred = seen.len(),
        clusters = clusters.len(),
        stale = stale.len(),
        "merged starred events"
    );
    CalendarMerge { clusters, stale }
}
