//! Read side of the planner: event groups, calendar clusters, free-text query
//! parsing, ranked search and result partitioning.
//!
//! Everything here is stateless. Store access goes through
//! [`cpl_storage::EventStore`] and only ever reads committed state.

use cpl_core::IdentityError;
use cpl_storage::StoreError;
use thiserror::Error;

mod calendar;
mod groups;
mod lookup;
mod partition;
mod query;

pub use calendar::{merge_starred_events, CalendarEventCluster, CalendarMerge, LinkConfig};
pub use groups::{build_event_groups, load_event_groups, search_groups, EventGroup};
pub use lookup::{
    load_category_summary, lookup_event, summarize_categories, CategorySummary, EventLookup,
};
pub use partition::{
    by_category_name, by_game_system, category_display_name, partition, Partitioned,
};
pub use query::{parse_query, parse_query_with_default_year, SearchFilters};

pub const CRATE_NAME: &str = "cpl-search";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event {0} is not in the catalog")]
    UnknownEvent(String),
}
