//! Core domain model for the convention event planner: event records, identity
//! parsing, convention days and the structured search request.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cpl-core";

/// Inclusive range of two-digit years the catalog is known to cover. Codes
/// outside it are treated as feed corruption.
pub const SUPPORTED_TWO_DIGIT_YEARS: std::ops::RangeInclusive<u32> = 15..=19;

/// Largest ticket count a stored event may carry; the database column is a
/// signed 32-bit integer.
pub const MAX_TICKETS_AVAILABLE: u32 = i32::MAX as u32;

pub const DEFAULT_TIME_ZONE: Tz = chrono_tz::America::Indiana::Indianapolis;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed event code {code:?}: no two-digit year after the category prefix")]
    MalformedIdentity { code: String },
    #[error("unsupported year {two_digit_year:02} in event code {code:?}")]
    UnsupportedYear { code: String, two_digit_year: u32 },
}

/// Stable identity derived from an event code such as `RPG18ND12345`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventIdentity {
    pub category: String,
    pub year: i32,
}

pub fn parse_identity(code: &str) -> Result<EventIdentity, IdentityError> {
    let year_and_id = code.trim_start_matches(char::is_alphabetic);
    let category = code.trim_end_matches(|c: char| c.is_ascii_digit());

    let mut digits = year_and_id.chars();
    let two_digit_year = match (
        digits.next().and_then(|c| c.to_digit(10)),
        digits.next().and_then(|c| c.to_digit(10)),
    ) {
        (Some(tens), Some(ones)) => tens * 10 + ones,
        _ => {
            return Err(IdentityError::MalformedIdentity {
                code: code.to_string(),
            })
        }
    };

    if !SUPPORTED_TWO_DIGIT_YEARS.contains(&two_digit_year) {
        return Err(IdentityError::UnsupportedYear {
            code: code.to_string(),
            two_digit_year,
        });
    }

    Ok(EventIdentity {
        category: category.to_string(),
        year: 2000 + two_digit_year as i32,
    })
}

/// One scheduled session as published by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub category: String,
    pub year: i32,
    pub active: bool,
    pub title: String,
    pub short_description: String,
    pub long_description: String,
    pub event_type: String,
    pub game_system: String,
    pub short_category: String,
    pub cluster_key: String,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub end_time: DateTime<Utc>,
    pub location: String,
    pub room_name: String,
    pub table_number: String,
    pub tickets_available: u32,
    pub last_modified: DateTime<Utc>,
}

impl EventRecord {
    /// Re-derives `category` and `year` from the id.
    pub fn stamp_identity(&mut self) -> Result<(), IdentityError> {
        let identity = parse_identity(&self.id)?;
        self.category = identity.category;
        self.year = identity.year;
        Ok(())
    }

    pub fn has_storable_ticket_count(&self) -> bool {
        self.tickets_available <= MAX_TICKETS_AVAILABLE
    }

    pub fn expected_end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn has_consistent_end_time(&self) -> bool {
        self.end_time == self.expected_end_time()
    }

    /// Number the public catalog uses for this event: the id without its
    /// category prefix and year digits.
    pub fn catalog_number(&self) -> Option<&str> {
        self.id
            .trim_start_matches(char::is_alphabetic)
            .get(2..)
            .filter(|rest| !rest.is_empty())
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            cluster_key: self.cluster_key.clone(),
            short_category: self.short_category.clone(),
            title: self.title.clone(),
        }
    }

    /// Concatenation of the fields free-text search runs against.
    pub fn search_text(&self) -> String {
        [
            self.title.as_str(),
            self.short_description.as_str(),
            self.long_description.as_str(),
            self.event_type.as_str(),
            self.game_system.as_str(),
            self.location.as_str(),
            self.room_name.as_str(),
        ]
        .iter()
        .filter(|part| !part.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Equality key recognizing repeated offerings of the same event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub cluster_key: String,
    pub short_category: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConventionDay {
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl ConventionDay {
    pub const ALL: [ConventionDay; 5] = [
        ConventionDay::Wed,
        ConventionDay::Thu,
        ConventionDay::Fri,
        ConventionDay::Sat,
        ConventionDay::Sun,
    ];

    pub fn from_weekday(weekday: Weekday) -> Option<Self> {
        match weekday {
            Weekday::Wed => Some(Self::Wed),
            Weekday::Thu => Some(Self::Thu),
            Weekday::Fri => Some(Self::Fri),
            Weekday::Sat => Some(Self::Sat),
            Weekday::Sun => Some(Self::Sun),
            Weekday::Mon | Weekday::Tue => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
            Self::Sun => "sun",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wed" | "wednesday" => Some(Self::Wed),
            "thu" | "thursday" => Some(Self::Thu),
            "fri" | "friday" => Some(Self::Fri),
            "sat" | "saturday" => Some(Self::Sat),
            "sun" | "sunday" => Some(Self::Sun),
            _ => None,
        }
    }

    /// Parses a comma separated list like `wed,Fri`. Unknown entries are ignored.
    pub fn parse_list(raw: &str) -> BTreeSet<Self> {
        raw.split(',').filter_map(Self::parse).collect()
    }
}

impl fmt::Display for ConventionDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),
}

/// Maps feed timestamps onto the convention's local days and hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConventionCalendar {
    pub time_zone: Tz,
}

impl Default for ConventionCalendar {
    fn default() -> Self {
        Self {
            time_zone: DEFAULT_TIME_ZONE,
        }
    }
}

impl ConventionCalendar {
    pub fn new(time_zone: Tz) -> Self {
        Self { time_zone }
    }

    pub fn from_name(name: &str) -> Result<Self, CalendarError> {
        name.trim()
            .parse::<Tz>()
            .map(Self::new)
            .map_err(|_| CalendarError::UnknownTimeZone(name.to_string()))
    }

    pub fn day_of(&self, at: DateTime<Utc>) -> Option<ConventionDay> {
        ConventionDay::from_weekday(at.with_timezone(&self.time_zone).weekday())
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.time_zone).date_naive()
    }

    pub fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        at.with_timezone(&self.time_zone).hour()
    }
}

/// A sanitized search term. Negated terms render with a leading `!`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextTerm {
    pub text: String,
    pub negated: bool,
}

impl TextTerm {
    pub fn from_sanitized(term: &str) -> Self {
        match term.strip_prefix('!') {
            Some(rest) => Self {
                text: rest.to_string(),
                negated: true,
            },
            None => Self {
                text: term.to_string(),
                negated: false,
            },
        }
    }

    pub fn to_sanitized(&self) -> String {
        if self.negated {
            format!("!{}", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// Normalized search request handed to the store's ranked retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub raw_query: String,
    pub terms: Vec<String>,
    pub year: i32,
    pub days: BTreeSet<ConventionDay>,
    pub start_before_hour: Option<u32>,
    pub start_after_hour: Option<u32>,
    pub end_before_hour: Option<u32>,
    pub end_after_hour: Option<u32>,
}

impl ParsedQuery {
    pub fn text_terms(&self) -> Vec<TextTerm> {
        self.terms
            .iter()
            .map(|term| TextTerm::from_sanitized(term))
            .collect()
    }

    /// Inclusive hour bounds, compared against convention-local hours.
    pub fn accepts_hours(&self, start_hour: u32, end_hour: u32) -> bool {
        self.start_before_hour.map_or(true, |h| start_hour <= h)
            && self.start_after_hour.map_or(true, |h| start_hour >= h)
            && self.end_before_hour.map_or(true, |h| end_hour <= h)
            && self.end_after_hour.map_or(true, |h| end_hour >= h)
    }
}

/// A starred or bookmarked id that no longer resolves to a loaded active record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleReference {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().expect("valid timestamp")
    }

    #[test]
    fn parses_category_and_year() {
        let identity = parse_identity("RPG18ND12345").expect("identity parses");
        assert_eq!(identity.category, "RPG18ND");
        assert_eq!(identity.year, 2018);

        let identity = parse_identity("BGM17123456").expect("identity parses");
        assert_eq!(identity.category, "BGM");
        assert_eq!(identity.year, 2017);
    }

    #[test]
    fn year_bounds_are_inclusive() {
        assert_eq!(parse_identity("BGM15000001").expect("lower bound parses").year, 2015);
        assert_eq!(parse_identity("BGM19000001").expect("upper bound parses").year, 2019);
        assert_eq!(
            parse_identity("BGM14000001"),
            Err(IdentityError::UnsupportedYear {
                code: "BGM14000001".into(),
                two_digit_year: 14
            })
        );
        assert!(matches!(
            parse_identity("BGM20000001"),
            Err(IdentityError::UnsupportedYear { two_digit_year: 20, .. })
        ));
    }

    #[test]
    fn malformed_codes_are_rejected() {
        for code in ["", "BGM", "BGM1", "BGM1x234", "BGM-18123"] {
            assert!(
                matches!(parse_identity(code), Err(IdentityError::MalformedIdentity { .. })),
                "{code} should be malformed"
            );
        }
    }

    #[test]
    fn identity_round_trips_for_generated_codes() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let letters = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        for _ in 0..500 {
            let prefix_len = rng.gen_range(1..=4);
            let category: String = (0..prefix_len)
                .map(|_| letters[rng.gen_range(0..letters.len())] as char)
                .collect();
            let two_digit: u32 = rng.gen_range(15..=19);
            let serial: u32 = rng.gen_range(0..1_000_000);
            let code = format!("{category}{two_digit:02}{serial:06}");

            let identity = parse_identity(&code).expect("generated code parses");
            assert_eq!(identity.category, category);
            assert_eq!(identity.year, 2000 + two_digit as i32);
        }
    }

    fn record(id: &str) -> EventRecord {
        let start = ts(2018, 8, 2, 14, 0);
        EventRecord {
            id: id.to_string(),
            category: String::new(),
            year: 0,
            active: true,
            title: "Dungeon Crawl".into(),
            short_description: "A crawl".into(),
            long_description: String::new(),
            event_type: "RPG - Role Playing Game".into(),
            game_system: "D&D".into(),
            short_category: "RPG".into(),
            cluster_key: "ck".into(),
            start_time: start,
            duration_minutes: 120,
            end_time: start + Duration::minutes(120),
            location: "ICC".into(),
            room_name: "Hall D".into(),
            table_number: "12".into(),
            tickets_available: 6,
            last_modified: ts(2018, 6, 1, 0, 0),
        }
    }

    #[test]
    fn stamping_sets_derived_fields_and_catalog_number() {
        let mut event = record("RPG18123456");
        event.stamp_identity().expect("stamp identity");
        assert_eq!(event.category, "RPG");
        assert_eq!(event.year, 2018);
        assert_eq!(event.catalog_number(), Some("123456"));
        assert!(event.has_consistent_end_time());

        event.end_time = event.end_time + Duration::minutes(1);
        assert!(!event.has_consistent_end_time());
    }

    #[test]
    fn ticket_counts_beyond_signed_range_are_not_storable() {
        let mut event = record("RPG18123456");
        event.tickets_available = MAX_TICKETS_AVAILABLE;
        assert!(event.has_storable_ticket_count());
        event.tickets_available = MAX_TICKETS_AVAILABLE + 1;
        assert!(!event.has_storable_ticket_count());
    }

    #[test]
    fn convention_days_follow_local_time() {
        let calendar = ConventionCalendar::default();
        // 2018-08-02 03:00 UTC is still Wednesday evening in Indianapolis.
        assert_eq!(calendar.day_of(ts(2018, 8, 2, 3, 0)), Some(ConventionDay::Wed));
        assert_eq!(calendar.day_of(ts(2018, 8, 2, 14, 0)), Some(ConventionDay::Thu));
        assert_eq!(calendar.day_of(ts(2018, 7, 30, 14, 0)), None);
        assert_eq!(calendar.local_hour(ts(2018, 8, 2, 14, 0)), 10);
    }

    #[test]
    fn day_lists_ignore_unknown_entries() {
        let days = ConventionDay::parse_list("wed, FRI,mon,,sunday");
        assert_eq!(
            days.into_iter().collect::<Vec<_>>(),
            vec![ConventionDay::Wed, ConventionDay::Fri, ConventionDay::Sun]
        );
    }

    #[test]
    fn unknown_time_zone_is_an_error() {
        assert!(ConventionCalendar::from_name("America/Chicago").is_ok());
        assert_eq!(
            ConventionCalendar::from_name("Mars/Olympus"),
            Err(CalendarError::UnknownTimeZone("Mars/Olympus".into()))
        );
    }

    #[test]
    fn hour_bounds_are_inclusive() {
        let query = ParsedQuery {
            raw_query: String::new(),
            terms: vec!["!dragon".into(), "space opera".into()],
            year: 2018,
            days: BTreeSet::new(),
            start_before_hour: Some(12),
            start_after_hour: Some(9),
            end_before_hour: None,
            end_after_hour: None,
        };
        assert!(query.accepts_hours(9, 23));
        assert!(query.accepts_hours(12, 14));
        assert!(!query.accepts_hours(13, 14));
        assert!(!query.accepts_hours(8, 10));

        let terms = query.text_terms();
        assert!(terms[0].negated);
        assert_eq!(terms[0].text, "dragon");
        assert_eq!(terms[1].to_sanitized(), "space opera");
    }
}
