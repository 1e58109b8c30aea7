use std::collections::BTreeSet;

use chrono::{Datelike, Utc};
use cpl_core::{ConventionDay, ParsedQuery};
use serde::{Deserialize, Serialize};

/// Operators of the ranked text search that user input may not inject.
const OPERATOR_CHARS: &[char] = &['&', '(', ')', '|'];
const FIELD_FILTER_CHARS: &[char] = &[':', '<', '>', '=', '~'];
const RESERVED_CHARS: &[char] = &['!', '<', '>', '=', '-', '~'];

/// Structured filters that come from the caller rather than the query text.
/// Hours are convention-local and inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub days: BTreeSet<ConventionDay>,
    pub start_before_hour: Option<u32>,
    pub start_after_hour: Option<u32>,
    pub end_before_hour: Option<u32>,
    pub end_after_hour: Option<u32>,
}

impl SearchFilters {
    pub fn apply_to(self, mut query: ParsedQuery) -> ParsedQuery {
        query.days = self.days;
        query.start_before_hour = self.start_before_hour;
        query.start_after_hour = self.start_after_hour;
        query.end_before_hour = self.end_before_hour;
        query.end_after_hour = self.end_after_hour;
        query
    }
}

/// Parses a search box entry, defaulting to the current year.
pub fn parse_query(raw: &str, year_param: Option<&str>) -> ParsedQuery {
    parse_query_with_default_year(raw, year_param, Utc::now().year())
}

/// Never fails: unusable input only yields fewer terms.
pub fn parse_query_with_default_year(
    raw: &str,
    year_param: Option<&str>,
    default_year: i32,
) -> ParsedQuery {
    let year = year_param
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(default_year);

    let stripped: String = raw.chars().filter(|c| !OPERATOR_CHARS.contains(c)).collect();
    let terms = tokenize(&stripped)
        .iter()
        .filter_map(|token| sanitize_token(token))
        .collect();

    ParsedQuery {
        raw_query: raw.to_string(),
        terms,
        year,
        days: BTreeSet::new(),
        start_before_hour: None,
        start_after_hour: None,
        end_before_hour: None,
        end_after_hour: None,
    }
}

/// Whitespace split where double quotes group words. An unterminated quote
/// runs to the end of the input.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn sanitize_token(token: &str) -> Option<String> {
    let body = token.trim_start_matches(|c: char| c == '-' || c == '!');
    let negated = body.len() != token.len();
    if body.contains(FIELD_FILTER_CHARS) {
        return None;
    }

    let cleaned: String = body.chars().filter(|c| !RESERVED_CHARS.contains(c)).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    Some(if negated {
        format!("!{cleaned}")
    } else {
        cleaned.to_string()
    })
}
