use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::EventGroup;

/// Groups bucketed under a presentation key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partitioned {
    pub keys: Vec<String>,
    pub groups: BTreeMap<String, Vec<EventGroup>>,
}

/// Buckets `groups` by `key_fn`. Keys come back sorted and each bucket keeps
/// the input order.
pub fn partition<F>(groups: Vec<EventGroup>, key_fn: F) -> Partitioned
where
    F: Fn(&EventGroup) -> String,
{
    let mut buckets: BTreeMap<String, Vec<EventGroup>> = BTreeMap::new();
    for group in groups {
        buckets.entry(key_fn(&group)).or_default().push(group);
    }
    Partitioned {
        keys: buckets.keys().cloned().collect(),
        groups: buckets,
    }
}

pub fn by_game_system(group: &EventGroup) -> String {
    let system = group.game_system.trim();
    if system.is_empty() {
        "Unspecified".to_string()
    } else {
        system.to_string()
    }
}

pub fn by_category_name(group: &EventGroup) -> String {
    let code = group.short_category.trim();
    if code.is_empty() {
        return "Unknown".to_string();
    }
    category_display_name(code)
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string())
}

pub fn category_display_name(code: &str) -> Option<&'static str> {
    let name = match code {
        "ANI" => "Anime Activities",
        "BGM" => "Board Games",
        "CGM" => "Non-Collectable/Tradable Card Games",
        "EGM" => "Electronic Games",
        "ENT" => "Entertainment Events",
        "FLM" => "Film Fest",
        "HMN" => "Historical Miniatures",
        "KID" => "Kids Activities",
        "LRP" => "Larps",
        "MHE" => "Miniature Hobby Events",
        "NMN" => "Non-Historical Miniatures",
        "RPG" => "Role Playing Games",
        "RPGA" => "Role Playing Game Association",
        "SEM" => "Seminars",
        "SPA" => "Spousal Activities",
        "TCG" => "Tradeable Card Game",
        "TDA" => "True Dungeon",
        "TRD" => "Trade Day Events",
        "WKS" => "Workshop",
        "ZED" => "Isle of Misfit Events",
        _ => return None,
    };
    Some(name)
}
