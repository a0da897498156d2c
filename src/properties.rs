// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Attribute bags attached to points and connections.

use serde_json::{Map, Value};
use tracing::warn;

pub type PropertyMap = Map<String, Value>;

/// Fields every canonical bag carries, with their defaults.
pub const KNOWN_FIELDS: [(&str, &str); 40] = [
    ("name", ""),
    ("type", ""),
    ("asset_type", "Cable"),
    ("lgd_code", ""),
    ("status", "Proposed"),
    ("phase", "3"),
    ("icon", ""),
    ("color", ""),
    ("remarks", ""),
    ("description", ""),
    ("cable_len", ""),
    ("length_m", ""),
    ("cable_type", ""),
    ("fiber_count", "24"),
    ("laying_method", ""),
    ("route_id", ""),
    ("segment_code", ""),
    ("start", ""),
    ("end", ""),
    ("start_lgd_code", ""),
    ("end_lgd_code", ""),
    ("existing", ""),
    ("state_name", ""),
    ("state_code", ""),
    ("district_name", ""),
    ("district_code", ""),
    ("block_name", ""),
    ("block_code", ""),
    ("gp_name", ""),
    ("gp_code", ""),
    ("village_name", ""),
    ("ont_count", ""),
    ("olt_port", ""),
    ("ring", ""),
    ("span", ""),
    ("frt", ""),
    ("otdr_length", ""),
    ("network_id", ""),
    ("created_by", ""),
    ("created_at", ""),
];

/// Parse a property bag. Unknown keys are kept verbatim; known keys that are
/// missing or `null` take their default. Never fails: garbage in gives an empty
/// map and a warning.
pub fn parse_properties(raw: Option<&Value>) -> PropertyMap {
    let parsed = match raw {
        None | Some(Value::Null) => Some(Map::new()),
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(s)) if s.trim().is_empty() => Some(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Some(map),
            Ok(Value::Null) => Some(Map::new()),
            Ok(other) => {
                warn!("property string decoded to non-object {}", other);
                None
            }
            Err(e) => {
                warn!("could not parse property string: {}", e);
                None
            }
        },
        Some(other) => {
            warn!("unsupported property bag {}", other);
            None
        }
    };

    let Some(mut map) = parsed else {
        return Map::new();
    };

    for (key, default) in KNOWN_FIELDS {
        let missing = matches!(map.get(key), None | Some(Value::Null));
        if missing {
            map.insert(key.to_string(), Value::String(default.to_string()));
        }
    }

    map
}

/// Read a property as text; numbers and booleans are stringified, empty strings
/// count as absent.
pub fn property_str(map: &PropertyMap, key: &str) -> Option<String> {
    value_as_string(map.get(key)?)
}

pub fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn property_bool(map: &PropertyMap, key: &str) -> bool {
    map.get(key).is_some_and(value_is_truthy)
}

pub fn value_is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

pub fn property_f64(map: &PropertyMap, key: &str) -> Option<f64> {
    value_as_f64(map.get(key)?)
}

pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}
