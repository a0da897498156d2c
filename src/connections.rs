// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use crate::coordinates::{normalize_path, path_length_km};
use crate::models::{Connection, NetworkMeta, Point, PointRef};
use crate::point_index::{PointResolver, Resolution};
use crate::properties::{
    PropertyMap, parse_properties, property_str, value_as_f64, value_as_string, value_is_truthy,
};
use crate::{EXISTING_COLOR, PROPOSED_COLOR};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_ASSET_TYPE: &str = "Cable";
pub const DEFAULT_FIBER_COUNT: &str = "24";

/// A connection record as it arrives from upload or preview. Every field is
/// optional and loosely typed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConnection {
    pub start: Option<Value>,
    pub end: Option<Value>,
    pub start_lgd_code: Option<Value>,
    pub end_lgd_code: Option<Value>,
    pub length: Option<Value>,
    pub coordinates: Option<Value>,
    pub path: Option<Value>,
    pub geometry: Option<Value>,
    #[serde(rename = "type")]
    pub connection_type: Option<Value>,
    pub existing: Option<Value>,
    pub status: Option<Value>,
    pub phase: Option<Value>,
    pub color: Option<Value>,
    pub properties: Option<Value>,
}

/// A reference to one end of a connection, as written in the record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointReference {
    pub name: Option<String>,
    pub lgd_code: Option<String>,
}

impl EndpointReference {
    /// `start`/`end` can be a plain name, a number, or an object carrying
    /// `name` and `lgd_code`. A code given elsewhere in the record fills in when
    /// the reference itself has none.
    pub fn from_record(raw: Option<&Value>, fallback_code: Option<String>) -> Self {
        let (name, code) = match raw {
            Some(Value::Object(map)) => (
                ["name", "Name", "title"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(value_as_string)),
                ["lgd_code", "lgdCode", "code"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(value_as_string)),
            ),
            Some(v) => (value_as_string(v), None),
            None => (None, None),
        };

        Self {
            name,
            lgd_code: code.or(fallback_code),
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.lgd_code.clone())
            .unwrap_or_default()
    }
}

/// Turn one raw record into a canonical [`Connection`].
///
/// Endpoints that resolve to nothing stay in the record as unresolved refs.
pub fn normalize_connection(
    raw: &RawConnection,
    resolver: &impl PointResolver,
    points: &[Point],
    meta: &NetworkMeta,
) -> Connection {
    let mut properties = parse_properties(raw.properties.as_ref());

    let start_code = raw
        .start_lgd_code
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(&properties, "start_lgd_code"));
    let end_code = raw
        .end_lgd_code
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(&properties, "end_lgd_code"));

    let start_ref = EndpointReference::from_record(raw.start.as_ref(), start_code);
    let end_ref = EndpointReference::from_record(raw.end.as_ref(), end_code);

    let start = resolve_endpoint(resolver, &start_ref);
    let end = resolve_endpoint(resolver, &end_ref);

    let path = [&raw.coordinates, &raw.path, &raw.geometry]
        .into_iter()
        .flatten()
        .map(normalize_path)
        .find(|p| !p.is_empty())
        .unwrap_or_default();

    let length_km = connection_length_km(&path, raw.length.as_ref(), &properties);

    let existing = is_existing(raw, &properties);
    let color = if existing {
        EXISTING_COLOR
    } else {
        PROPOSED_COLOR
    };

    let start_name = start
        .point
        .and_then(|id| points.get(id.0))
        .map(|p| p.name.clone())
        .unwrap_or_else(|| start_ref.display_name());
    let end_name = end
        .point
        .and_then(|id| points.get(id.0))
        .map(|p| p.name.clone())
        .unwrap_or_else(|| end_ref.display_name());

    fill_derived_properties(
        &mut properties,
        &start_name,
        &end_name,
        length_km,
        existing,
        meta,
    );

    debug!(
        "normalized connection {} -> {} ({:.3} km, existing: {})",
        start_name, end_name, length_km, existing
    );

    Connection {
        start: to_ref(start),
        end: to_ref(end),
        start_name,
        end_name,
        path,
        length_km,
        existing,
        color: color.to_string(),
        properties,
    }
}

fn resolve_endpoint(resolver: &impl PointResolver, reference: &EndpointReference) -> Resolution {
    resolver.resolve(reference.name.as_deref(), reference.lgd_code.as_deref())
}

fn to_ref(resolution: Resolution) -> PointRef {
    match (resolution.point, resolution.strategy) {
        (Some(point), Some(strategy)) => PointRef::resolved(point, strategy),
        _ => PointRef::unresolved(),
    }
}

/// Haversine length of a real path, else the recorded length, else zero.
pub fn connection_length_km(
    path: &[crate::LngLat],
    explicit: Option<&Value>,
    properties: &PropertyMap,
) -> f64 {
    if path.len() >= 2 {
        return path_length_km(path);
    }
    explicit
        .and_then(value_as_f64)
        .or_else(|| crate::properties::property_f64(properties, "cable_len"))
        .filter(|km| *km >= 0.0)
        .unwrap_or(0.0)
}

/// Existing if any of the usual markers says so.
pub fn is_existing(raw: &RawConnection, properties: &PropertyMap) -> bool {
    let flag = raw.existing.as_ref().is_some_and(value_is_truthy)
        || properties.get("existing").is_some_and(value_is_truthy);

    let type_is_existing = raw
        .connection_type
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(properties, "type"))
        .is_some_and(|t| t.eq_ignore_ascii_case("existing"));

    let status = raw
        .status
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(properties, "status"));
    let phase = raw
        .phase
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(properties, "phase"));

    flag || type_is_existing || status.as_deref() == Some("Accepted") || phase.as_deref() == Some("1")
}

pub(crate) fn fill_derived_properties(
    properties: &mut PropertyMap,
    start_name: &str,
    end_name: &str,
    length_km: f64,
    existing: bool,
    meta: &NetworkMeta,
) {
    let set_if_blank = |properties: &mut PropertyMap, key: &str, value: &str| {
        if property_str(properties, key).is_none() {
            properties.insert(key.to_string(), Value::String(value.to_string()));
        }
    };

    set_if_blank(properties, "asset_type", DEFAULT_ASSET_TYPE);
    set_if_blank(properties, "fiber_count", DEFAULT_FIBER_COUNT);
    set_if_blank(properties, "start", start_name);
    set_if_blank(properties, "end", end_name);

    for (key, code) in meta.admin_codes() {
        if let Some(code) = code {
            set_if_blank(properties, key, code);
        }
    }

    let length_m = (length_km * 1000.0 * 100.0).round() / 100.0;
    properties.insert("length_m".to_string(), Value::from(length_m));
    properties.insert("existing".to_string(), Value::Bool(existing));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PointId;
    use crate::point_index::{MatchStrategy, PointIndex};
    use serde_json::json;

    fn point(name: &str, coordinates: [f64; 2], lgd: &str) -> Point {
        Point {
            name: name.to_string(),
            coordinates,
            lgd_code: Some(lgd.to_string()),
            properties: PropertyMap::new(),
            point_type: "GP".to_string(),
            id: None,
            network_id: None,
        }
    }

    fn fixture() -> (Vec<Point>, PointIndex, NetworkMeta) {
        let points = vec![
            point("Origin", [0.0, 0.0], "100"),
            point("Far East", [1.0, 0.0], "200"),
        ];
        let index = PointIndex::build(&points);
        let meta = NetworkMeta {
            block_code: Some("B-17".to_string()),
            ..Default::default()
        };
        (points, index, meta)
    }

    fn raw(value: serde_json::Value) -> RawConnection {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn one_degree_proposed_connection() {
        let (points, index, meta) = fixture();
        let c = normalize_connection(
            &raw(json!({
                "start": "Origin",
                "end": "Far East",
                "coordinates": [[0.0, 0.0], [1.0, 0.0]]
            })),
            &index,
            &points,
            &meta,
        );

        assert!((c.length_km - 111.19).abs() < 0.01);
        assert!(!c.existing);
        assert_eq!(c.color, PROPOSED_COLOR);
        assert_eq!(property_str(&c.properties, "status").as_deref(), Some("Proposed"));
        assert_eq!(c.properties.get("length_m").and_then(|v| v.as_f64()).map(f64::round), Some(111195.0));
        assert_eq!(property_str(&c.properties, "block_code").as_deref(), Some("B-17"));
        assert_eq!(property_str(&c.properties, "asset_type").as_deref(), Some("Cable"));
        assert_eq!(c.start.point, Some(PointId(0)));
        assert_eq!(c.end.point, Some(PointId(1)));
    }

    #[test]
    fn start_resolved_by_code_not_substring() {
        let (points, index, meta) = fixture();
        let c = normalize_connection(
            &raw(json!({
                "start": "Origin Junction Typo",
                "start_lgd_code": 100,
                "end": "Far East",
            })),
            &index,
            &points,
            &meta,
        );
        assert_eq!(c.start.point, Some(PointId(0)));
        assert_eq!(c.start.strategy, Some(MatchStrategy::LgdCode));
        assert_eq!(c.start_name, "Origin");
    }

    #[test]
    fn explicit_length_when_path_is_short() {
        let (points, index, meta) = fixture();
        let c = normalize_connection(
            &raw(json!({"start": "Origin", "end": "Far East", "length": "2.5"})),
            &index,
            &points,
            &meta,
        );
        assert_eq!(c.length_km, 2.5);

        let none = normalize_connection(&raw(json!({})), &index, &points, &meta);
        assert_eq!(none.length_km, 0.0);
    }

    #[test]
    fn classification_markers() {
        let (points, index, meta) = fixture();
        for record in [
            json!({"existing": true}),
            json!({"existing": "true"}),
            json!({"type": "Existing"}),
            json!({"properties": "{\"status\": \"Accepted\"}"}),
            json!({"properties": {"phase": 1}}),
        ] {
            let c = normalize_connection(&raw(record.clone()), &index, &points, &meta);
            assert!(c.existing, "expected existing for {}", record);
            assert_eq!(c.color, EXISTING_COLOR);
        }
    }

    #[test]
    fn unresolved_endpoint_is_kept() {
        let (points, index, meta) = fixture();
        let c = normalize_connection(
            &raw(json!({"start": "Origin", "end": "Atlantis"})),
            &index,
            &points,
            &meta,
        );
        assert!(c.start.is_resolved());
        assert!(!c.end.is_resolved());
        assert_eq!(c.end_name, "Atlantis");
    }
}
