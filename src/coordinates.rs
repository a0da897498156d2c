// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Coordinate normalization for loosely encoded geometry.
//!
//! Upstream records arrive as KML exports, spreadsheets and hand-edited JSON, so a
//! single coordinate can show up as `"[77.2, 28.6]"`, `[28.6, 77.2]`,
//! `{"lat": 28.6, "lng": 77.2}` or `"77.2,28.6,0"`. Everything here resolves to
//! `[lng, lat]` and never fails: unparseable input becomes [`SENTINEL`].

use crate::LngLat;
use geo::{Distance, Haversine};
use itertools::Itertools;
use serde_json::Value;
use tracing::warn;

/// Returned in place of any coordinate that could not be parsed.
pub const SENTINEL: LngLat = [0.0, 0.0];

/// Magnitude above which a component can only be a longitude.
const LONGITUDE_ONLY_MAGNITUDE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinateOrder {
    /// Pick the order with the magnitude heuristic.
    #[default]
    Guess,
    LngLat,
    LatLng,
}

pub fn is_sentinel(c: &LngLat) -> bool {
    c[0] == SENTINEL[0] && c[1] == SENTINEL[1]
}

/// Normalize a single coordinate, guessing the component order.
pub fn normalize_pair(raw: &Value) -> LngLat {
    normalize_pair_with_order(raw, CoordinateOrder::Guess)
}

pub fn normalize_pair_with_order(raw: &Value, order: CoordinateOrder) -> LngLat {
    match try_normalize_pair(raw, order) {
        Some(c) => c,
        None => {
            warn!("unparseable coordinate {}, using sentinel (0,0)", raw);
            SENTINEL
        }
    }
}

/// Like [`normalize_pair_with_order`] but reports failure instead of substituting
/// the sentinel.
pub fn try_normalize_pair(raw: &Value, order: CoordinateOrder) -> Option<LngLat> {
    match raw {
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::String(_)) | Err(_) => {
                let path = parse_kml_coordinates(s)?;
                match path.as_slice() {
                    [single] => Some(*single),
                    _ => None,
                }
            }
            Ok(parsed) => try_normalize_pair(&parsed, order),
        },
        Value::Array(items) => {
            if items.len() < 2 {
                return None;
            }
            let a = number_of(&items[0])?;
            let b = number_of(&items[1])?;
            order_components(a, b, order)
        }
        Value::Object(map) => {
            let lat = ["lat", "latitude", "Lat", "Latitude"]
                .iter()
                .find_map(|k| map.get(*k).and_then(number_of))?;
            let lng = ["lng", "lon", "long", "longitude", "Lng", "Lon", "Longitude"]
                .iter()
                .find_map(|k| map.get(*k).and_then(number_of))?;
            Some([lng, lat])
        }
        _ => None,
    }
}

/// Normalize a path: a list of pairs, a stringified list, a KML coordinate
/// string, or a bare pair (yielding a one-vertex path). Invalid vertices are
/// dropped.
pub fn normalize_path(raw: &Value) -> Vec<LngLat> {
    normalize_path_with_order(raw, CoordinateOrder::Guess)
}

pub fn normalize_path_with_order(raw: &Value, order: CoordinateOrder) -> Vec<LngLat> {
    match raw {
        Value::Null => Vec::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::String(_)) | Err(_) => match parse_kml_coordinates(s) {
                Some(path) => path,
                None => {
                    warn!("unparseable path string {:?}", s);
                    Vec::new()
                }
            },
            Ok(parsed) => normalize_path_with_order(&parsed, order),
        },
        Value::Array(items) => {
            if is_pair_shaped(items) {
                return try_normalize_pair(raw, order).into_iter().collect();
            }

            let mut dropped = 0usize;
            let path: Vec<LngLat> = items
                .iter()
                .filter_map(|item| {
                    let c = try_normalize_pair(item, order);
                    if c.is_none() {
                        dropped += 1;
                    }
                    c
                })
                .collect();

            if dropped > 0 {
                warn!("dropped {} invalid vertices from path", dropped);
            }
            path
        }
        Value::Object(_) => try_normalize_pair(raw, order).into_iter().collect(),
        _ => {
            warn!("unsupported path value {}", raw);
            Vec::new()
        }
    }
}

/// Great-circle length of a path in kilometres. Every vertex counts, including
/// one at exactly `(0, 0)`: invalid vertices never reach a path.
pub fn path_length_km(path: &[LngLat]) -> f64 {
    path.iter()
        .tuple_windows()
        .map(|(a, b)| haversine_km(a, b))
        .sum()
}

pub fn haversine_km(a: &LngLat, b: &LngLat) -> f64 {
    Haversine.distance(crate::lnglat_to_point(a), crate::lnglat_to_point(b)) / 1000.0
}

/// The point lying at `fraction` of the path's great-circle length, together
/// with the index of the vertex it follows.
pub fn locate_fraction(path: &[LngLat], fraction: f64) -> Option<(usize, LngLat)> {
    let first = *path.first()?;
    if path.len() == 1 {
        return Some((0, first));
    }

    let fraction = fraction.clamp(0.0, 1.0);
    let legs: Vec<f64> = path
        .iter()
        .tuple_windows()
        .map(|(a, b)| haversine_km(a, b))
        .collect();
    let total: f64 = legs.iter().sum();
    if total <= 0.0 {
        return Some((0, first));
    }

    let target = total * fraction;
    let mut travelled = 0.0;
    for (i, leg) in legs.iter().enumerate() {
        if *leg > 0.0 && travelled + leg >= target {
            let t = ((target - travelled) / leg).clamp(0.0, 1.0);
            let a = path[i];
            let b = path[i + 1];
            return Some((i, [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t]));
        }
        travelled += leg;
    }

    let last = path.len() - 1;
    Some((last - 1, path[last]))
}

pub fn position_at_fraction(path: &[LngLat], fraction: f64) -> Option<LngLat> {
    locate_fraction(path, fraction).map(|(_, p)| p)
}

/// The path from its start up to the point at `fraction`.
pub fn prefix_until(path: &[LngLat], fraction: f64) -> Vec<LngLat> {
    let Some((i, p)) = locate_fraction(path, fraction) else {
        return Vec::new();
    };
    let mut prefix = path[..=i].to_vec();
    prefix.push(p);
    prefix.dedup();
    prefix
}

/// The path from the point at `fraction` to its end.
pub fn suffix_from(path: &[LngLat], fraction: f64) -> Vec<LngLat> {
    let Some((i, p)) = locate_fraction(path, fraction) else {
        return Vec::new();
    };
    let mut suffix = vec![p];
    suffix.extend_from_slice(&path[(i + 1).min(path.len())..]);
    suffix.dedup();
    suffix
}

fn order_components(a: f64, b: f64, order: CoordinateOrder) -> Option<LngLat> {
    if !a.is_finite() || !b.is_finite() {
        return None;
    }
    let pair = match order {
        CoordinateOrder::LngLat => [a, b],
        CoordinateOrder::LatLng => [b, a],
        CoordinateOrder::Guess => {
            if b.abs() > a.abs() && b.abs() >= LONGITUDE_ONLY_MAGNITUDE {
                [b, a]
            } else {
                [a, b]
            }
        }
    };
    Some(pair)
}

fn is_pair_shaped(items: &[Value]) -> bool {
    (items.len() == 2 || items.len() == 3) && items.iter().all(|v| number_of(v).is_some())
}

fn number_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// KML `<coordinates>` text: whitespace-separated `lng,lat[,alt]` tuples.
fn parse_kml_coordinates(s: &str) -> Option<Vec<LngLat>> {
    let mut out = Vec::new();
    for tuple in s.split_whitespace() {
        let mut parts = tuple.split(',').map(|p| p.trim().parse::<f64>());
        let lng = parts.next()?.ok()?;
        let lat = parts.next()?.ok()?;
        out.push(order_components(lng, lat, CoordinateOrder::LngLat)?);
    }
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn close(a: LngLat, b: LngLat) -> bool {
        (a[0] - b[0]).abs() < 1e-9 && (a[1] - b[1]).abs() < 1e-9
    }

    #[test]
    fn all_pair_encodings_agree() {
        let expected = [77.2090, 28.6139];
        let encodings = vec![
            json!("[77.2090, 28.6139]"),
            json!([77.2090, 28.6139]),
            json!({"lat": 28.6139, "lng": 77.2090}),
            json!({"latitude": "28.6139", "longitude": "77.2090"}),
            json!(["77.2090", "28.6139"]),
            json!("77.2090,28.6139,0"),
        ];
        for raw in encodings {
            assert!(close(normalize_pair(&raw), expected), "failed for {}", raw);
        }
    }

    #[test]
    fn path_encodings_agree() {
        let expected = vec![[77.0, 28.0], [77.5, 28.5]];
        let encodings = vec![
            json!([[77.0, 28.0], [77.5, 28.5]]),
            json!("[[77.0, 28.0], [77.5, 28.5]]"),
            json!([{"lat": 28.0, "lng": 77.0}, {"lat": 28.5, "lng": 77.5}]),
            json!("77.0,28.0,0 77.5,28.5,0"),
        ];
        for raw in encodings {
            assert_eq!(normalize_path(&raw), expected, "failed for {}", raw);
        }
    }

    #[test]
    fn small_magnitudes_keep_given_order() {
        assert_eq!(normalize_pair(&json!([28.6139, 77.2090])), [28.6139, 77.2090]);
        assert_eq!(normalize_pair(&json!([10.0, 45.0])), [10.0, 45.0]);
        assert_eq!(normalize_pair(&json!([45.0, 10.0])), [45.0, 10.0]);
    }

    #[test]
    fn explicit_order_bypasses_heuristic() {
        let c = normalize_pair_with_order(&json!([45.0, 10.0]), CoordinateOrder::LatLng);
        assert_eq!(c, [10.0, 45.0]);
    }

    #[test]
    fn malformed_input_yields_sentinel() {
        assert!(is_sentinel(&normalize_pair(&json!("not a coordinate"))));
        assert!(is_sentinel(&normalize_pair(&json!("[77.2,"))));
        assert!(is_sentinel(&normalize_pair(&json!(null))));
        assert!(is_sentinel(&normalize_pair(&json!([1.0]))));
        assert!(normalize_path(&json!("{{broken")).is_empty());
    }

    #[test]
    fn invalid_vertices_are_dropped_from_paths() {
        let path = normalize_path(&json!([[77.0, 28.0], "junk", [77.1, 28.1]]));
        assert_eq!(path, vec![[77.0, 28.0], [77.1, 28.1]]);
    }

    #[test]
    fn fractions_along_a_path() {
        let path = vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        assert!(close(position_at_fraction(&path, 0.0).unwrap(), [0.0, 0.0]));
        assert!(close(position_at_fraction(&path, 0.25).unwrap(), [0.5, 0.0]));
        assert!(close(position_at_fraction(&path, 1.0).unwrap(), [2.0, 0.0]));

        let prefix = prefix_until(&path, 0.25);
        assert_eq!(prefix.len(), 2);
        assert!(close(prefix[1], [0.5, 0.0]));

        let suffix = suffix_from(&path, 0.75);
        assert_eq!(suffix.len(), 2);
        assert!(close(suffix[0], [1.5, 0.0]));
        assert_eq!(suffix[1], [2.0, 0.0]);

        assert_eq!(prefix_until(&path, 0.0), vec![[0.0, 0.0]]);
        assert_eq!(suffix_from(&path, 1.0), vec![[2.0, 0.0]]);
    }

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let len = path_length_km(&[[0.0, 0.0], [1.0, 0.0]]);
        assert!((len - 111.19).abs() < 0.01, "got {}", len);
    }

    #[test]
    fn origin_vertex_is_kept_in_paths() {
        let path = normalize_path(&json!([[0.0, 0.0], [1.0, 0.0]]));
        assert_eq!(path, vec![[0.0, 0.0], [1.0, 0.0]]);
        assert!((path_length_km(&path) - 111.19).abs() < 0.01);

        let kml = normalize_path(&json!("0,0,0 1,0,0"));
        assert_eq!(kml.len(), 2);
    }
}
