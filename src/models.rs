// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use crate::LngLat;
use crate::point_index::MatchStrategy;
use crate::properties::PropertyMap;
use serde_json::Value;

/// Index of a point within a network's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PointId(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    pub coordinates: LngLat,
    pub lgd_code: Option<String>,
    pub properties: PropertyMap,
    #[serde(rename = "type")]
    pub point_type: String,
    pub id: Option<String>,
    pub network_id: Option<String>,
}

/// A connection endpoint. `point` is `None` when no point matched the reference;
/// the record is kept regardless so the gap can be reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRef {
    pub point: Option<PointId>,
    pub strategy: Option<MatchStrategy>,
}

impl PointRef {
    pub fn resolved(point: PointId, strategy: MatchStrategy) -> Self {
        Self {
            point: Some(point),
            strategy: Some(strategy),
        }
    }

    pub fn unresolved() -> Self {
        Self {
            point: None,
            strategy: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.point.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub start: PointRef,
    pub end: PointRef,
    /// The reference text as it appeared in the source record.
    pub start_name: String,
    pub end_name: String,
    pub path: Vec<LngLat>,
    pub length_km: f64,
    pub existing: bool,
    pub color: String,
    pub properties: PropertyMap,
}

/// Network-level administrative metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMeta {
    pub network_id: Option<String>,
    pub main_point_name: Option<String>,
    pub state_code: Option<String>,
    pub state_name: Option<String>,
    pub district_code: Option<String>,
    pub district_name: Option<String>,
    pub block_code: Option<String>,
    pub block_name: Option<String>,
    /// Everything else the source supplied.
    pub extra: serde_json::Map<String, Value>,
}

impl NetworkMeta {
    /// Read loosely typed metadata. Codes may be numbers or strings and the
    /// main point sometimes travels as `mainPointName`.
    pub fn from_value(raw: &Value) -> Self {
        let Value::Object(map) = raw else {
            return Self::default();
        };

        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| map.get(*k).and_then(crate::properties::value_as_string))
        };

        let known = [
            "network_id",
            "id",
            "main_point_name",
            "mainPointName",
            "state_code",
            "state_name",
            "district_code",
            "district_name",
            "block_code",
            "block_name",
        ];

        Self {
            network_id: text(&["network_id", "id"]),
            main_point_name: text(&["main_point_name", "mainPointName"]),
            state_code: text(&["state_code"]),
            state_name: text(&["state_name"]),
            district_code: text(&["district_code"]),
            district_name: text(&["district_name"]),
            block_code: text(&["block_code"]),
            block_name: text(&["block_name"]),
            extra: map
                .iter()
                .filter(|(k, _)| !known.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// `(property key, value)` pairs propagated into connection bundles.
    pub fn admin_codes(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("state_code", self.state_code.as_deref()),
            ("district_code", self.district_code.as_deref()),
            ("block_code", self.block_code.as_deref()),
        ]
    }
}
