// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// The in-memory network: points, their routes, and the directed segment map

use crate::LngLat;
use crate::connections::fill_derived_properties;
use crate::coordinates::{is_sentinel, path_length_km, position_at_fraction};
use crate::models::{Connection, NetworkMeta, Point, PointId, PointRef};
use crate::point_index::{MatchStrategy, PointIndex};
use crate::properties::parse_properties;
use crate::PROPOSED_COLOR;
use geo::{Coord, Rect};
use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

const KEY_SEPARATOR: &str = " TO ";

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("no segment {0}")]
    UnknownSegment(SegmentKey),
    #[error("no point named '{0}'")]
    UnknownPoint(String),
    #[error("segment key '{0}' is not of the form 'A TO B'")]
    MalformedKey(String),
    #[error("cannot place a route with an empty path")]
    EmptyPath,
}

/// Directed segment identifier. The first name is the point that owns the
/// route in the loop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub from: String,
    pub to: String,
}

impl SegmentKey {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.from, KEY_SEPARATOR, self.to)
    }
}

impl FromStr for SegmentKey {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(KEY_SEPARATOR) {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                Ok(SegmentKey::new(from.trim(), to.trim()))
            }
            _ => Err(GraphError::MalformedKey(s.to_string())),
        }
    }
}

/// A previous state of a segment's route, kept for undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSnapshot {
    pub path: Vec<LngLat>,
    pub distance_km: f64,
    pub label_position: LngLat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDetail {
    pub connection: Connection,
    pub label_position: LngLat,
    history: Vec<RouteSnapshot>,
}

impl SegmentDetail {
    fn new(connection: Connection) -> Self {
        let label_position = label_position_for(&connection.path);
        Self {
            connection,
            label_position,
            history: Vec::new(),
        }
    }

    /// Oldest first.
    pub fn history(&self) -> &[RouteSnapshot] {
        &self.history
    }

    fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            path: self.connection.path.clone(),
            distance_km: self.connection.length_km,
            label_position: self.label_position,
        }
    }
}

/// A point and its single outbound route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopEntry {
    pub point: Point,
    pub route: Option<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointSide {
    Start,
    End,
}

/// A connection endpoint that matched no point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedEndpoint {
    pub segment: SegmentKey,
    pub side: EndpointSide,
    pub reference: String,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkGraph {
    loop_entries: Vec<LoopEntry>,
    segments: BTreeMap<SegmentKey, SegmentDetail>,
    existing_length: f64,
    proposed_length: f64,
    total_length: f64,
    meta: NetworkMeta,
    index: PointIndex,
    unresolved: Vec<UnresolvedEndpoint>,
}

/// Whether a loop route is the connection stored under `key`. Adopted routes
/// are keyed destination first, so either direction counts.
fn route_is_segment(route: &Connection, key: &SegmentKey) -> bool {
    (route.start_name == key.from && route.end_name == key.to)
        || (route.start_name == key.to && route.end_name == key.from)
}

pub fn label_position_for(path: &[LngLat]) -> LngLat {
    position_at_fraction(path, 0.5).unwrap_or(crate::coordinates::SENTINEL)
}

impl NetworkGraph {
    pub fn new(points: Vec<Point>, meta: NetworkMeta) -> Self {
        let index = PointIndex::build(&points);
        Self {
            loop_entries: points
                .into_iter()
                .map(|point| LoopEntry { point, route: None })
                .collect(),
            meta,
            index,
            ..Default::default()
        }
    }

    pub fn meta(&self) -> &NetworkMeta {
        &self.meta
    }

    pub fn index(&self) -> &PointIndex {
        &self.index
    }

    pub fn loop_entries(&self) -> &[LoopEntry] {
        &self.loop_entries
    }

    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.loop_entries.iter().map(|e| &e.point)
    }

    /// Points in loop order, for code that needs a slice.
    pub fn point_list(&self) -> Vec<Point> {
        self.points().cloned().collect()
    }

    pub fn point(&self, id: PointId) -> Option<&Point> {
        self.loop_entries.get(id.0).map(|e| &e.point)
    }

    pub fn loop_entry(&self, id: PointId) -> Option<&LoopEntry> {
        self.loop_entries.get(id.0)
    }

    /// Exact, then case-insensitive, name match. No fuzzy strategies.
    pub fn point_by_name(&self, name: &str) -> Option<PointId> {
        let name = name.trim();
        self.loop_entries
            .iter()
            .position(|e| e.point.name == name)
            .or_else(|| {
                self.loop_entries
                    .iter()
                    .position(|e| e.point.name.eq_ignore_ascii_case(name))
            })
            .map(PointId)
    }

    pub fn main_point_name(&self) -> Option<&str> {
        self.meta
            .main_point_name
            .as_deref()
            .or_else(|| self.loop_entries.first().map(|e| e.point.name.as_str()))
    }

    pub fn segments(&self) -> &BTreeMap<SegmentKey, SegmentDetail> {
        &self.segments
    }

    pub fn segment(&self, key: &SegmentKey) -> Option<&SegmentDetail> {
        self.segments.get(key)
    }

    /// Look a segment up between two names in either direction.
    pub fn find_segment(&self, a: &str, b: &str) -> Option<&SegmentKey> {
        let forward = SegmentKey::new(a, b);
        let backward = forward.reversed();
        self.segments
            .get_key_value(&forward)
            .or_else(|| self.segments.get_key_value(&backward))
            .map(|(k, _)| k)
    }

    pub fn existing_length(&self) -> f64 {
        self.existing_length
    }

    pub fn proposed_length(&self) -> f64 {
        self.proposed_length
    }

    pub fn total_length(&self) -> f64 {
        self.total_length
    }

    pub fn unresolved(&self) -> &[UnresolvedEndpoint] {
        &self.unresolved
    }

    /// Add an ingested connection under `"start TO end"`. The start point takes
    /// it as its outbound route unless it already has one.
    pub fn insert_connection(&mut self, connection: Connection) -> SegmentKey {
        let key = SegmentKey::new(connection.start_name.clone(), connection.end_name.clone());

        for (side, r, name) in [
            (EndpointSide::Start, &connection.start, &connection.start_name),
            (EndpointSide::End, &connection.end, &connection.end_name),
        ] {
            if !r.is_resolved() {
                self.unresolved.push(UnresolvedEndpoint {
                    segment: key.clone(),
                    side,
                    reference: name.clone(),
                });
            }
        }

        if let Some(owner) = connection.start.point {
            match self.loop_entries.get_mut(owner.0) {
                Some(entry) if entry.route.is_none() => entry.route = Some(connection.clone()),
                Some(entry) => debug!(
                    "{} already has an outbound route, keeping {} only in segments",
                    entry.point.name, key
                ),
                None => warn!("connection {} refers to missing point {:?}", key, owner),
            }
        }

        if self.segments.contains_key(&key) {
            warn!("duplicate segment {}, replacing", key);
        }
        self.segments.insert(key.clone(), SegmentDetail::new(connection));
        self.recompute_totals();
        key
    }

    /// Adopt a chosen alternative route between `origin` and `destination`.
    ///
    /// The destination is looked up by name, falling back to the point nearest
    /// (planar, in degrees) to the path's last vertex. Its loop entry takes the
    /// route and the segment is stored as `"<destination> TO <origin>"`.
    pub fn select_alternate_route(
        &mut self,
        path: Vec<LngLat>,
        origin: &str,
        destination: &str,
        distance_km: f64,
    ) -> Result<SegmentKey, GraphError> {
        let destination_id = match self.point_by_name(destination) {
            Some(id) => id,
            None => {
                let terminal = path.last().ok_or(GraphError::EmptyPath)?;
                let id = self
                    .nearest_point(terminal)
                    .ok_or_else(|| GraphError::UnknownPoint(destination.to_string()))?;
                info!(
                    "destination '{}' not found by name, using nearest point '{}'",
                    destination, self.loop_entries[id.0].point.name
                );
                id
            }
        };

        let destination_name = self.loop_entries[destination_id.0].point.name.clone();
        let origin_id = self.point_by_name(origin);
        let origin_name = origin_id
            .map(|id| self.loop_entries[id.0].point.name.clone())
            .unwrap_or_else(|| origin.to_string());

        let length_km = if path.len() >= 2 {
            path_length_km(&path)
        } else {
            distance_km
        };

        let mut properties = parse_properties(None);
        fill_derived_properties(
            &mut properties,
            &origin_name,
            &destination_name,
            length_km,
            false,
            &self.meta,
        );

        let connection = Connection {
            start: origin_id
                .map(|id| PointRef::resolved(id, MatchStrategy::ExactName))
                .unwrap_or_else(PointRef::unresolved),
            end: PointRef::resolved(destination_id, MatchStrategy::ExactName),
            start_name: origin_name.clone(),
            end_name: destination_name.clone(),
            path,
            length_km,
            existing: false,
            color: PROPOSED_COLOR.to_string(),
            properties,
        };

        self.loop_entries[destination_id.0].route = Some(connection.clone());

        let key = SegmentKey::new(destination_name, origin_name);
        self.segments
            .insert(key.clone(), SegmentDetail::new(connection));
        self.recompute_totals();
        Ok(key)
    }

    /// Replace a segment's path after a confirmed edit. The previous state is
    /// pushed onto the segment's history first.
    pub fn commit_path_edit(
        &mut self,
        key: &SegmentKey,
        path: Vec<LngLat>,
        distance_km: f64,
    ) -> Result<&SegmentDetail, GraphError> {
        let detail = self
            .segments
            .get_mut(key)
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?;
        let snapshot = detail.snapshot();
        detail.history.push(snapshot);
        self.apply_path(key, path, distance_km, None)
    }

    /// Pop the newest snapshot and put it back. `Ok(None)` when there is
    /// nothing to undo.
    pub fn undo_segment(&mut self, key: &SegmentKey) -> Result<Option<RouteSnapshot>, GraphError> {
        let detail = self
            .segments
            .get_mut(key)
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?;
        let Some(snapshot) = detail.history.pop() else {
            return Ok(None);
        };
        self.apply_path(
            key,
            snapshot.path.clone(),
            snapshot.distance_km,
            Some(snapshot.label_position),
        )?;
        Ok(Some(snapshot))
    }

    fn apply_path(
        &mut self,
        key: &SegmentKey,
        path: Vec<LngLat>,
        distance_km: f64,
        label_position: Option<LngLat>,
    ) -> Result<&SegmentDetail, GraphError> {
        let length_km = if path.len() >= 2 {
            path_length_km(&path)
        } else {
            distance_km
        };

        let detail = self
            .segments
            .get_mut(key)
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?;
        detail.label_position = label_position.unwrap_or_else(|| label_position_for(&path));
        detail.connection.path = path;
        detail.connection.length_km = length_km;
        detail
            .connection
            .properties
            .insert("length_m".to_string(), Value::from((length_km * 100_000.0).round() / 100.0));
        let connection = detail.connection.clone();

        if let Some(owner) = self.point_by_name(&key.from) {
            let entry = &mut self.loop_entries[owner.0];
            if entry.route.as_ref().is_some_and(|r| route_is_segment(r, key)) {
                entry.route = Some(connection);
            }
        }

        self.recompute_totals();
        self.segments
            .get(key)
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))
    }

    /// Remove a segment. Its owner's route is cleared only when that route is
    /// this segment. The point itself stays.
    pub fn delete_segment(&mut self, key: &SegmentKey) -> Result<SegmentDetail, GraphError> {
        let removed = self
            .segments
            .remove(key)
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?;

        if let Some(owner) = self.point_by_name(&key.from) {
            let entry = &mut self.loop_entries[owner.0];
            if entry.route.as_ref().is_some_and(|r| route_is_segment(r, key)) {
                entry.route = None;
            }
        }
        self.unresolved.retain(|u| &u.segment != key);

        self.recompute_totals();
        Ok(removed)
    }

    pub fn add_point_property(
        &mut self,
        point_name: &str,
        key: &str,
        value: Value,
    ) -> Result<(), GraphError> {
        let id = self
            .point_by_name(point_name)
            .ok_or_else(|| GraphError::UnknownPoint(point_name.to_string()))?;
        self.loop_entries[id.0]
            .point
            .properties
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Fill in a missing administrative code. Existing codes are left alone.
    /// Returns whether the point changed.
    pub fn backfill_lgd_code(&mut self, point_name: &str, code: &str) -> Result<bool, GraphError> {
        let id = self
            .point_by_name(point_name)
            .ok_or_else(|| GraphError::UnknownPoint(point_name.to_string()))?;
        let point = &mut self.loop_entries[id.0].point;
        let missing = point
            .lgd_code
            .as_deref()
            .is_none_or(crate::point_index::is_null_code);
        if !missing {
            return Ok(false);
        }
        point.lgd_code = Some(code.trim().to_string());
        point
            .properties
            .insert("lgd_code".to_string(), Value::String(code.trim().to_string()));
        self.index = PointIndex::build(&self.point_list());
        Ok(true)
    }

    /// Bounding box of every point with a real coordinate.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        let mut coords = self
            .points()
            .map(|p| p.coordinates)
            .filter(|c| !is_sentinel(c));
        let first = coords.next()?;
        let (mut min, mut max) = (first, first);
        for c in coords {
            min = [min[0].min(c[0]), min[1].min(c[1])];
            max = [max[0].max(c[0]), max[1].max(c[1])];
        }
        Some(Rect::new(
            Coord {
                x: min[0],
                y: min[1],
            },
            Coord {
                x: max[0],
                y: max[1],
            },
        ))
    }

    /// Nearest point in plain degree space, ignoring sentinel coordinates.
    pub fn nearest_point(&self, target: &LngLat) -> Option<PointId> {
        let tree = RTree::bulk_load(
            self.loop_entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !is_sentinel(&e.point.coordinates))
                .map(|(i, e)| GeomWithData::new(e.point.coordinates, i))
                .collect(),
        );
        tree.nearest_neighbor(target).map(|g| PointId(g.data))
    }

    pub fn reset(&mut self) {
        *self = NetworkGraph::default();
    }

    fn recompute_totals(&mut self) {
        let (existing, proposed) =
            self.segments
                .values()
                .fold((0.0, 0.0), |(existing, proposed), detail| {
                    if detail.connection.existing {
                        (existing + detail.connection.length_km, proposed)
                    } else {
                        (existing, proposed + detail.connection.length_km)
                    }
                });
        self.existing_length = existing;
        self.proposed_length = proposed;
        self.total_length = existing + proposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EXISTING_COLOR;
    use crate::properties::PropertyMap;

    fn point(name: &str, coordinates: LngLat) -> Point {
        Point {
            name: name.to_string(),
            coordinates,
            lgd_code: None,
            properties: PropertyMap::new(),
            point_type: "GP".to_string(),
            id: None,
            network_id: None,
        }
    }

    fn connection(
        graph: &NetworkGraph,
        start: &str,
        end: &str,
        path: Vec<LngLat>,
        existing: bool,
    ) -> Connection {
        let r = |name: &str| {
            graph
                .point_by_name(name)
                .map(|id| PointRef::resolved(id, MatchStrategy::ExactName))
                .unwrap_or_else(PointRef::unresolved)
        };
        Connection {
            start: r(start),
            end: r(end),
            start_name: start.to_string(),
            end_name: end.to_string(),
            length_km: path_length_km(&path),
            path,
            existing,
            color: if existing { EXISTING_COLOR } else { PROPOSED_COLOR }.to_string(),
            properties: PropertyMap::new(),
        }
    }

    fn graph() -> NetworkGraph {
        let mut g = NetworkGraph::new(
            vec![
                point("Block HQ", [77.0, 28.0]),
                point("Rampur", [77.1, 28.0]),
                point("Khera", [77.1, 28.1]),
                point("Broken", [0.0, 0.0]),
            ],
            NetworkMeta::default(),
        );
        let c = connection(&g, "Block HQ", "Rampur", vec![[77.0, 28.0], [77.1, 28.0]], true);
        g.insert_connection(c);
        let c = connection(&g, "Rampur", "Khera", vec![[77.1, 28.0], [77.1, 28.1]], false);
        g.insert_connection(c);
        g
    }

    fn assert_totals(g: &NetworkGraph) {
        assert!((g.total_length() - (g.existing_length() + g.proposed_length())).abs() < 1e-6);
    }

    #[test]
    fn key_round_trip_and_lookup() {
        let key: SegmentKey = "Rampur TO Khera".parse().unwrap();
        assert_eq!(key, SegmentKey::new("Rampur", "Khera"));
        assert_eq!(key.to_string(), "Rampur TO Khera");
        assert!("Rampur".parse::<SegmentKey>().is_err());

        let g = graph();
        assert_eq!(g.find_segment("Khera", "Rampur"), Some(&key));
        assert_eq!(g.find_segment("Rampur", "Khera"), Some(&key));
        assert_eq!(g.find_segment("Khera", "Block HQ"), None);
    }

    #[test]
    fn totals_follow_every_mutation() {
        let mut g = graph();
        assert_totals(&g);
        assert!(g.existing_length() > 0.0);
        assert!(g.proposed_length() > 0.0);

        let key = g
            .select_alternate_route(vec![[77.0, 28.0], [77.05, 28.05], [77.1, 28.1]], "Block HQ", "Khera", 0.0)
            .unwrap();
        assert_totals(&g);

        g.commit_path_edit(&key, vec![[77.0, 28.0], [77.1, 28.1]], 0.0).unwrap();
        assert_totals(&g);

        g.undo_segment(&key).unwrap();
        assert_totals(&g);

        g.delete_segment(&key).unwrap();
        assert_totals(&g);
        assert_eq!(g.segments().len(), 2);
    }

    #[test]
    fn alternate_route_key_is_destination_first() {
        let mut g = graph();
        let key = g
            .select_alternate_route(vec![[77.0, 28.0], [77.1, 28.1]], "Block HQ", "Khera", 0.0)
            .unwrap();
        assert_eq!(key.to_string(), "Khera TO Block HQ");
        let khera = g.point_by_name("Khera").unwrap();
        let route = g.loop_entry(khera).unwrap().route.as_ref().unwrap();
        assert_eq!(route.path.len(), 2);
        assert!(!route.existing);
    }

    #[test]
    fn alternate_route_falls_back_to_nearest_point() {
        let mut g = graph();
        let key = g
            .select_alternate_route(
                vec![[77.0, 28.0], [77.099, 28.002]],
                "Block HQ",
                "Rampur Junction (new)",
                0.0,
            )
            .unwrap();
        assert_eq!(key, SegmentKey::new("Rampur", "Block HQ"));
    }

    #[test]
    fn nearest_point_ignores_sentinels() {
        let g = graph();
        assert_eq!(g.nearest_point(&[0.1, 0.1]), Some(PointId(0)));
    }

    #[test]
    fn delete_clears_route_but_keeps_point() {
        let mut g = graph();
        let key = SegmentKey::new("Rampur", "Khera");
        let before = g.point(PointId(1)).unwrap().clone();
        assert!(g.loop_entry(PointId(1)).unwrap().route.is_some());

        g.delete_segment(&key).unwrap();

        assert!(g.segment(&key).is_none());
        let entry = g.loop_entry(PointId(1)).unwrap();
        assert!(entry.route.is_none());
        assert_eq!(entry.point.name, before.name);
        assert_eq!(entry.point.coordinates, before.coordinates);
        assert_eq!(g.delete_segment(&key), Err(GraphError::UnknownSegment(key)));
    }

    #[test]
    fn second_segment_of_a_point_leaves_its_route_alone() {
        let mut g = graph();
        let extra = connection(&g, "Block HQ", "Khera", vec![[77.0, 28.0], [77.1, 28.1]], false);
        let extra_key = g.insert_connection(extra);
        let hq = g.point_by_name("Block HQ").unwrap();
        let route_end = |g: &NetworkGraph| {
            g.loop_entry(hq)
                .unwrap()
                .route
                .as_ref()
                .map(|r| r.end_name.clone())
        };
        assert_eq!(route_end(&g).as_deref(), Some("Rampur"));

        g.commit_path_edit(&extra_key, vec![[77.0, 28.0], [77.05, 28.0], [77.1, 28.1]], 0.0)
            .unwrap();
        assert_eq!(route_end(&g).as_deref(), Some("Rampur"));
        g.undo_segment(&extra_key).unwrap();
        assert_eq!(route_end(&g).as_deref(), Some("Rampur"));

        g.delete_segment(&extra_key).unwrap();
        assert_eq!(route_end(&g).as_deref(), Some("Rampur"));
        assert_totals(&g);

        let own = SegmentKey::new("Block HQ", "Rampur");
        g.commit_path_edit(&own, vec![[77.0, 28.0], [77.05, 28.01], [77.1, 28.0]], 0.0)
            .unwrap();
        let route = g.loop_entry(hq).unwrap().route.as_ref().unwrap();
        assert_eq!(route.path.len(), 3);

        g.delete_segment(&own).unwrap();
        assert_eq!(route_end(&g), None);
    }

    #[test]
    fn undo_on_empty_history_is_noop() {
        let mut g = graph();
        let key = SegmentKey::new("Rampur", "Khera");
        let before = g.segment(&key).unwrap().connection.path.clone();
        assert_eq!(g.undo_segment(&key).unwrap(), None);
        assert_eq!(g.segment(&key).unwrap().connection.path, before);
    }

    #[test]
    fn bounds_skip_sentinel_points() {
        let rect = graph().bounds().unwrap();
        assert_eq!(rect.min(), Coord { x: 77.0, y: 28.0 });
        assert_eq!(rect.max(), Coord { x: 77.1, y: 28.1 });
    }

    #[test]
    fn backfill_only_fills_gaps() {
        let mut g = graph();
        assert!(g.backfill_lgd_code("Khera", "445566").unwrap());
        assert!(!g.backfill_lgd_code("Khera", "999999").unwrap());
        let r = crate::point_index::PointResolver::resolve(g.index(), None, Some("445566"));
        assert_eq!(r.point, g.point_by_name("Khera"));
        assert!(g.add_point_property("Nowhere", "x", Value::Null).is_err());
    }
}
