// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Bulk ingestion of a network: decoding, per-record normalization, upload client

use crate::connections::{RawConnection, normalize_connection};
use crate::coordinates::{is_sentinel, normalize_pair};
use crate::models::{NetworkMeta, Point};
use crate::network_graph::NetworkGraph;
use crate::point_index::is_null_code;
use crate::properties::{parse_properties, property_str, value_as_string};
use ahash::AHashSet;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_POINT_TYPE: &str = "GP";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("payload is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upload failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload service answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// One network as produced by the upload service or a preview load. Records
/// are kept as raw json so that one bad entry cannot sink the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionPayload {
    pub points: Vec<Value>,
    #[serde(alias = "polylines")]
    pub connections: Vec<Value>,
    #[serde(alias = "globalData")]
    pub network: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPoint {
    pub name: Option<Value>,
    pub coordinates: Option<Value>,
    pub lgd_code: Option<Value>,
    pub properties: Option<Value>,
    #[serde(rename = "type")]
    pub point_type: Option<Value>,
    pub id: Option<Value>,
    pub network_id: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub points: usize,
    pub skipped_points: usize,
    pub points_without_coordinates: usize,
    pub connections: usize,
    pub skipped_connections: usize,
}

/// Canonical point from one raw record. `None` when the record has no name
/// to be referenced by.
pub fn normalize_point(record: &Value) -> Option<Point> {
    // serde would read an array positionally, so only objects are records
    if !record.is_object() {
        warn!("skipping point record that is not an object: {}", record);
        return None;
    }
    let raw: RawPoint = match serde_json::from_value(record.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("skipping unreadable point record: {}", e);
            return None;
        }
    };

    let properties = parse_properties(raw.properties.as_ref());

    let Some(name) = raw
        .name
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(&properties, "name"))
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
    else {
        warn!("skipping point without a name");
        return None;
    };

    // some exports carry lat/lng on the record instead of a coordinates field
    let coordinates = match &raw.coordinates {
        Some(c) => normalize_pair(c),
        None => normalize_pair(record),
    };

    let lgd_code = raw
        .lgd_code
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(&properties, "lgd_code"))
        .filter(|c| !is_null_code(c));

    let point_type = raw
        .point_type
        .as_ref()
        .and_then(value_as_string)
        .or_else(|| property_str(&properties, "type"))
        .unwrap_or_else(|| DEFAULT_POINT_TYPE.to_string());

    Some(Point {
        name,
        coordinates,
        lgd_code,
        properties,
        point_type,
        id: raw.id.as_ref().and_then(value_as_string),
        network_id: raw.network_id.as_ref().and_then(value_as_string),
    })
}

pub fn parse_payload(bytes: &[u8]) -> Result<IngestionPayload, IngestError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub async fn read_payload(path: &Path) -> Result<IngestionPayload, IngestError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| IngestError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_payload(&bytes)
}

fn decode_connection(record: &Value) -> Option<RawConnection> {
    if !record.is_object() {
        warn!("skipping connection record that is not an object: {}", record);
        return None;
    }
    serde_json::from_value(record.clone())
        .inspect_err(|e| warn!("skipping unreadable connection record: {}", e))
        .ok()
}

/// Normalize every record and assemble the graph.
pub fn build_network(payload: &IngestionPayload) -> (NetworkGraph, IngestStats) {
    let mut stats = IngestStats::default();
    let mut seen = AHashSet::new();

    let mut points: Vec<Point> = Vec::with_capacity(payload.points.len());
    for record in &payload.points {
        let Some(point) = normalize_point(record) else {
            stats.skipped_points += 1;
            continue;
        };
        if !seen.insert(point.name.to_lowercase()) {
            warn!("duplicate point name '{}', lookups keep the first", point.name);
        }
        if is_sentinel(&point.coordinates) {
            stats.points_without_coordinates += 1;
        }
        points.push(point);
    }
    stats.points = points.len();

    let meta = NetworkMeta::from_value(&payload.network);
    let mut graph = NetworkGraph::new(points, meta);
    let points = graph.point_list();

    let connections: Vec<_> = payload
        .connections
        .iter()
        .filter_map(|record| match decode_connection(record) {
            Some(raw) => Some(normalize_connection(&raw, graph.index(), &points, graph.meta())),
            None => {
                stats.skipped_connections += 1;
                None
            }
        })
        .collect();

    stats.connections = connections.len();
    for connection in connections {
        graph.insert_connection(connection);
    }

    info!(
        "ingested {} points and {} connections ({} unresolved endpoints)",
        stats.points,
        stats.connections,
        graph.unresolved().len()
    );

    (graph, stats)
}

/// Send point and connection files to the upload service and return the
/// network it extracted.
pub async fn upload_network_files(
    client: &reqwest::Client,
    base_url: &str,
    points_file: &Path,
    connections_file: &Path,
) -> Result<IngestionPayload, IngestError> {
    let mut form = reqwest::multipart::Form::new();

    for (field, path) in [("points", points_file), ("connections", connections_file)] {
        let bytes = tokio::fs::read(path).await.map_err(|source| IngestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(field)
            .to_string();
        form = form.part(field, reqwest::multipart::Part::bytes(bytes).file_name(file_name));
    }

    let url = format!("{}/upload", base_url.trim_end_matches('/'));
    let response = client.post(&url).multipart(form).send().await?;

    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(IngestError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    parse_payload(&body)
}
