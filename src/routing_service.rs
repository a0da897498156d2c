// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Client for the external path-finding service.
//!
//! The service speaks `[lat, lng]`; everything leaving this module is `[lng, lat]`.

use crate::LngLat;
use crate::coordinates::{CoordinateOrder, normalize_path_with_order, path_length_km};
use crate::properties::value_as_f64;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// The service never returns more alternatives than this.
pub const MAX_CANDIDATES: usize = 3;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("routing request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("routing service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode routing response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteCandidate {
    pub path: Vec<LngLat>,
    pub distance_km: f64,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(default)]
    route: Value,
    #[serde(default)]
    distance: Value,
}

#[derive(Debug, Serialize)]
struct LatLngBody {
    lat: f64,
    lng: f64,
}

impl From<&LngLat> for LatLngBody {
    fn from(c: &LngLat) -> Self {
        Self { lat: c[1], lng: c[0] }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComputeRouteBody {
    new_pos: LatLngBody,
    origin: LatLngBody,
    destination: LatLngBody,
}

#[allow(async_fn_in_trait)]
pub trait RoutingService {
    /// Up to [`MAX_CANDIDATES`] alternative paths between two points.
    async fn show_route(&self, from: LngLat, to: LngLat)
    -> Result<Vec<RouteCandidate>, RoutingError>;

    /// Path from `origin` through `moved` to `destination`. `Ok(None)` when the
    /// service found no route.
    async fn compute_route(
        &self,
        moved: LngLat,
        origin: LngLat,
        destination: LngLat,
    ) -> Result<Option<RouteCandidate>, RoutingError>;
}

#[derive(Clone, Debug)]
pub struct HttpRoutingService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRoutingService {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn read_routes(response: reqwest::Response) -> Result<Vec<RouteCandidate>, RoutingError> {
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(RoutingError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        decode_routes(&body)
    }
}

/// Decode `[{route: [[lat, lng], ...], distance}]`. Entries without a usable
/// path are skipped.
pub fn decode_routes(body: &[u8]) -> Result<Vec<RouteCandidate>, RoutingError> {
    let raw: Vec<RawRoute> = serde_json::from_slice(body)?;

    let candidates = raw
        .into_iter()
        .filter_map(|r| {
            let path = normalize_path_with_order(&r.route, CoordinateOrder::LatLng);
            if path.is_empty() {
                warn!("routing service returned a route without geometry");
                return None;
            }
            let distance_km = value_as_f64(&r.distance).unwrap_or_else(|| path_length_km(&path));
            Some(RouteCandidate { path, distance_km })
        })
        .take(MAX_CANDIDATES)
        .collect();

    Ok(candidates)
}

impl RoutingService for HttpRoutingService {
    async fn show_route(
        &self,
        from: LngLat,
        to: LngLat,
    ) -> Result<Vec<RouteCandidate>, RoutingError> {
        let url = format!("{}/show-route", self.base_url);
        debug!("requesting candidates {:?} -> {:?}", from, to);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat1", from[1]),
                ("lng1", from[0]),
                ("lat2", to[1]),
                ("lng2", to[0]),
            ])
            .send()
            .await?;

        Self::read_routes(response).await
    }

    async fn compute_route(
        &self,
        moved: LngLat,
        origin: LngLat,
        destination: LngLat,
    ) -> Result<Option<RouteCandidate>, RoutingError> {
        let url = format!("{}/compute-route", self.base_url);
        let body = ComputeRouteBody {
            new_pos: (&moved).into(),
            origin: (&origin).into(),
            destination: (&destination).into(),
        };

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&body)?)
            .send()
            .await?;

        Ok(Self::read_routes(response).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_lat_lng_routes() {
        let body = br#"[
            {"route": [[28.0, 77.0], [28.1, 77.1]], "distance": 15.2},
            {"route": "[[28.0, 77.0], [28.2, 77.0], [28.1, 77.1]]", "distance": "19.0"},
            {"route": [], "distance": 1},
            {"route": [[28.0, 77.0], [28.1, 77.1]]},
            {"route": [[28.0, 77.0], [28.1, 77.1]], "distance": 3}
        ]"#;
        let routes = decode_routes(body).unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].path, vec![[77.0, 28.0], [77.1, 28.1]]);
        assert_eq!(routes[0].distance_km, 15.2);
        assert_eq!(routes[1].distance_km, 19.0);
        assert!(routes[2].distance_km > 0.0);
    }

    #[test]
    fn garbage_body_is_an_error() {
        assert!(matches!(
            decode_routes(b"<html>"),
            Err(RoutingError::Decode(_))
        ));
    }

    #[test]
    fn compute_body_uses_lat_lng_objects() {
        let body = ComputeRouteBody {
            new_pos: (&[77.5, 28.5]).into(),
            origin: (&[77.0, 28.0]).into(),
            destination: (&[78.0, 29.0]).into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["newPos"]["lat"], 28.5);
        assert_eq!(json["origin"]["lng"], 77.0);
    }
}
