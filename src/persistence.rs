// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Save, verify-and-save and download of a planned network against the backend.
//!
//! Every call is single-shot. Nothing here mutates the graph.

use crate::network_graph::{LoopEntry, NetworkGraph, RouteSnapshot};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub const MAX_DOWNLOAD_PAYLOAD_BYTES: usize = 50 * 1024 * 1024;

lazy_static! {
    static ref CONTENT_DISPOSITION_FILENAME: Regex =
        Regex::new(r#"filename\*?=(?:UTF-8'')?"?([^";]+)"?"#).unwrap();
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not encode network: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not write download: {0}")]
    Io(#[from] std::io::Error),
    #[error("network is too large to download ({size} bytes, limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadFormat {
    Kml,
    Csv,
}

impl DownloadFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DownloadFormat::Kml => "kml",
            DownloadFormat::Csv => "csv",
        }
    }
}

impl std::str::FromStr for DownloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kml" => Ok(DownloadFormat::Kml),
            "csv" => Ok(DownloadFormat::Csv),
            other => Err(format!("unknown download format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Error,
}

/// What the operator is told after a persistence call.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub dismiss_after: Duration,
}

impl Notification {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            message: message.into(),
            dismiss_after: Duration::from_secs(5),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: message.into(),
            dismiss_after: Duration::from_secs(10),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == NotificationKind::Success
    }

    fn from_result(result: Result<String, PersistenceError>) -> Self {
        match result {
            Ok(message) => {
                info!("{}", message);
                Notification::success(message)
            }
            Err(e) => {
                error!("{}", e);
                Notification::error(e.to_string())
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GlobalData<'a> {
    #[serde(rename = "loop")]
    pub loop_entries: &'a [LoopEntry],
    #[serde(rename = "mainPointName")]
    pub main_point_name: Option<&'a str>,
    #[serde(rename = "totalLength")]
    pub total_length: f64,
    pub proposedlength: f64,
    pub existinglength: f64,
    pub state_code: Option<&'a str>,
    pub district_code: Option<&'a str>,
    pub block_code: Option<&'a str>,
}

/// Body shared by all three endpoints.
#[derive(Debug, Serialize)]
pub struct NetworkPayload<'a> {
    #[serde(rename = "globalData")]
    pub global_data: GlobalData<'a>,
    #[serde(rename = "polylineHistory")]
    pub polyline_history: BTreeMap<String, &'a [RouteSnapshot]>,
    pub user_id: &'a str,
    pub user_name: &'a str,
}

impl<'a> NetworkPayload<'a> {
    pub fn new(graph: &'a NetworkGraph, user: &'a UserIdentity) -> Self {
        let meta = graph.meta();
        Self {
            global_data: GlobalData {
                loop_entries: graph.loop_entries(),
                main_point_name: graph.main_point_name(),
                total_length: graph.total_length(),
                proposedlength: graph.proposed_length(),
                existinglength: graph.existing_length(),
                state_code: meta.state_code.as_deref(),
                district_code: meta.district_code.as_deref(),
                block_code: meta.block_code.as_deref(),
            },
            polyline_history: graph
                .segments()
                .iter()
                .filter(|(_, detail)| !detail.history().is_empty())
                .map(|(key, detail)| (key.to_string(), detail.history()))
                .collect(),
            user_id: &user.user_id,
            user_name: &user.user_name,
        }
    }
}

/// Pull the file name out of a `Content-Disposition` header. Directory parts
/// are stripped.
pub fn filename_from_disposition(header: Option<&str>) -> Option<String> {
    let caps = CONTENT_DISPOSITION_FILENAME.captures(header?)?;
    let raw = caps.get(1)?.as_str().trim();
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

#[allow(async_fn_in_trait)]
pub trait PersistenceGateway {
    async fn save(&self, graph: &NetworkGraph, user: &UserIdentity) -> Notification;

    async fn verify_and_save(&self, graph: &NetworkGraph, user: &UserIdentity) -> Notification;

    async fn download(
        &self,
        graph: &NetworkGraph,
        user: &UserIdentity,
        format: DownloadFormat,
    ) -> Notification;
}

#[derive(Clone, Debug)]
pub struct HttpPersistenceGateway {
    client: reqwest::Client,
    base_url: String,
    download_dir: PathBuf,
    max_payload_bytes: usize,
}

impl HttpPersistenceGateway {
    pub fn new(base_url: &str, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            download_dir: download_dir.into(),
            max_payload_bytes: MAX_DOWNLOAD_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Encode a download body, refusing it when it is over the size limit.
    pub fn prepare_download(
        &self,
        graph: &NetworkGraph,
        user: &UserIdentity,
    ) -> Result<Vec<u8>, PersistenceError> {
        let body = serde_json::to_vec(&NetworkPayload::new(graph, user))?;
        if body.len() > self.max_payload_bytes {
            return Err(PersistenceError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(body)
    }

    async fn post(&self, endpoint: &str, body: Vec<u8>) -> Result<reqwest::Response, PersistenceError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn store(
        &self,
        endpoint: &str,
        graph: &NetworkGraph,
        user: &UserIdentity,
        done: &str,
    ) -> Result<String, PersistenceError> {
        let body = serde_json::to_vec(&NetworkPayload::new(graph, user))?;
        let response = self.post(endpoint, body).await?;
        let bytes = response.bytes().await?;

        let message = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| done.to_string());
        Ok(message)
    }

    async fn fetch_download(
        &self,
        graph: &NetworkGraph,
        user: &UserIdentity,
        format: DownloadFormat,
    ) -> Result<String, PersistenceError> {
        let body = self.prepare_download(graph, user)?;
        let response = self
            .post(&format!("download/{}", format.extension()), body)
            .await?;

        let file_name = filename_from_disposition(
            response
                .headers()
                .get(reqwest::header::CONTENT_DISPOSITION)
                .and_then(|h| h.to_str().ok()),
        )
        .unwrap_or_else(|| format!("network.{}", format.extension()));

        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let target = self.download_dir.join(file_name);
        tokio::fs::write(&target, &bytes).await?;

        Ok(format!("downloaded {} bytes to {}", bytes.len(), target.display()))
    }
}

impl PersistenceGateway for HttpPersistenceGateway {
    async fn save(&self, graph: &NetworkGraph, user: &UserIdentity) -> Notification {
        Notification::from_result(self.store("save-kml", graph, user, "network saved").await)
    }

    async fn verify_and_save(&self, graph: &NetworkGraph, user: &UserIdentity) -> Notification {
        Notification::from_result(
            self.store("save-to-db", graph, user, "network verified and saved")
                .await,
        )
    }

    async fn download(
        &self,
        graph: &NetworkGraph,
        user: &UserIdentity,
        format: DownloadFormat,
    ) -> Notification {
        Notification::from_result(self.fetch_download(graph, user, format).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, NetworkMeta, Point, PointRef};
    use crate::point_index::MatchStrategy;
    use crate::properties::PropertyMap;

    fn point(name: &str, coordinates: [f64; 2]) -> Point {
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

    fn graph() -> NetworkGraph {
        let meta = NetworkMeta {
            main_point_name: Some("Block HQ".to_string()),
            state_code: Some("09".to_string()),
            block_code: Some("B-17".to_string()),
            ..Default::default()
        };
        let mut g = NetworkGraph::new(
            vec![point("Block HQ", [77.0, 28.0]), point("Rampur", [77.1, 28.0])],
            meta,
        );
        let path = vec![[77.0, 28.0], [77.1, 28.0]];
        let key = g.insert_connection(Connection {
            start: PointRef::resolved(crate::models::PointId(0), MatchStrategy::ExactName),
            end: PointRef::resolved(crate::models::PointId(1), MatchStrategy::ExactName),
            start_name: "Block HQ".to_string(),
            end_name: "Rampur".to_string(),
            length_km: crate::coordinates::path_length_km(&path),
            path,
            existing: false,
            color: crate::PROPOSED_COLOR.to_string(),
            properties: PropertyMap::new(),
        });
        g.commit_path_edit(&key, vec![[77.0, 28.0], [77.05, 28.01], [77.1, 28.0]], 0.0)
            .unwrap();
        g
    }

    fn user() -> UserIdentity {
        UserIdentity {
            user_id: "42".to_string(),
            user_name: "surveyor".to_string(),
        }
    }

    #[test]
    fn payload_shape() {
        let g = graph();
        let u = user();
        let json = serde_json::to_value(NetworkPayload::new(&g, &u)).unwrap();

        let global = &json["globalData"];
        assert_eq!(global["loop"].as_array().unwrap().len(), 2);
        assert_eq!(global["mainPointName"], "Block HQ");
        assert_eq!(global["state_code"], "09");
        assert_eq!(global["district_code"], Value::Null);
        assert!(global["totalLength"].as_f64().unwrap() > 0.0);
        assert_eq!(global["existinglength"], 0.0);

        let history = json["polylineHistory"]["Block HQ TO Rampur"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["path"].as_array().unwrap().len(), 2);

        assert_eq!(json["user_id"], "42");
        assert_eq!(json["user_name"], "surveyor");
    }

    #[test]
    fn oversize_download_rejected_locally() {
        let g = graph();
        let gateway = HttpPersistenceGateway::new("http://127.0.0.1:9", "/tmp").with_max_payload_bytes(16);
        assert!(matches!(
            gateway.prepare_download(&g, &user()),
            Err(PersistenceError::PayloadTooLarge { limit: 16, .. })
        ));

        let roomy = HttpPersistenceGateway::new("http://127.0.0.1:9", "/tmp");
        assert!(roomy.prepare_download(&g, &user()).is_ok());
    }

    #[tokio::test]
    async fn oversize_download_notifies_error() {
        let g = graph();
        let gateway = HttpPersistenceGateway::new("http://127.0.0.1:9", "/tmp").with_max_payload_bytes(16);
        let note = gateway.download(&g, &user(), DownloadFormat::Csv).await;
        assert_eq!(note.kind, NotificationKind::Error);
        assert_eq!(note.dismiss_after, Duration::from_secs(10));
        assert!(note.message.contains("too large"));
    }

    /// Answer exactly one request with a canned response. The join handle
    /// yields the request line that was received.
    async fn canned_server(
        status: &'static str,
        headers: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
                status,
                body.len(),
                headers,
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            String::from_utf8_lossy(&received)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        });

        (base, handle)
    }

    #[tokio::test]
    async fn save_posts_to_save_kml() {
        let g = graph();
        let segments_before = g.segments().clone();
        let (base, request) = canned_server("200 OK", "", r#"{"message": "stored 1 network"}"#).await;

        let gateway = HttpPersistenceGateway::new(&base, std::env::temp_dir());
        let note = gateway.save(&g, &user()).await;

        assert!(request.await.unwrap().starts_with("POST /save-kml "));
        assert_eq!(note.kind, NotificationKind::Success);
        assert_eq!(note.dismiss_after, Duration::from_secs(5));
        assert_eq!(note.message, "stored 1 network");
        assert_eq!(g.segments(), &segments_before);
    }

    #[tokio::test]
    async fn verify_and_save_failure_notifies_error() {
        let g = graph();
        let segments_before = g.segments().clone();
        let total_before = g.total_length();
        let (base, request) = canned_server("500 Internal Server Error", "", "duplicate block").await;

        let gateway = HttpPersistenceGateway::new(&base, std::env::temp_dir());
        let note = gateway.verify_and_save(&g, &user()).await;

        assert!(request.await.unwrap().starts_with("POST /save-to-db "));
        assert_eq!(note.kind, NotificationKind::Error);
        assert_eq!(note.dismiss_after, Duration::from_secs(10));
        assert!(note.message.contains("500"));
        assert!(note.message.contains("duplicate block"));
        assert_eq!(g.segments(), &segments_before);
        assert_eq!(g.total_length(), total_before);
    }

    #[tokio::test]
    async fn verify_and_save_without_message_uses_default() {
        let (base, request) = canned_server("200 OK", "", "ok").await;
        let gateway = HttpPersistenceGateway::new(&base, std::env::temp_dir());
        let note = gateway.verify_and_save(&graph(), &user()).await;
        assert!(request.await.unwrap().starts_with("POST /save-to-db "));
        assert_eq!(note.message, "network verified and saved");
    }

    #[tokio::test]
    async fn download_writes_named_file() {
        let dir = std::env::temp_dir().join(format!("fibreplan-dl-{}", std::process::id()));
        let (base, request) = canned_server(
            "200 OK",
            "Content-Disposition: attachment; filename=\"block_17.csv\"\r\n",
            "name,length\n",
        )
        .await;

        let gateway = HttpPersistenceGateway::new(&base, &dir);
        let note = gateway.download(&graph(), &user(), DownloadFormat::Csv).await;

        assert!(request.await.unwrap().starts_with("POST /download/csv "));
        assert!(note.is_success(), "{}", note.message);
        let written = tokio::fs::read_to_string(dir.join("block_17.csv")).await.unwrap();
        assert_eq!(written, "name,length\n");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn disposition_filenames() {
        assert_eq!(
            filename_from_disposition(Some("attachment; filename=\"block_17.kml\"")).as_deref(),
            Some("block_17.kml")
        );
        assert_eq!(
            filename_from_disposition(Some("attachment; filename=routes.csv")).as_deref(),
            Some("routes.csv")
        );
        assert_eq!(
            filename_from_disposition(Some("attachment; filename*=UTF-8''net.kml")).as_deref(),
            Some("net.kml")
        );
        assert_eq!(
            filename_from_disposition(Some("attachment; filename=\"../../etc/passwd\"")).as_deref(),
            Some("passwd")
        );
        assert_eq!(filename_from_disposition(Some("inline")), None);
        assert_eq!(filename_from_disposition(None), None);
    }

    #[test]
    fn formats() {
        assert_eq!("KML".parse::<DownloadFormat>().unwrap(), DownloadFormat::Kml);
        assert_eq!(DownloadFormat::Csv.extension(), "csv");
        assert!("pdf".parse::<DownloadFormat>().is_err());
        assert_eq!(Notification::success("ok").dismiss_after, Duration::from_secs(5));
    }
}
