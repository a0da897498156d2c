// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use crate::persistence::{MAX_DOWNLOAD_PAYLOAD_BYTES, UserIdentity};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a whole number of bytes, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

/// Where the planner's collaborating services live and who is using it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub routing_base_url: String,
    pub persistence_base_url: String,
    pub upload_base_url: String,
    pub download_dir: PathBuf,
    pub user: UserIdentity,
    pub max_download_bytes: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            routing_base_url: "http://localhost:5000".to_string(),
            persistence_base_url: "http://localhost:5000".to_string(),
            upload_base_url: "http://localhost:5000".to_string(),
            download_dir: PathBuf::from("downloads"),
            user: UserIdentity::default(),
            max_download_bytes: MAX_DOWNLOAD_PAYLOAD_BYTES,
        }
    }
}

impl PlannerConfig {
    /// Defaults overridden by whatever is set in the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ROUTING_BASE_URL") {
            config.routing_base_url = v;
        }
        if let Some(v) = get("PERSISTENCE_BASE_URL") {
            config.persistence_base_url = v;
        }
        if let Some(v) = get("UPLOAD_BASE_URL") {
            config.upload_base_url = v;
        }
        if let Some(v) = get("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PLANNER_USER_ID") {
            config.user.user_id = v;
        }
        if let Some(v) = get("PLANNER_USER_NAME") {
            config.user.user_name = v;
        }
        if let Some(v) = get("MAX_DOWNLOAD_BYTES") {
            config.max_download_bytes =
                v.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber {
                        key: "MAX_DOWNLOAD_BYTES",
                        value: v.clone(),
                    })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: AHashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = PlannerConfig::from_lookup(lookup(&[
            ("ROUTING_BASE_URL", "http://router:8000"),
            ("PLANNER_USER_ID", "7"),
            ("DOWNLOAD_DIR", "/srv/exports"),
            ("MAX_DOWNLOAD_BYTES", "1024"),
            ("UPLOAD_BASE_URL", "   "),
        ]))
        .unwrap();

        assert_eq!(config.routing_base_url, "http://router:8000");
        assert_eq!(config.user.user_id, "7");
        assert_eq!(config.download_dir, PathBuf::from("/srv/exports"));
        assert_eq!(config.max_download_bytes, 1024);
        assert_eq!(config.upload_base_url, PlannerConfig::default().upload_base_url);
    }

    #[test]
    fn bad_size_is_an_error() {
        let err = PlannerConfig::from_lookup(lookup(&[("MAX_DOWNLOAD_BYTES", "50MB")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                key: "MAX_DOWNLOAD_BYTES",
                value: "50MB".to_string()
            }
        );
    }

    #[test]
    fn partial_json_config() {
        let config: PlannerConfig =
            serde_json::from_str(r#"{"routing_base_url": "http://r", "user": {"user_id": "1", "user_name": "a"}}"#)
                .unwrap();
        assert_eq!(config.routing_base_url, "http://r");
        assert_eq!(config.max_download_bytes, MAX_DOWNLOAD_PAYLOAD_BYTES);
    }
}
