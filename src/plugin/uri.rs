use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::neptune::RunMode;

pub const PLUGIN_SCHEME: &str = "neptune";
pub const DEFAULT_HOST: &str = "track";

/// Keys callers may put in a URI that the connector always assigns itself.
const IGNORED_KEYS: &[(&str, &str)] = &[("custom_run_id", "custom_run_id"), ("with_id", "run id")];

#[derive(Debug, Error)]
pub enum UriError {
    #[error("expected a {PLUGIN_SCHEME}:// URI, got '{0}'")]
    Scheme(String),
    #[error("the URI carries no configuration")]
    EmptyPayload,
    #[error("the URI payload is not valid base64")]
    Base64,
    #[error("the URI payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Options for the Neptune run opened for every relayed MLflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NeptuneRunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_stdout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_stderr: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_hardware_metrics: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_namespace: Option<String>,
    /// Seconds between background flushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_period: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_traceback: Option<bool>,
}

pub fn encode_config<T: Serialize>(config: &T) -> Result<String, UriError> {
    let json = serde_json::to_string(config)?;
    Ok(format!(
        "{PLUGIN_SCHEME}://{DEFAULT_HOST}/{}",
        URL_SAFE_NO_PAD.encode(json)
    ))
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, UriError> {
    URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(payload))
        .map_err(|_| UriError::Base64)
}

/// Decode the JSON object carried by a plugin URI.
pub fn decode_config(uri: &str) -> Result<Map<String, Value>, UriError> {
    let rest = uri
        .strip_prefix(PLUGIN_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .ok_or_else(|| UriError::Scheme(uri.to_string()))?;
    // Everything after the host is payload; standard base64 may contain '/'.
    let payload = rest
        .split_once('/')
        .map(|(_, payload)| payload)
        .unwrap_or_default()
        .trim();
    if payload.is_empty() {
        return Err(UriError::EmptyPayload);
    }
    let bytes = decode_base64(payload)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Drop run-identity overrides, warning about each one. Returns the keys removed.
pub fn strip_ignored_keys(config: &mut Map<String, Value>) -> Vec<String> {
    let mut removed = Vec::new();
    for (key, label) in IGNORED_KEYS {
        if let Some(value) = config.remove(*key) {
            tracing::warn!("Passed {label} '{value}' will be ignored.");
            removed.push(key.to_string());
        }
    }
    removed
}

fn from_map<T: DeserializeOwned>(config: Map<String, Value>) -> Result<T, UriError> {
    Ok(serde_json::from_value(Value::Object(config))?)
}

pub fn parse_run_config(uri: &str) -> Result<NeptuneRunConfig, UriError> {
    let mut config = decode_config(uri)?;
    strip_ignored_keys(&mut config);
    from_map(config)
}
