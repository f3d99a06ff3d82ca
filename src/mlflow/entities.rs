use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// MLflow encodes int64 fields either as JSON numbers or as strings.
fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(value)) => Ok(Some(value)),
        Some(NumberOrString::String(value)) if value.is_empty() => Ok(None),
        Some(NumberOrString::String(value)) => value
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_i64(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

fn to_map(pairs: &[KeyValue]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|pair| (pair.key.clone(), pair.value.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artifact_location: Option<String>,
    #[serde(default)]
    pub lifecycle_stage: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub creation_time: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub last_update_time: Option<i64>,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

impl Experiment {
    pub fn tag_map(&self) -> BTreeMap<String, String> {
        to_map(&self.tags)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub lifecycle_stage: Option<String>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub start_time: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    #[serde(default, deserialize_with = "de_i64")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "de_i64")]
    pub step: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    /// Latest value per metric key; the full series comes from the metric history.
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

impl RunData {
    pub fn param_map(&self) -> BTreeMap<String, String> {
        to_map(&self.params)
    }

    pub fn tag_map(&self) -> BTreeMap<String, String> {
        to_map(&self.tags)
    }

    /// Distinct metric keys, in first-seen order.
    pub fn metric_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            if !keys.contains(&metric.key.as_str()) {
                keys.push(&metric.key);
            }
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    #[serde(default)]
    pub data: RunData,
}

impl Run {
    /// Name shown to the operator; falls back to the run id for unnamed runs.
    pub fn display_name(&self) -> &str {
        self.info
            .run_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.info.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewType {
    ActiveOnly,
    All,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_page_token: Option<String>) -> Self {
        Self {
            items,
            next_page_token: next_page_token.filter(|token| !token.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_accepts_string_encoded_timestamps() {
        let experiment: Experiment = serde_json::from_str(
            r#"{
                "experiment_id": "1",
                "name": "baseline",
                "creation_time": "1683197418954",
                "last_update_time": 1683197419000,
                "tags": [{"key": "team", "value": "vision"}]
            }"#,
        )
        .unwrap();

        assert_eq!(experiment.creation_time, Some(1683197418954));
        assert_eq!(experiment.last_update_time, Some(1683197419000));
        assert_eq!(experiment.tag_map().get("team").map(String::as_str), Some("vision"));
    }

    #[test]
    fn experiment_without_timestamps_deserializes() {
        let experiment: Experiment =
            serde_json::from_str(r#"{"experiment_id": "0", "name": "Default"}"#).unwrap();
        assert_eq!(experiment.creation_time, None);
        assert_eq!(experiment.last_update_time, None);
        assert!(experiment.tags.is_empty());
    }

    #[test]
    fn run_without_data_section_deserializes() {
        let run: Run = serde_json::from_str(
            r#"{"info": {"run_id": "abc", "experiment_id": "1", "status": "FINISHED", "start_time": "10"}}"#,
        )
        .unwrap();
        assert_eq!(run.info.start_time, Some(10));
        assert_eq!(run.info.end_time, None);
        assert!(run.data.metrics.is_empty());
    }

    #[test]
    fn display_name_falls_back_to_run_id() {
        let run: Run = serde_json::from_str(
            r#"{"info": {"run_id": "abc", "experiment_id": "1", "run_name": ""}}"#,
        )
        .unwrap();
        assert_eq!(run.display_name(), "abc");
    }

    #[test]
    fn metric_keys_are_distinct_in_order() {
        let data: RunData = serde_json::from_str(
            r#"{"metrics": [
                {"key": "loss", "value": 0.2, "timestamp": 1, "step": 2},
                {"key": "acc", "value": 0.9, "timestamp": 1, "step": 2},
                {"key": "loss", "value": 0.1, "timestamp": 2, "step": 3}
            ]}"#,
        )
        .unwrap();
        assert_eq!(data.metric_keys(), vec!["loss", "acc"]);
    }

    #[test]
    fn directory_listing_has_no_size() {
        let info: FileInfo = serde_json::from_str(r#"{"path": "model", "is_dir": true}"#).unwrap();
        assert!(info.is_dir);
        assert_eq!(info.file_size, None);
    }

    #[test]
    fn empty_page_token_means_last_page() {
        let page: Page<u8> = Page::new(vec![1], Some(String::new()));
        assert_eq!(page.next_page_token, None);
    }

    #[test]
    fn view_type_serializes_as_mlflow_enum() {
        assert_eq!(serde_json::to_string(&ViewType::ActiveOnly).unwrap(), "\"ACTIVE_ONLY\"");
        assert_eq!(serde_json::to_string(&ViewType::All).unwrap(), "\"ALL\"");
    }
}
