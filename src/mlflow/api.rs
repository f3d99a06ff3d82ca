use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use urlencoding::encode;

use super::entities::{Experiment, FileInfo, KeyValue, Metric, Page, Run, ViewType};
use super::{join_artifact_path, TrackingSource};
use crate::http::ApiClient;
use crate::utils::{files_below, relative_slash_path};

const API_PREFIX: &str = "/api/2.0/mlflow";
const ARTIFACT_PROXY_PREFIX: &str = "/api/2.0/mlflow-artifacts/artifacts";
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:";
const METRIC_HISTORY_PAGE_SIZE: usize = 25_000;

#[derive(Debug, Serialize)]
struct SearchExperimentsRequest<'a> {
    max_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
    view_type: ViewType,
}

#[derive(Debug, Deserialize)]
struct SearchExperimentsResponse {
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: Experiment,
}

#[derive(Debug, Serialize)]
struct SearchRunsRequest<'a> {
    experiment_ids: &'a [String],
    run_view_type: ViewType,
    max_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<Run>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct MetricHistoryResponse {
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListArtifactsResponse {
    #[serde(default)]
    files: Vec<FileInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct LogMetricRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[derive(Debug, Serialize)]
struct KeyValueRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct LogBatchRequest<'a> {
    run_id: &'a str,
    metrics: &'a [Metric],
    params: &'a [KeyValue],
    tags: &'a [KeyValue],
}

#[derive(Debug, Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: &'a str,
    end_time: i64,
}

/// REST client for an MLflow tracking server.
#[derive(Debug, Clone)]
pub struct MlflowClient {
    api: ApiClient,
}

impl MlflowClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Build a client from a tracking URI, picking up MLflow's standard auth variables.
    pub fn from_tracking_uri(tracking_uri: &str) -> Result<Self> {
        let mut api = ApiClient::new(tracking_uri)?;
        if let Ok(token) = std::env::var("MLFLOW_TRACKING_TOKEN") {
            api = api.with_bearer_token(token);
        } else if let (Ok(username), Ok(password)) = (
            std::env::var("MLFLOW_TRACKING_USERNAME"),
            std::env::var("MLFLOW_TRACKING_PASSWORD"),
        ) {
            api = api.with_basic_auth(username, password);
        }
        Ok(Self::new(api))
    }

    pub async fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()> {
        let body = LogMetricRequest {
            run_id,
            key: &metric.key,
            value: metric.value,
            timestamp: metric.timestamp,
            step: metric.step,
        };
        self.api.post_unit(&endpoint("/runs/log-metric"), &body).await
    }

    pub async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let body = KeyValueRequest { run_id, key, value };
        self.api.post_unit(&endpoint("/runs/log-parameter"), &body).await
    }

    pub async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let body = KeyValueRequest { run_id, key, value };
        self.api.post_unit(&endpoint("/runs/set-tag"), &body).await
    }

    pub async fn log_batch(
        &self,
        run_id: &str,
        metrics: &[Metric],
        params: &[KeyValue],
        tags: &[KeyValue],
    ) -> Result<()> {
        let body = LogBatchRequest {
            run_id,
            metrics,
            params,
            tags,
        };
        self.api.post_unit(&endpoint("/runs/log-batch"), &body).await
    }

    pub async fn update_run(&self, run_id: &str, status: &str, end_time: i64) -> Result<()> {
        let body = UpdateRunRequest {
            run_id,
            status,
            end_time,
        };
        self.api.post_unit(&endpoint("/runs/update"), &body).await
    }

    /// Upload `local_file` as `<artifact_path>/<file name>` of the run.
    pub async fn log_artifact(
        &self,
        run_id: &str,
        local_file: &Path,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        let root = self.artifact_root(run_id).await?;
        let name = local_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("{} has no file name", local_file.display()))?;
        self.put_artifact(&root, &join_artifact_path(artifact_path, name), local_file)
            .await
    }

    /// Upload the contents of `local_dir` below `artifact_path` of the run.
    pub async fn log_artifacts(
        &self,
        run_id: &str,
        local_dir: &Path,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        let root = self.artifact_root(run_id).await?;
        for file in files_below(local_dir)? {
            let relative = relative_slash_path(&file, local_dir)?;
            self.put_artifact(&root, &join_artifact_path(artifact_path, &relative), &file)
                .await?;
        }
        Ok(())
    }

    /// The run's artifact location below the tracking server's artifact proxy.
    async fn artifact_root(&self, run_id: &str) -> Result<String> {
        let path = endpoint(&format!("/runs/get?run_id={}", encode(run_id)));
        let response: GetRunResponse = self
            .api
            .get(&path)
            .await
            .with_context(|| format!("failed to get MLflow run {run_id}"))?;
        let uri = response.run.info.artifact_uri.unwrap_or_default();
        proxied_artifact_path(&uri).map(str::to_string).ok_or_else(|| {
            anyhow!("artifacts of run {run_id} are stored at '{uri}', which the tracking server does not serve")
        })
    }

    async fn put_artifact(&self, root: &str, relative: &str, local_file: &Path) -> Result<()> {
        let bytes = tokio::fs::read(local_file)
            .await
            .with_context(|| format!("failed to read {}", local_file.display()))?;
        let path = format!(
            "{ARTIFACT_PROXY_PREFIX}/{}",
            encode_segments(&format!("{root}/{relative}"))
        );
        self.api
            .put_bytes(&path, bytes)
            .await
            .with_context(|| format!("failed to upload artifact '{relative}'"))
    }

    async fn list_artifacts_page(
        &self,
        run_id: &str,
        path: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<Page<FileInfo>> {
        let mut query = format!("/artifacts/list?run_id={}", encode(run_id));
        if let Some(path) = path {
            query.push_str(&format!("&path={}", encode(path)));
        }
        if let Some(token) = page_token {
            query.push_str(&format!("&page_token={}", encode(token)));
        }
        let response: ListArtifactsResponse = self.api.get(&endpoint(&query)).await?;
        Ok(Page::new(response.files, response.next_page_token))
    }

    async fn download_file(&self, run_id: &str, path: &str, dest: &Path) -> Result<u64> {
        let query = format!("/get-artifact?path={}&run_uuid={}", encode(path), encode(run_id));
        self.api
            .download(&query, dest)
            .await
            .with_context(|| format!("failed to download artifact '{path}' of run {run_id}"))
    }
}

fn endpoint(path: &str) -> String {
    format!("{API_PREFIX}{path}")
}

/// Path of an `mlflow-artifacts:` URI, with or without an authority.
fn proxied_artifact_path(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix(PROXIED_ARTIFACT_SCHEME)?;
    let path = match rest.strip_prefix("//") {
        Some(authority_and_path) => authority_and_path.split_once('/')?.1,
        None => rest,
    };
    Some(path.trim_matches('/'))
}

fn encode_segments(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Where an artifact path reported by the server lands below `dst_dir`.
/// Absolute paths and `..` would leave the scratch directory.
fn local_artifact_path(dst_dir: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    let is_plain = relative.components().next().is_some()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !is_plain {
        bail!("refusing artifact path '{path}' outside the download directory");
    }
    Ok(dst_dir.join(relative))
}

#[async_trait]
impl TrackingSource for MlflowClient {
    async fn search_experiments(
        &self,
        view_type: ViewType,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Experiment>> {
        let body = SearchExperimentsRequest {
            max_results,
            page_token,
            view_type,
        };
        let response: SearchExperimentsResponse = self
            .api
            .post(&endpoint("/experiments/search"), &body)
            .await
            .context("failed to search MLflow experiments")?;
        Ok(Page::new(response.experiments, response.next_page_token))
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let path = endpoint(&format!("/experiments/get?experiment_id={}", encode(experiment_id)));
        let response: GetExperimentResponse = self
            .api
            .get(&path)
            .await
            .with_context(|| format!("failed to get MLflow experiment {experiment_id}"))?;
        Ok(response.experiment)
    }

    async fn search_runs(
        &self,
        experiment_ids: &[String],
        run_view_type: ViewType,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Run>> {
        let body = SearchRunsRequest {
            experiment_ids,
            run_view_type,
            max_results,
            page_token,
        };
        let response: SearchRunsResponse = self
            .api
            .post(&endpoint("/runs/search"), &body)
            .await
            .context("failed to search MLflow runs")?;
        Ok(Page::new(response.runs, response.next_page_token))
    }

    async fn get_metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>> {
        let mut metrics = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = format!(
                "/metrics/get-history?run_id={}&metric_key={}&max_results={METRIC_HISTORY_PAGE_SIZE}",
                encode(run_id),
                encode(key)
            );
            if let Some(token) = &page_token {
                query.push_str(&format!("&page_token={}", encode(token)));
            }
            let response: MetricHistoryResponse = self
                .api
                .get(&endpoint(&query))
                .await
                .with_context(|| format!("failed to get history of metric '{key}'"))?;
            metrics.extend(response.metrics);
            match response.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(metrics),
            }
        }
    }

    async fn list_artifacts(&self, run_id: &str, path: Option<&str>) -> Result<Vec<FileInfo>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_artifacts_page(run_id, path, page_token.as_deref())
                .await
                .with_context(|| format!("failed to list artifacts of run {run_id}"))?;
            files.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(files),
            }
        }
    }

    async fn download_artifacts(&self, run_id: &str, path: &str, dst_dir: &Path) -> Result<PathBuf> {
        let local_root = local_artifact_path(dst_dir, path)?;
        let listing = self.list_artifacts(run_id, Some(path)).await?;

        // Listing a file path returns nothing (or the file itself).
        let is_single_file = listing.is_empty() || (listing.len() == 1 && listing[0].path == path);
        if is_single_file {
            self.download_file(run_id, path, &local_root).await?;
            return Ok(local_root);
        }

        tokio::fs::create_dir_all(&local_root)
            .await
            .with_context(|| format!("failed to create {}", local_root.display()))?;
        let mut pending = listing;
        while let Some(entry) = pending.pop() {
            let local_path = local_artifact_path(dst_dir, &entry.path)?;
            if entry.is_dir {
                tokio::fs::create_dir_all(&local_path)
                    .await
                    .with_context(|| format!("failed to create {}", local_path.display()))?;
                pending.extend(self.list_artifacts(run_id, Some(&entry.path)).await?);
            } else {
                self.download_file(run_id, &entry.path, &local_path).await?;
            }
        }
        Ok(local_root)
    }
}
