//! Source side: read access to an MLflow tracking server.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

mod api;
mod entities;

pub use api::MlflowClient;
pub use entities::{Experiment, FileInfo, KeyValue, Metric, Page, Run, RunData, RunInfo, ViewType};

pub const DEFAULT_TRACKING_URI: &str = "http://localhost:5000";

/// `name` below the artifact directory `artifact_path`, or at the root when none is given.
pub fn join_artifact_path(artifact_path: Option<&str>, name: &str) -> String {
    match artifact_path
        .map(|path| path.trim_matches('/'))
        .filter(|path| !path.is_empty())
    {
        Some(path) => format!("{path}/{name}"),
        None => name.to_string(),
    }
}

/// Read operations the exporter needs from the source backend.
#[async_trait]
pub trait TrackingSource: Send + Sync {
    async fn search_experiments(
        &self,
        view_type: ViewType,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Experiment>>;

    async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment>;

    async fn search_runs(
        &self,
        experiment_ids: &[String],
        run_view_type: ViewType,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Run>>;

    /// Every recorded sample of `key`, in the order the server returns them.
    async fn get_metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>>;

    /// Artifacts directly under `path` (the artifact root when `None`).
    async fn list_artifacts(&self, run_id: &str, path: Option<&str>) -> Result<Vec<FileInfo>>;

    /// Download the artifact at `path` (file or directory tree) below `dst_dir`,
    /// returning the local path that mirrors `path`.
    async fn download_artifacts(&self, run_id: &str, path: &str, dst_dir: &Path) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_prefixes_the_name() {
        assert_eq!(join_artifact_path(None, "loss.png"), "loss.png");
        assert_eq!(join_artifact_path(Some(""), "loss.png"), "loss.png");
        assert_eq!(join_artifact_path(Some("plots/"), "loss.png"), "plots/loss.png");
        assert_eq!(join_artifact_path(Some("a/b"), "c/d.txt"), "a/b/c/d.txt");
    }
}
