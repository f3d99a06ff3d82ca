//! In-memory stand-ins for both backends.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::export::report::{Reporter, SyncEvent};
use crate::mlflow::{
    Experiment, FileInfo, KeyValue, Metric, Page, Run, RunData, RunInfo, TrackingSource, ViewType,
};
use crate::neptune::{
    DestinationProject, DestinationRun, FieldValue, RunsTable, SeriesPoint, CUSTOM_RUN_ID_COLUMN,
};

pub fn experiment(id: &str, name: &str) -> Experiment {
    Experiment {
        experiment_id: id.to_string(),
        name: name.to_string(),
        artifact_location: None,
        lifecycle_stage: Some("active".to_string()),
        creation_time: None,
        last_update_time: None,
        tags: Vec::new(),
    }
}

pub fn run(id: &str, experiment_id: &str) -> Run {
    Run {
        info: RunInfo {
            run_id: id.to_string(),
            experiment_id: experiment_id.to_string(),
            run_name: Some(format!("name-{id}")),
            user_id: Some("alice".to_string()),
            status: Some("FINISHED".to_string()),
            lifecycle_stage: Some("active".to_string()),
            artifact_uri: Some(format!("mlflow-artifacts:/{experiment_id}/{id}/artifacts")),
            start_time: None,
            end_time: None,
        },
        data: RunData::default(),
    }
}

pub fn metric(key: &str, value: f64, timestamp: i64, step: i64) -> Metric {
    Metric {
        key: key.to_string(),
        value,
        timestamp,
        step,
    }
}

pub fn key_value(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn page<T: Clone>(items: &[T], max_results: usize, token: Option<&str>) -> Result<Page<T>> {
    let start = token.map(str::parse::<usize>).transpose()?.unwrap_or(0);
    let end = (start + max_results).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    Ok(Page::new(items[start..end].to_vec(), next))
}

/// A tracking server held in memory. Artifacts are files keyed by run id, with
/// paths relative to the run's artifact root.
#[derive(Default)]
pub struct FakeSource {
    pub experiments: Vec<Experiment>,
    pub runs: Vec<Run>,
    pub histories: HashMap<(String, String), Vec<Metric>>,
    pub artifacts: HashMap<String, Vec<(String, Vec<u8>)>>,
    pub fail_experiment_search: bool,
    pub fail_history_for: Option<String>,
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) downloads: Mutex<Vec<PathBuf>>,
}

impl FakeSource {
    pub fn with_history(mut self, run_id: &str, key: &str, samples: Vec<Metric>) -> Self {
        self.histories
            .insert((run_id.to_string(), key.to_string()), samples);
        self
    }

    pub fn with_artifact(mut self, run_id: &str, path: &str, contents: &[u8]) -> Self {
        self.artifacts
            .entry(run_id.to_string())
            .or_default()
            .push((path.to_string(), contents.to_vec()));
        self
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }

    /// Local paths returned by every `download_artifacts` call so far.
    pub fn downloads(&self) -> Vec<PathBuf> {
        self.downloads.lock().unwrap().clone()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

#[async_trait]
impl TrackingSource for FakeSource {
    async fn search_experiments(
        &self,
        _view_type: ViewType,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Experiment>> {
        self.record("search_experiments");
        if self.fail_experiment_search {
            bail!("connection refused");
        }
        page(&self.experiments, max_results, page_token)
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.record("get_experiment");
        self.experiments
            .iter()
            .find(|experiment| experiment.experiment_id == experiment_id)
            .cloned()
            .ok_or_else(|| anyhow!("experiment {experiment_id} not found"))
    }

    async fn search_runs(
        &self,
        experiment_ids: &[String],
        _run_view_type: ViewType,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<Page<Run>> {
        self.record("search_runs");
        let runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|run| experiment_ids.contains(&run.info.experiment_id))
            .cloned()
            .collect();
        page(&runs, max_results, page_token)
    }

    async fn get_metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>> {
        self.record("get_metric_history");
        if self.fail_history_for.as_deref() == Some(run_id) {
            bail!("metric history unavailable for {run_id}");
        }
        Ok(self
            .histories
            .get(&(run_id.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_artifacts(&self, run_id: &str, path: Option<&str>) -> Result<Vec<FileInfo>> {
        self.record("list_artifacts");
        let prefix = path.map(|path| format!("{path}/")).unwrap_or_default();
        let mut listing: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (file, contents) in self.artifacts.get(run_id).into_iter().flatten() {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            let (entry, is_dir) = match rest.split_once('/') {
                Some((dir, _)) => (format!("{prefix}{dir}"), true),
                None => (file.clone(), false),
            };
            listing.insert(
                entry.clone(),
                FileInfo {
                    path: entry,
                    is_dir,
                    file_size: (!is_dir).then_some(contents.len() as i64),
                },
            );
        }
        Ok(listing.into_values().collect())
    }

    async fn download_artifacts(&self, run_id: &str, path: &str, dst_dir: &Path) -> Result<PathBuf> {
        self.record("download_artifacts");
        let below = format!("{path}/");
        let mut found = false;
        for (file, contents) in self.artifacts.get(run_id).into_iter().flatten() {
            if file != path && !file.starts_with(&below) {
                continue;
            }
            let target = dst_dir.join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, contents)?;
            found = true;
        }
        if !found {
            bail!("artifact {path} not found for run {run_id}");
        }
        let local = dst_dir.join(path);
        self.downloads.lock().unwrap().push(local.clone());
        Ok(local)
    }
}

/// Everything written to one fake destination run.
#[derive(Debug, Default, Clone)]
pub struct RecordedRun {
    pub fields: BTreeMap<String, FieldValue>,
    pub series: BTreeMap<String, Vec<SeriesPoint>>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub closes: usize,
}

impl RecordedRun {
    pub fn string(&self, path: &str) -> Option<&str> {
        match self.fields.get(path) {
            Some(FieldValue::String(value)) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ProjectState {
    existing: Vec<String>,
    runs: BTreeMap<String, RecordedRun>,
    opened: Vec<String>,
    failing_flushes: usize,
}

#[derive(Debug, Default, Clone)]
pub struct FakeProject {
    state: Arc<Mutex<ProjectState>>,
    fail_uploads: bool,
    fail_closes: bool,
}

impl FakeProject {
    pub fn failing_uploads() -> Self {
        Self {
            fail_uploads: true,
            ..Self::default()
        }
    }

    /// Every close is counted and then rejected.
    pub fn failing_closes() -> Self {
        Self {
            fail_closes: true,
            ..Self::default()
        }
    }

    /// The next `count` flushes of any run are rejected.
    pub fn failing_flushes(count: usize) -> Self {
        let project = Self::default();
        project.state.lock().unwrap().failing_flushes = count;
        project
    }

    pub fn with_existing(custom_run_ids: &[&str]) -> Self {
        let project = Self::default();
        project.state.lock().unwrap().existing =
            custom_run_ids.iter().map(|id| id.to_string()).collect();
        project
    }

    pub fn recorded(&self, custom_run_id: &str) -> Option<RecordedRun> {
        self.state.lock().unwrap().runs.get(custom_run_id).cloned()
    }

    /// Custom run ids in the order their runs were opened.
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }
}

#[async_trait]
impl DestinationProject for FakeProject {
    type Run = FakeRun;

    async fn open_run(&self, custom_run_id: &str) -> Result<FakeRun> {
        let mut state = self.state.lock().unwrap();
        state.opened.push(custom_run_id.to_string());
        state.runs.entry(custom_run_id.to_string()).or_default();
        Ok(FakeRun {
            custom_run_id: custom_run_id.to_string(),
            state: Arc::clone(&self.state),
            fail_uploads: self.fail_uploads,
            fail_closes: self.fail_closes,
        })
    }

    async fn fetch_runs_table(&self, columns: &[&str]) -> Result<RunsTable> {
        let state = self.state.lock().unwrap();
        let ids = state.existing.iter().chain(state.runs.keys());
        let rows = ids
            .map(|id| {
                let mut row = BTreeMap::from([("sys/id".to_string(), format!("SAN-{id}"))]);
                if columns.contains(&CUSTOM_RUN_ID_COLUMN) {
                    row.insert(CUSTOM_RUN_ID_COLUMN.to_string(), id.clone());
                }
                row
            })
            .collect();
        Ok(RunsTable { rows })
    }
}

pub struct FakeRun {
    custom_run_id: String,
    state: Arc<Mutex<ProjectState>>,
    fail_uploads: bool,
    fail_closes: bool,
}

impl FakeRun {
    fn with_run<R>(&self, update: impl FnOnce(&mut RecordedRun) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        update(state.runs.entry(self.custom_run_id.clone()).or_default())
    }
}

#[async_trait]
impl DestinationRun for FakeRun {
    fn assign(&mut self, path: &str, value: FieldValue) {
        self.with_run(|run| run.fields.insert(path.to_string(), value));
    }

    fn extend_series(&mut self, path: &str, points: &[SeriesPoint]) {
        self.with_run(|run| {
            run.series
                .entry(path.to_string())
                .or_default()
                .extend_from_slice(points)
        });
    }

    async fn upload_file(&mut self, path: &str, local_file: &Path) -> Result<()> {
        if self.fail_uploads {
            bail!("upload rejected");
        }
        let contents = std::fs::read(local_file)?;
        self.with_run(|run| run.files.insert(path.to_string(), contents));
        Ok(())
    }

    async fn upload_files(&mut self, path: &str, root: &Path, files: &[PathBuf]) -> Result<()> {
        if self.fail_uploads {
            bail!("upload rejected");
        }
        for file in files {
            let relative = file.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            let contents = std::fs::read(file)?;
            self.with_run(|run| run.files.insert(format!("{path}/{relative}"), contents));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_flushes > 0 {
            state.failing_flushes -= 1;
            bail!("flush rejected");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.with_run(|run| run.closes += 1);
        if self.fail_closes {
            bail!("close rejected");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    lines: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: &SyncEvent<'_>) {
        self.lines.lock().unwrap().push(event.message());
    }
}
