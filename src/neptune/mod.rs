//! Destination side: write access to a Neptune project.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

mod api;
mod operations;
mod project;
mod run;

pub use project::NeptuneProject;

/// Column of the runs table holding the custom run id.
pub const CUSTOM_RUN_ID_COLUMN: &str = "sys/custom_run_id";

/// Connection mode of a Neptune run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Async,
    Sync,
    Offline,
    Debug,
    ReadOnly,
}

impl RunMode {
    /// Whether operations are actually sent to the server.
    pub fn is_remote(self) -> bool {
        !matches!(self, RunMode::Debug | RunMode::Offline)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    /// An instant, shown in the machine's local time zone.
    Datetime(DateTime<Local>),
    StringSet(Vec<String>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// One sample of a float series. `timestamp` is in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub value: f64,
    pub step: f64,
    pub timestamp: f64,
}

/// A tabular view of the runs in a project, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunsTable {
    pub rows: Vec<BTreeMap<String, String>>,
}

impl RunsTable {
    /// Values of `name`, or `None` when no run carries that column.
    pub fn column(&self, name: &str) -> Option<Vec<String>> {
        let values: Vec<String> = self
            .rows
            .iter()
            .filter_map(|row| row.get(name).cloned())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values)
        }
    }
}

/// An open destination run. Field writes may be buffered until `flush`.
#[async_trait]
pub trait DestinationRun: Send {
    fn assign(&mut self, path: &str, value: FieldValue);

    /// Assign every entry of `values` below `namespace`.
    fn assign_map(&mut self, namespace: &str, values: &BTreeMap<String, String>) {
        for (key, value) in values {
            self.assign(&format!("{namespace}/{key}"), FieldValue::String(value.clone()));
        }
    }

    fn extend_series(&mut self, path: &str, points: &[SeriesPoint]);

    async fn upload_file(&mut self, path: &str, local_file: &Path) -> Result<()>;

    /// Upload `files` (all below `root`) as a file set at `path`, keeping their
    /// paths relative to `root`.
    async fn upload_files(&mut self, path: &str, root: &Path, files: &[PathBuf]) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Flush and stop the run. The handle must not be used afterwards.
    async fn close(&mut self) -> Result<()> {
        self.flush().await
    }
}

/// Project-level operations on the destination backend.
#[async_trait]
pub trait DestinationProject: Send + Sync {
    type Run: DestinationRun;

    /// Open the run identified by `custom_run_id`, creating it if needed.
    async fn open_run(&self, custom_run_id: &str) -> Result<Self::Run>;

    async fn fetch_runs_table(&self, columns: &[&str]) -> Result<RunsTable>;
}
