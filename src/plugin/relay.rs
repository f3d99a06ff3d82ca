use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::uri::{parse_run_config, NeptuneRunConfig};
use crate::args::BaseArgs;
use crate::config;
use crate::mlflow::{join_artifact_path, KeyValue, Metric, MlflowClient, DEFAULT_TRACKING_URI};
use crate::neptune::{DestinationProject, DestinationRun, FieldValue, NeptuneProject, SeriesPoint};
use crate::ui::{print_command_status, CommandStatus};
use crate::utils::{files_below, millis_to_seconds, pluralize};

const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(5);
const RUN_NAME_TAG: &str = "mlflow.runName";
const ARTIFACTS_NAMESPACE: &str = "artifacts";

/// One MLflow tracking call, as read from a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TrackingCall {
    LogMetric {
        run_id: String,
        key: String,
        value: f64,
        timestamp: i64,
        #[serde(default)]
        step: i64,
    },
    LogParam {
        run_id: String,
        key: String,
        value: String,
    },
    SetTag {
        run_id: String,
        key: String,
        value: String,
    },
    LogBatch {
        run_id: String,
        #[serde(default)]
        metrics: Vec<Metric>,
        #[serde(default)]
        params: Vec<KeyValue>,
        #[serde(default)]
        tags: Vec<KeyValue>,
    },
    EndRun {
        run_id: String,
        #[serde(default = "default_end_status")]
        status: String,
        #[serde(default)]
        end_time: Option<i64>,
    },
    /// One local file, stored as `<artifact_path>/<file name>`.
    LogArtifact {
        run_id: String,
        local_path: PathBuf,
        #[serde(default)]
        artifact_path: Option<String>,
    },
    /// Everything below a local directory, stored under `artifact_path`.
    LogArtifacts {
        run_id: String,
        local_dir: PathBuf,
        #[serde(default)]
        artifact_path: Option<String>,
    },
}

fn default_end_status() -> String {
    "FINISHED".to_string()
}

impl TrackingCall {
    pub fn run_id(&self) -> &str {
        match self {
            TrackingCall::LogMetric { run_id, .. }
            | TrackingCall::LogParam { run_id, .. }
            | TrackingCall::SetTag { run_id, .. }
            | TrackingCall::LogBatch { run_id, .. }
            | TrackingCall::EndRun { run_id, .. }
            | TrackingCall::LogArtifact { run_id, .. }
            | TrackingCall::LogArtifacts { run_id, .. } => run_id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            TrackingCall::LogMetric { .. } => "log_metric",
            TrackingCall::LogParam { .. } => "log_param",
            TrackingCall::SetTag { .. } => "set_tag",
            TrackingCall::LogBatch { .. } => "log_batch",
            TrackingCall::EndRun { .. } => "end_run",
            TrackingCall::LogArtifact { .. } => "log_artifact",
            TrackingCall::LogArtifacts { .. } => "log_artifacts",
        }
    }
}

/// A backend that accepts tracking calls.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn apply(&self, call: &TrackingCall) -> Result<()>;

    /// Called once after the last call of a session.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TrackingStore for MlflowClient {
    async fn apply(&self, call: &TrackingCall) -> Result<()> {
        match call {
            TrackingCall::LogMetric {
                run_id,
                key,
                value,
                timestamp,
                step,
            } => {
                let metric = Metric {
                    key: key.clone(),
                    value: *value,
                    timestamp: *timestamp,
                    step: *step,
                };
                self.log_metric(run_id, &metric).await
            }
            TrackingCall::LogParam { run_id, key, value } => self.log_param(run_id, key, value).await,
            TrackingCall::SetTag { run_id, key, value } => self.set_tag(run_id, key, value).await,
            TrackingCall::LogBatch {
                run_id,
                metrics,
                params,
                tags,
            } => self.log_batch(run_id, metrics, params, tags).await,
            TrackingCall::EndRun {
                run_id,
                status,
                end_time,
            } => {
                let end_time = end_time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                self.update_run(run_id, status, end_time).await
            }
            TrackingCall::LogArtifact {
                run_id,
                local_path,
                artifact_path,
            } => {
                self.log_artifact(run_id, local_path, artifact_path.as_deref())
                    .await
            }
            TrackingCall::LogArtifacts {
                run_id,
                local_dir,
                artifact_path,
            } => {
                self.log_artifacts(run_id, local_dir, artifact_path.as_deref())
                    .await
            }
        }
    }
}

struct OpenRun<R> {
    run: R,
    last_flush: Instant,
}

/// Writes relayed calls into Neptune, one Neptune run per MLflow run id.
pub struct NeptuneTrackingStore<P: DestinationProject> {
    project: P,
    config: NeptuneRunConfig,
    flush_period: Duration,
    runs: Mutex<HashMap<String, OpenRun<P::Run>>>,
}

impl<P: DestinationProject> NeptuneTrackingStore<P> {
    pub fn new(project: P, config: NeptuneRunConfig) -> Self {
        let flush_period = config
            .flush_period
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(DEFAULT_FLUSH_PERIOD);
        // Relayed runs have no local process to capture output or hardware from.
        if config.capture_stdout.is_some()
            || config.capture_stderr.is_some()
            || config.capture_hardware_metrics.is_some()
            || config.capture_traceback.is_some()
            || config.monitoring_namespace.is_some()
        {
            tracing::debug!("capture and monitoring options have no effect on relayed runs");
        }
        Self {
            project,
            config,
            flush_period,
            runs: Mutex::new(HashMap::new()),
        }
    }

    async fn open(&self, run_id: &str) -> Result<OpenRun<P::Run>> {
        let mut run = self.project.open_run(run_id).await?;
        if let Some(name) = &self.config.name {
            run.assign("sys/name", FieldValue::from(name.as_str()));
        }
        if let Some(description) = &self.config.description {
            run.assign("sys/description", FieldValue::from(description.as_str()));
        }
        if let Some(tags) = &self.config.tags {
            run.assign("sys/tags", FieldValue::StringSet(tags.clone()));
        }
        tracing::debug!(run_id, "opened Neptune run for relayed calls");
        Ok(OpenRun {
            run,
            last_flush: Instant::now(),
        })
    }

    fn write(run: &mut P::Run, call: &TrackingCall) {
        match call {
            TrackingCall::LogMetric {
                key,
                value,
                timestamp,
                step,
                ..
            } => run.extend_series(
                &format!("metrics/{key}"),
                &[SeriesPoint {
                    value: *value,
                    step: *step as f64,
                    timestamp: millis_to_seconds(*timestamp),
                }],
            ),
            TrackingCall::LogParam { key, value, .. } => {
                run.assign(&format!("params/{key}"), FieldValue::from(value.as_str()))
            }
            TrackingCall::SetTag { key, value, .. } => Self::write_tag(run, key, value),
            TrackingCall::LogBatch {
                metrics,
                params,
                tags,
                ..
            } => {
                for metric in metrics {
                    run.extend_series(
                        &format!("metrics/{}", metric.key),
                        &[SeriesPoint {
                            value: metric.value,
                            step: metric.step as f64,
                            timestamp: millis_to_seconds(metric.timestamp),
                        }],
                    );
                }
                for param in params {
                    run.assign(
                        &format!("params/{}", param.key),
                        FieldValue::from(param.value.as_str()),
                    );
                }
                for tag in tags {
                    Self::write_tag(run, &tag.key, &tag.value);
                }
            }
            TrackingCall::EndRun { status, .. } => {
                run.assign("run_info/status", FieldValue::from(status.as_str()))
            }
            TrackingCall::LogArtifact { .. } | TrackingCall::LogArtifacts { .. } => {}
        }
    }

    async fn upload(run: &mut P::Run, call: &TrackingCall) -> Result<()> {
        match call {
            TrackingCall::LogArtifact {
                local_path,
                artifact_path,
                ..
            } => {
                let name = local_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| anyhow!("{} has no file name", local_path.display()))?;
                let path = format!(
                    "{ARTIFACTS_NAMESPACE}/{}",
                    join_artifact_path(artifact_path.as_deref(), name)
                );
                run.upload_file(&path, local_path).await
            }
            TrackingCall::LogArtifacts {
                local_dir,
                artifact_path,
                ..
            } => {
                let files = files_below(local_dir)?;
                run.upload_files(&artifact_namespace(artifact_path.as_deref()), local_dir, &files)
                    .await
            }
            _ => Ok(()),
        }
    }

    fn write_tag(run: &mut P::Run, key: &str, value: &str) {
        run.assign(&format!("tags/{key}"), FieldValue::from(value));
        if key == RUN_NAME_TAG {
            run.assign("sys/name", FieldValue::from(value));
        }
    }
}

#[async_trait]
impl<P> TrackingStore for NeptuneTrackingStore<P>
where
    P: DestinationProject,
{
    async fn apply(&self, call: &TrackingCall) -> Result<()> {
        let run_id = call.run_id();
        let mut runs = self.runs.lock().await;
        if !runs.contains_key(run_id) {
            let opened = self.open(run_id).await?;
            runs.insert(run_id.to_string(), opened);
        }

        if let TrackingCall::EndRun { .. } = call {
            if let Some(mut open) = runs.remove(run_id) {
                Self::write(&mut open.run, call);
                open.run.close().await?;
            }
            return Ok(());
        }

        let Some(open) = runs.get_mut(run_id) else {
            return Ok(());
        };
        Self::write(&mut open.run, call);
        Self::upload(&mut open.run, call).await?;
        // A failed flush leaves the operations queued and retries on the next call.
        if open.last_flush.elapsed() >= self.flush_period {
            open.run.flush().await?;
            open.last_flush = Instant::now();
        }
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let mut errors = Vec::new();
        for (run_id, mut open) in runs.drain() {
            if let Err(err) = open.run.close().await {
                errors.push(format!("{run_id}: {err:#}"));
            }
        }
        if !errors.is_empty() {
            errors.sort();
            bail!("failed to close Neptune runs: {}", errors.join("; "));
        }
        Ok(())
    }
}

/// Neptune namespace mirroring an MLflow artifact directory.
fn artifact_namespace(artifact_path: Option<&str>) -> String {
    match artifact_path
        .map(|path| path.trim_matches('/'))
        .filter(|path| !path.is_empty())
    {
        Some(path) => format!("{ARTIFACTS_NAMESPACE}/{path}"),
        None => ARTIFACTS_NAMESPACE.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorFailure {
    pub op: String,
    pub run_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MirrorReport {
    pub mirrored: usize,
    pub failures: Vec<MirrorFailure>,
}

/// Sends every call to `primary`, then queues it for the mirror. Mirror
/// failures and timeouts are collected, never returned to the caller.
pub struct MirroredStore<P> {
    primary: P,
    queue: mpsc::Sender<TrackingCall>,
    worker: JoinHandle<MirrorReport>,
}

impl<P: TrackingStore> MirroredStore<P> {
    pub fn new<M>(primary: P, mirror: M, capacity: usize, timeout: Duration) -> Self
    where
        M: TrackingStore + 'static,
    {
        let (queue, calls) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(mirror_worker(mirror, calls, timeout));
        Self {
            primary,
            queue,
            worker,
        }
    }

    /// Apply `call` to the primary store. Only successful calls are mirrored.
    pub async fn apply(&self, call: TrackingCall) -> Result<()> {
        self.primary.apply(&call).await?;
        if self.queue.send(call).await.is_err() {
            tracing::warn!("mirror worker has stopped; call not mirrored");
        }
        Ok(())
    }

    /// Drain the mirror queue and finish both stores.
    pub async fn shutdown(self) -> Result<MirrorReport> {
        let Self {
            primary,
            queue,
            worker,
        } = self;
        drop(queue);
        let report = worker.await.context("mirror worker panicked")?;
        primary.finish().await?;
        Ok(report)
    }
}

async fn mirror_worker<M: TrackingStore>(
    mirror: M,
    mut calls: mpsc::Receiver<TrackingCall>,
    timeout: Duration,
) -> MirrorReport {
    let mut report = MirrorReport::default();
    while let Some(call) = calls.recv().await {
        match tokio::time::timeout(timeout, mirror.apply(&call)).await {
            Ok(Ok(())) => report.mirrored += 1,
            Ok(Err(err)) => record_failure(&mut report, call.op(), call.run_id(), format!("{err:#}")),
            Err(_) => record_failure(
                &mut report,
                call.op(),
                call.run_id(),
                format!("timed out after {}s", timeout.as_secs_f64()),
            ),
        }
    }
    match tokio::time::timeout(timeout, mirror.finish()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => record_failure(&mut report, "finish", "", format!("{err:#}")),
        Err(_) => record_failure(
            &mut report,
            "finish",
            "",
            format!("timed out after {}s", timeout.as_secs_f64()),
        ),
    }
    report
}

fn record_failure(report: &mut MirrorReport, op: &str, run_id: &str, error: String) {
    tracing::warn!(op, run_id, error = %error, "mirrored call failed");
    report.failures.push(MirrorFailure {
        op: op.to_string(),
        run_id: run_id.to_string(),
        error,
    });
}

#[derive(Debug, Clone, Args)]
pub struct RelayArgs {
    /// Plugin URI carrying the Neptune run options (see `uri encode`)
    #[arg(long, env = "NEPTUNE_MLFLOW_URI", hide_env_values = true)]
    pub neptune_uri: Option<String>,

    /// Seconds to wait for each mirrored Neptune call
    #[arg(long, default_value_t = 30)]
    pub mirror_timeout_secs: u64,

    /// Mirrored calls that may wait in the queue
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,

    /// JSON-lines file of tracking calls, or - for stdin
    #[arg(long, default_value = "-")]
    pub input: PathBuf,
}

#[derive(Serialize)]
struct CallLine<'a> {
    line: usize,
    op: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(base: BaseArgs, args: RelayArgs) -> Result<()> {
    let mut run_config = match &args.neptune_uri {
        Some(uri) => parse_run_config(uri)?,
        None => NeptuneRunConfig::default(),
    };
    let file = config::load().unwrap_or_default();
    let project_name = run_config
        .project
        .clone()
        .or(base.project.clone())
        .or(file.project);
    let api_token = run_config.api_token.take().or(base.api_token.clone());
    let mode = run_config.mode.unwrap_or_default();

    let tracking_uri = base
        .mlflow_tracking_uri
        .clone()
        .or(file.mlflow_tracking_uri)
        .unwrap_or_else(|| DEFAULT_TRACKING_URI.to_string());
    let primary = MlflowClient::from_tracking_uri(&tracking_uri)?;
    let project = NeptuneProject::connect(project_name.as_deref(), api_token.as_deref(), mode).await?;
    let mirror = NeptuneTrackingStore::new(project, run_config);
    let store = MirroredStore::new(
        primary,
        mirror,
        args.queue_capacity,
        Duration::from_secs(args.mirror_timeout_secs),
    );

    let relayed = if args.input.as_os_str() == "-" {
        relay_lines(&store, BufReader::new(tokio::io::stdin()), base.json).await?
    } else {
        let input = tokio::fs::File::open(&args.input)
            .await
            .with_context(|| format!("failed to open {}", args.input.display()))?;
        relay_lines(&store, BufReader::new(input), base.json).await?
    };

    let report = store.shutdown().await?;
    if base.json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    for failure in &report.failures {
        print_command_status(
            CommandStatus::Warning,
            &format!("Neptune {} for run '{}' failed: {}", failure.op, failure.run_id, failure.error),
        );
    }
    print_command_status(
        CommandStatus::Success,
        &format!(
            "Relayed {relayed} {}; {} mirrored to Neptune, {} mirror {}",
            pluralize(relayed, "call", None),
            report.mirrored,
            report.failures.len(),
            pluralize(report.failures.len(), "failure", None)
        ),
    );
    Ok(())
}

/// Feed each JSON line to `store`. Bad lines and failed primary calls are
/// reported and skipped. Returns the number of calls the primary accepted.
async fn relay_lines<P, R>(store: &MirroredStore<P>, reader: R, json: bool) -> Result<usize>
where
    P: TrackingStore,
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut number = 0;
    let mut relayed = 0;
    while let Some(line) = lines.next_line().await.context("failed to read tracking calls")? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let (op, result) = match serde_json::from_str::<TrackingCall>(&line) {
            Ok(call) => {
                let op = call.op();
                (op, store.apply(call).await)
            }
            Err(err) => ("parse", Err(anyhow::Error::new(err).context("invalid tracking call"))),
        };
        if result.is_ok() {
            relayed += 1;
        }
        if json {
            let line = CallLine {
                line: number,
                op,
                ok: result.is_ok(),
                error: result.as_ref().err().map(|err| format!("{err:#}")),
            };
            println!("{}", serde_json::to_string(&line)?);
        } else if let Err(err) = &result {
            print_command_status(CommandStatus::Error, &format!("Line {number} ({op}): {err:#}"));
        }
    }
    Ok(relayed)
}
