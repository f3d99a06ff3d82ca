use std::collections::BTreeMap;

use anyhow::{Context, Result};

use super::artifacts::{ArtifactUpload, UploadOutcome};
use crate::mlflow::{Experiment, Run, TrackingSource};
use crate::neptune::{DestinationRun, FieldValue, SeriesPoint};
use crate::utils::{millis_to_local_datetime, millis_to_seconds};

/// Writes the datetime at `path` unless the source left the timestamp empty.
fn assign_time<R: DestinationRun + ?Sized>(run: &mut R, path: &str, millis: Option<i64>) {
    if let Some(value) = millis.and_then(millis_to_local_datetime) {
        run.assign(path, FieldValue::Datetime(value));
    }
}

fn assign_opt<R: DestinationRun + ?Sized>(run: &mut R, path: &str, value: Option<&str>) {
    if let Some(value) = value {
        run.assign(path, FieldValue::from(value));
    }
}

/// Maps MLflow runs onto Neptune runs, field by field.
pub struct Exporter<'a, S: ?Sized> {
    source: &'a S,
    experiments: BTreeMap<String, Experiment>,
}

impl<'a, S> Exporter<'a, S>
where
    S: TrackingSource + ?Sized,
{
    /// `experiments` seeds the lookup; runs of any other experiment fetch it once.
    pub fn new(source: &'a S, experiments: BTreeMap<String, Experiment>) -> Self {
        Self {
            source,
            experiments,
        }
    }

    pub async fn experiment_for(&mut self, source_run: &Run) -> Result<&Experiment> {
        let experiment_id = &source_run.info.experiment_id;
        if !self.experiments.contains_key(experiment_id) {
            let experiment = self
                .source
                .get_experiment(experiment_id)
                .await
                .with_context(|| format!("failed to fetch experiment {experiment_id}"))?;
            self.experiments.insert(experiment_id.clone(), experiment);
        }
        self.experiments
            .get(experiment_id)
            .with_context(|| format!("experiment {experiment_id} is missing"))
    }

    pub fn export_experiment_metadata<R: DestinationRun + ?Sized>(
        run: &mut R,
        experiment: &Experiment,
    ) {
        run.assign("experiment/experiment_id", FieldValue::from(experiment.experiment_id.as_str()));
        run.assign("experiment/name", FieldValue::from(experiment.name.as_str()));
        run.assign_map("experiment/tags", &experiment.tag_map());
        assign_time(run, "experiment/creation_time", experiment.creation_time);
        assign_time(run, "experiment/last_update_time", experiment.last_update_time);
    }

    pub fn export_run_info<R: DestinationRun + ?Sized>(run: &mut R, source_run: &Run) {
        let info = &source_run.info;
        run.assign("sys/name", FieldValue::from(source_run.display_name()));
        run.assign("run_info/run_id", FieldValue::from(info.run_id.as_str()));
        run.assign("run_info/experiment_id", FieldValue::from(info.experiment_id.as_str()));
        assign_opt(run, "run_info/run_name", info.run_name.as_deref());
        assign_opt(run, "run_info/user_id", info.user_id.as_deref());
        assign_opt(run, "run_info/status", info.status.as_deref());
        assign_opt(run, "run_info/lifecycle_stage", info.lifecycle_stage.as_deref());
        assign_opt(run, "run_info/artifact_uri", info.artifact_uri.as_deref());
        assign_time(run, "run_info/start_time", info.start_time);
        assign_time(run, "run_info/end_time", info.end_time);
    }

    /// Params and tags first, then the full recorded history of every metric.
    pub async fn export_run_data<R: DestinationRun + ?Sized>(
        &self,
        run: &mut R,
        source_run: &Run,
    ) -> Result<()> {
        run.assign_map("run_data/params", &source_run.data.param_map());
        run.assign_map("run_data/tags", &source_run.data.tag_map());

        let run_id = &source_run.info.run_id;
        for key in source_run.data.metric_keys() {
            let history = self
                .source
                .get_metric_history(run_id, key)
                .await
                .with_context(|| format!("failed to fetch history of metric '{key}'"))?;
            let points: Vec<SeriesPoint> = history
                .iter()
                .map(|sample| SeriesPoint {
                    value: sample.value,
                    step: sample.step as f64,
                    timestamp: millis_to_seconds(sample.timestamp),
                })
                .collect();
            run.extend_series(&format!("run_data/metrics/{key}"), &points);
        }
        Ok(())
    }

    pub async fn export_artifacts<R: DestinationRun + ?Sized>(
        &self,
        run: &mut R,
        source_run: &Run,
        max_artifact_size: u64,
    ) -> Result<()> {
        let run_id = &source_run.info.run_id;
        let artifacts = self
            .source
            .list_artifacts(run_id, None)
            .await
            .context("failed to list artifacts")?;

        for artifact in &artifacts {
            let outcome = ArtifactUpload::for_artifact(artifact)
                .upload(self.source, run, run_id, artifact, max_artifact_size)
                .await?;
            if let UploadOutcome::Skipped { size, limit } = outcome {
                tracing::debug!(
                    run_id = %run_id,
                    artifact = %artifact.path,
                    size,
                    limit,
                    "skipping artifact over the size limit"
                );
            }
        }
        Ok(())
    }

    /// Copy one run: experiment metadata, run info, run data, then artifacts
    /// unless `max_artifact_size` is `None`.
    pub async fn export_run<R: DestinationRun + ?Sized>(
        &mut self,
        run: &mut R,
        source_run: &Run,
        max_artifact_size: Option<u64>,
    ) -> Result<()> {
        let experiment = self.experiment_for(source_run).await?;
        Self::export_experiment_metadata(run, experiment);
        Self::export_run_info(run, source_run);
        self.export_run_data(run, source_run).await?;
        if let Some(limit) = max_artifact_size {
            self.export_artifacts(run, source_run, limit).await?;
        }
        run.flush().await
    }
}
