use std::collections::HashSet;

use anyhow::Result;

use super::exporter::Exporter;
use super::fetcher::Fetcher;
use super::report::{Reporter, SyncEvent};
use super::ExportConfig;
use crate::mlflow::{Run, TrackingSource};
use crate::neptune::{DestinationProject, DestinationRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    Copy,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRun {
    pub run_id: String,
    pub name: String,
    pub experiment: String,
    pub action: PlannedAction,
}

/// Drives the batch: fetch once, then copy every run not yet in the project.
pub struct Orchestrator<'a, S, D> {
    source: &'a S,
    destination: &'a D,
    reporter: &'a dyn Reporter,
    config: ExportConfig,
}

impl<'a, S, D> Orchestrator<'a, S, D>
where
    S: TrackingSource,
    D: DestinationProject,
{
    pub fn new(
        source: &'a S,
        destination: &'a D,
        reporter: &'a dyn Reporter,
        config: ExportConfig,
    ) -> Self {
        Self {
            source,
            destination,
            reporter,
            config,
        }
    }

    /// Every outcome goes to the reporter; a failed run never stops the batch.
    pub async fn run(&self) {
        let fetcher = Fetcher::new(self.source, self.destination);
        let source_data = async {
            let experiments = fetcher.list_experiments().await?;
            let ids: Vec<String> = experiments.keys().cloned().collect();
            let runs = fetcher.list_runs(&ids).await?;
            anyhow::Ok((experiments, runs))
        };
        let (experiments, runs) = match source_data.await {
            Ok(data) => data,
            Err(error) => {
                self.reporter.report(&SyncEvent::FetchFailed { error: &error });
                return;
            }
        };
        let existing: HashSet<String> = match fetcher.list_existing_destination_run_ids().await {
            Ok(ids) => ids,
            Err(error) => {
                self.reporter
                    .report(&SyncEvent::ExistingRunsFailed { error: &error });
                return;
            }
        };

        let mut exporter = Exporter::new(self.source, experiments);
        for source_run in &runs {
            let name = source_run.display_name();
            if existing.contains(&source_run.info.run_id) {
                self.reporter.report(&SyncEvent::Skipped { run: name });
                continue;
            }

            self.reporter.report(&SyncEvent::Loading { run: name });
            match self.copy_run(&mut exporter, source_run).await {
                Ok(()) => self.reporter.report(&SyncEvent::Saved { run: name }),
                Err(error) => {
                    tracing::debug!(run_id = %source_run.info.run_id, error = ?error, "run export failed");
                    self.reporter.report(&SyncEvent::Failed {
                        run: name,
                        error: &error,
                    });
                }
            }
        }
    }

    async fn copy_run(&self, exporter: &mut Exporter<'_, S>, source_run: &Run) -> Result<()> {
        let mut run = self.destination.open_run(&source_run.info.run_id).await?;
        let exported = exporter
            .export_run(&mut run, source_run, self.config.artifact_limit())
            .await;
        // Partial writes stay; the run is closed either way.
        let closed = run.close().await;
        exported.and(closed)
    }

    /// What `run` would do, without opening any destination run.
    pub async fn plan(&self) -> Result<Vec<PlannedRun>> {
        let data = Fetcher::new(self.source, self.destination).fetch().await?;
        Ok(data
            .runs
            .iter()
            .map(|run| PlannedRun {
                run_id: run.info.run_id.clone(),
                name: run.display_name().to_string(),
                experiment: data
                    .experiments
                    .get(&run.info.experiment_id)
                    .map(|experiment| experiment.name.clone())
                    .unwrap_or_else(|| run.info.experiment_id.clone()),
                action: if data.existing_run_ids.contains(&run.info.run_id) {
                    PlannedAction::Skip
                } else {
                    PlannedAction::Copy
                },
            })
            .collect())
    }
}
