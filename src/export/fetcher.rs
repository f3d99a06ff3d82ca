use std::collections::{BTreeMap, HashSet};

use anyhow::Result;

use crate::mlflow::{Experiment, Page, Run, TrackingSource, ViewType};
use crate::neptune::{DestinationProject, CUSTOM_RUN_ID_COLUMN};

pub const PAGE_LIMIT: usize = 100;

/// Everything the copy loop needs, read once before any write happens.
#[derive(Debug, Clone, Default)]
pub struct FetchedData {
    pub experiments: BTreeMap<String, Experiment>,
    pub runs: Vec<Run>,
    pub existing_run_ids: HashSet<String>,
}

pub struct Fetcher<'a, S, D> {
    source: &'a S,
    destination: &'a D,
}

impl<'a, S, D> Fetcher<'a, S, D>
where
    S: TrackingSource,
    D: DestinationProject,
{
    pub fn new(source: &'a S, destination: &'a D) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub async fn list_experiments(&self) -> Result<BTreeMap<String, Experiment>> {
        let experiments = collect_pages(|token| {
            let token = token.map(str::to_owned);
            async move {
                self.source
                    .search_experiments(ViewType::ActiveOnly, PAGE_LIMIT, token.as_deref())
                    .await
            }
        })
        .await?;

        Ok(experiments
            .into_iter()
            .map(|experiment| (experiment.experiment_id.clone(), experiment))
            .collect())
    }

    pub async fn list_runs(&self, experiment_ids: &[String]) -> Result<Vec<Run>> {
        if experiment_ids.is_empty() {
            return Ok(Vec::new());
        }
        collect_pages(|token| {
            let token = token.map(str::to_owned);
            async move {
                self.source
                    .search_runs(experiment_ids, ViewType::All, PAGE_LIMIT, token.as_deref())
                    .await
            }
        })
        .await
    }

    /// Custom run ids already present in the destination project.
    pub async fn list_existing_destination_run_ids(&self) -> Result<HashSet<String>> {
        let table = self
            .destination
            .fetch_runs_table(&[CUSTOM_RUN_ID_COLUMN])
            .await?;
        // An empty project has no custom run id column yet.
        Ok(table
            .column(CUSTOM_RUN_ID_COLUMN)
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    pub async fn fetch(&self) -> Result<FetchedData> {
        let experiments = self.list_experiments().await?;
        let experiment_ids: Vec<String> = experiments.keys().cloned().collect();
        let runs = self.list_runs(&experiment_ids).await?;
        let existing_run_ids = self.list_existing_destination_run_ids().await?;

        tracing::debug!(
            experiments = experiments.len(),
            runs = runs.len(),
            existing = existing_run_ids.len(),
            "fetched copy state"
        );

        Ok(FetchedData {
            experiments,
            runs,
            existing_run_ids,
        })
    }
}

async fn collect_pages<T, F, Fut>(mut fetch_page: F) -> Result<Vec<T>>
where
    F: FnMut(Option<&str>) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = fetch_page(page_token.as_deref()).await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(items),
        }
    }
}
