use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use super::api::NeptuneClient;
use super::run::NeptuneRun;
use super::{DestinationProject, RunMode, RunsTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectError {
    #[error("no Neptune project given (use --project or NEPTUNE_PROJECT)")]
    MissingProject,
    #[error("invalid Neptune project '{0}', expected workspace/project")]
    InvalidName(String),
    #[error("no Neptune API token given (use --api-token or NEPTUNE_API_TOKEN)")]
    MissingApiToken,
}

fn project_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*/[A-Za-z0-9][A-Za-z0-9_.-]*$")
            .unwrap_or_else(|err| panic!("invalid project name pattern: {err}"))
    })
}

pub fn validate_project_name(name: Option<&str>) -> Result<&str, ProjectError> {
    let name = name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(ProjectError::MissingProject)?;
    if project_name_pattern().is_match(name) {
        Ok(name)
    } else {
        Err(ProjectError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone)]
enum Connection {
    Debug,
    Remote {
        client: Arc<NeptuneClient>,
        project_id: String,
    },
}

/// A Neptune project opened for writing runs.
#[derive(Debug, Clone)]
pub struct NeptuneProject {
    qualified_name: String,
    connection: Connection,
}

impl NeptuneProject {
    pub async fn connect(project: Option<&str>, api_token: Option<&str>, mode: RunMode) -> Result<Self> {
        let qualified_name = validate_project_name(project)?.to_string();
        if !mode.is_remote() {
            tracing::info!(project = %qualified_name, ?mode, "Neptune project opened without a server connection");
            return Ok(Self {
                qualified_name,
                connection: Connection::Debug,
            });
        }

        let api_token = api_token
            .filter(|token| !token.trim().is_empty())
            .ok_or(ProjectError::MissingApiToken)?;
        let client = NeptuneClient::connect(api_token).await?;
        let info = client.get_project(&qualified_name).await?;
        tracing::debug!(project = %qualified_name, id = %info.id, "connected to Neptune project");
        Ok(Self {
            qualified_name,
            connection: Connection::Remote {
                client: Arc::new(client),
                project_id: info.id,
            },
        })
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }
}

#[async_trait]
impl DestinationProject for NeptuneProject {
    type Run = NeptuneRun;

    async fn open_run(&self, custom_run_id: &str) -> Result<NeptuneRun> {
        match &self.connection {
            Connection::Debug => Ok(NeptuneRun::debug(custom_run_id)),
            Connection::Remote { client, project_id } => {
                let created = client.create_run(project_id, custom_run_id).await?;
                tracing::debug!(
                    custom_run_id,
                    run = created.short_id.as_deref().unwrap_or(&created.id),
                    "opened Neptune run"
                );
                Ok(NeptuneRun::remote(Arc::clone(client), created.id, custom_run_id))
            }
        }
    }

    async fn fetch_runs_table(&self, columns: &[&str]) -> Result<RunsTable> {
        match &self.connection {
            Connection::Debug => Ok(RunsTable::default()),
            Connection::Remote { client, project_id } => {
                client.fetch_runs_table(project_id, columns).await
            }
        }
    }
}
