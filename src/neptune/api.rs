use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use urlencoding::encode;

use super::operations::{Operation, OperationError};
use super::RunsTable;
use crate::http::{ApiClient, Retry};

const MAX_OPERATIONS_PER_REQUEST: usize = 100;
const RUNS_TABLE_PAGE_SIZE: usize = 1000;

/// Contents of a Neptune API token (a base64 encoded JSON document).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiTokenInfo {
    pub api_address: String,
    #[serde(default)]
    pub api_url: Option<String>,
}

pub fn decode_api_token(token: &str) -> Result<ApiTokenInfo> {
    let trimmed = token.trim();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(trimmed))
        .map_err(|_| anyhow!("the Neptune API token is not valid base64"))?;
    serde_json::from_slice(&bytes).context("the Neptune API token does not carry an API address")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthToken {
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRun {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest<'a> {
    project_identifier: &'a str,
    parent_id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    custom_id: &'a str,
    cli_version: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardPage {
    #[serde(default)]
    entries: Vec<LeaderboardEntry>,
    #[serde(default)]
    matching_item_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardEntry {
    #[serde(default)]
    attributes: Vec<LeaderboardAttribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardAttribute {
    name: String,
    #[serde(default)]
    string_properties: Option<StringProperties>,
}

#[derive(Debug, Deserialize)]
struct StringProperties {
    #[serde(default)]
    value: Option<String>,
}

impl LeaderboardPage {
    fn into_rows(self) -> Vec<BTreeMap<String, String>> {
        self.entries
            .into_iter()
            .map(|entry| {
                entry
                    .attributes
                    .into_iter()
                    .filter_map(|attribute| {
                        let value = attribute.string_properties?.value?;
                        Some((attribute.name, value))
                    })
                    .collect()
            })
            .collect()
    }
}

/// HTTP client for the Neptune backend.
#[derive(Debug, Clone)]
pub struct NeptuneClient {
    api: ApiClient,
}

impl NeptuneClient {
    /// Exchange the API token for an access token and build an authorized client.
    pub async fn connect(api_token: &str) -> Result<Self> {
        let info = decode_api_token(api_token)?;
        let address = info.api_url.as_deref().unwrap_or(&info.api_address);
        let anonymous = ApiClient::new(address)?;
        let token: OAuthToken = anonymous
            .get_with_headers(
                "/api/backend/v1/authorization/oauth-token",
                &[("X-Neptune-Api-Token", api_token.trim())],
            )
            .await
            .context("failed to authenticate with Neptune")?;
        Ok(Self {
            api: anonymous.with_bearer_token(token.access_token),
        })
    }

    pub async fn get_project(&self, qualified_name: &str) -> Result<ProjectInfo> {
        let path = format!(
            "/api/backend/v1/projects/get?projectIdentifier={}",
            encode(qualified_name)
        );
        self.api
            .get(&path)
            .await
            .with_context(|| format!("failed to look up Neptune project '{qualified_name}'"))
    }

    /// Create (or resume, when `custom_run_id` is already known) a run in the project.
    pub async fn create_run(&self, project_id: &str, custom_run_id: &str) -> Result<CreatedRun> {
        let body = CreateRunRequest {
            project_identifier: project_id,
            parent_id: project_id,
            kind: "run",
            custom_id: custom_run_id,
            cli_version: env!("CARGO_PKG_VERSION"),
        };
        self.api
            .post("/api/leaderboard/v1/experiments", &body)
            .await
            .with_context(|| format!("failed to create Neptune run for '{custom_run_id}'"))
    }

    pub async fn execute_operations(&self, run_id: &str, operations: &[Operation]) -> Result<()> {
        let path = format!(
            "/api/leaderboard/v1/attributes/operations?experimentId={}",
            encode(run_id)
        );
        for chunk in operations.chunks(MAX_OPERATIONS_PER_REQUEST) {
            let errors: Vec<OperationError> =
                self.api.post_with(&path, chunk, Retry::Unapplied).await?;
            if let Some(first) = errors.first() {
                bail!(
                    "Neptune rejected {} operation(s): {}",
                    errors.len(),
                    first.error_description
                );
            }
        }
        Ok(())
    }

    pub async fn upload_file(&self, run_id: &str, attribute: &str, local_file: &Path) -> Result<()> {
        let ext = local_file
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let path = format!(
            "/api/leaderboard/v1/attributes/storage/file/upload?experimentIdentity={}&attribute={}&ext={}",
            encode(run_id),
            encode(attribute),
            encode(ext)
        );
        let bytes = tokio::fs::read(local_file)
            .await
            .with_context(|| format!("failed to read {}", local_file.display()))?;
        self.api.post_bytes(&path, bytes).await
    }

    pub async fn upload_file_set_entry(
        &self,
        run_id: &str,
        attribute: &str,
        relative_path: &str,
        local_file: &Path,
    ) -> Result<()> {
        let path = format!(
            "/api/leaderboard/v1/attributes/storage/fileset/upload?experimentIdentity={}&attribute={}&path={}",
            encode(run_id),
            encode(attribute),
            encode(relative_path)
        );
        let bytes = tokio::fs::read(local_file)
            .await
            .with_context(|| format!("failed to read {}", local_file.display()))?;
        self.api.post_bytes(&path, bytes).await
    }

    /// Read the requested string columns of every run in the project.
    pub async fn fetch_runs_table(&self, project_id: &str, columns: &[&str]) -> Result<RunsTable> {
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let body = json!({
                "projectIdentifier": project_id,
                "type": ["run"],
                "attributeFilters": columns
                    .iter()
                    .map(|column| json!({ "path": column }))
                    .collect::<Vec<_>>(),
                "pagination": { "limit": RUNS_TABLE_PAGE_SIZE, "offset": offset },
            });
            let page: LeaderboardPage = self
                .api
                .post("/api/leaderboard/v1/leaderboard/entries/search/", &body)
                .await
                .context("failed to fetch the Neptune runs table")?;
            let total = page.matching_item_count;
            let received = page.entries.len();
            rows.extend(page.into_rows());
            offset += received;
            if received == 0 || offset >= total {
                return Ok(RunsTable { rows });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_for(address: &str) -> String {
        let payload = format!(r#"{{"api_address": "{address}", "api_key": "secret"}}"#);
        base64::engine::general_purpose::STANDARD.encode(payload)
    }

    #[test]
    fn api_token_carries_address() {
        let info = decode_api_token(&token_for("https://app.neptune.ai")).unwrap();
        assert_eq!(info.api_address, "https://app.neptune.ai");
        assert_eq!(info.api_url, None);
    }

    #[test]
    fn garbage_api_token_is_rejected() {
        let err = decode_api_token("not a token!").unwrap_err();
        assert!(err.to_string().contains("not valid base64"));
    }

    #[test]
    fn leaderboard_rows_keep_string_attributes() {
        let page: LeaderboardPage = serde_json::from_value(json!({
            "entries": [
                {"attributes": [
                    {"name": "sys/custom_run_id", "type": "string", "stringProperties": {"value": "abc"}},
                    {"name": "sys/id", "type": "string", "stringProperties": {"value": "SAN-1"}}
                ]},
                {"attributes": [
                    {"name": "sys/id", "type": "string", "stringProperties": {"value": "SAN-2"}}
                ]}
            ],
            "matchingItemCount": 2
        }))
        .unwrap();

        let table = RunsTable {
            rows: page.into_rows(),
        };
        assert_eq!(
            table.column("sys/custom_run_id"),
            Some(vec!["abc".to_string()])
        );
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn create_run_request_shape() {
        let body = CreateRunRequest {
            project_identifier: "p-1",
            parent_id: "p-1",
            kind: "run",
            custom_id: "mlflow-run",
            cli_version: "1.0.0",
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "projectIdentifier": "p-1",
                "parentId": "p-1",
                "type": "run",
                "customId": "mlflow-run",
                "cliVersion": "1.0.0"
            })
        );
    }
}
