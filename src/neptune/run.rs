use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::api::NeptuneClient;
use super::operations::Operation;
use super::{DestinationRun, FieldValue, SeriesPoint};
use crate::utils::relative_slash_path;

#[derive(Debug, Clone)]
enum Transport {
    /// Operations are dropped on flush; nothing leaves the process.
    Debug,
    Remote {
        client: Arc<NeptuneClient>,
        run_id: String,
    },
    /// Every send fails.
    #[cfg(test)]
    Unreachable,
}

/// Handle to one Neptune run. Field operations are queued and sent on flush;
/// file uploads go out immediately, after any queued operations. Operations
/// stay queued until a flush delivers them.
#[derive(Debug)]
pub struct NeptuneRun {
    custom_run_id: String,
    transport: Transport,
    pending: Vec<Operation>,
}

impl NeptuneRun {
    pub(super) fn remote(client: Arc<NeptuneClient>, run_id: String, custom_run_id: &str) -> Self {
        Self {
            custom_run_id: custom_run_id.to_string(),
            transport: Transport::Remote { client, run_id },
            pending: Vec::new(),
        }
    }

    pub fn debug(custom_run_id: &str) -> Self {
        Self {
            custom_run_id: custom_run_id.to_string(),
            transport: Transport::Debug,
            pending: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn pending_operations(&self) -> &[Operation] {
        &self.pending
    }

    async fn send(&self, operations: &[Operation]) -> Result<()> {
        match &self.transport {
            Transport::Debug => {
                tracing::debug!(
                    custom_run_id = %self.custom_run_id,
                    count = operations.len(),
                    "debug run: dropping operations"
                );
                Ok(())
            }
            Transport::Remote { client, run_id } => client
                .execute_operations(run_id, operations)
                .await
                .with_context(|| format!("failed to sync run '{}'", self.custom_run_id)),
            #[cfg(test)]
            Transport::Unreachable => anyhow::bail!("failed to sync run '{}'", self.custom_run_id),
        }
    }
}

#[async_trait]
impl DestinationRun for NeptuneRun {
    fn assign(&mut self, path: &str, value: FieldValue) {
        self.pending.push(Operation::assign(path, value));
    }

    fn extend_series(&mut self, path: &str, points: &[SeriesPoint]) {
        if points.is_empty() {
            return;
        }
        self.pending.push(Operation::log_floats(path, points));
    }

    async fn upload_file(&mut self, path: &str, local_file: &Path) -> Result<()> {
        self.flush().await?;
        match &self.transport {
            Transport::Debug => {
                tracing::debug!(path, file = %local_file.display(), "debug run: skipping upload");
                Ok(())
            }
            Transport::Remote { client, run_id } => client
                .upload_file(run_id, path, local_file)
                .await
                .with_context(|| format!("failed to upload {} to '{path}'", local_file.display())),
            #[cfg(test)]
            Transport::Unreachable => anyhow::bail!("failed to upload {}", local_file.display()),
        }
    }

    async fn upload_files(&mut self, path: &str, root: &Path, files: &[PathBuf]) -> Result<()> {
        self.pending.push(Operation::reset_file_set(path));
        self.flush().await?;
        let Transport::Remote { client, run_id } = &self.transport else {
            tracing::debug!(path, count = files.len(), "debug run: skipping file set upload");
            return Ok(());
        };

        for file in files {
            let relative = relative_slash_path(file, root)?;
            client
                .upload_file_set_entry(run_id, path, &relative, file)
                .await
                .with_context(|| format!("failed to upload {} to '{path}'", file.display()))?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let operations = std::mem::take(&mut self.pending);
        if let Err(err) = self.send(&operations).await {
            self.pending = operations;
            return Err(err);
        }
        Ok(())
    }
}
