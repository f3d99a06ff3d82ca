use std::path::Path;

use anyhow::{Context, Result};

use crate::mlflow::{FileInfo, TrackingSource};
use crate::neptune::DestinationRun;
use crate::utils::files_below;

pub const ARTIFACTS_NAMESPACE: &str = "artifacts";

/// How one top-level artifact is copied. Files are sized from the listing;
/// directories have no listed size and must be downloaded before the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactUpload {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    Skipped { size: u64, limit: u64 },
    /// The strategy does not handle this kind of artifact.
    NotApplicable,
}

impl ArtifactUpload {
    pub fn for_artifact(info: &FileInfo) -> Self {
        if info.is_dir {
            ArtifactUpload::Directory
        } else {
            ArtifactUpload::File
        }
    }

    fn handles(self, info: &FileInfo) -> bool {
        Self::for_artifact(info) == self
    }

    /// Copy `info` from the source run into `run` below `artifacts/`, unless it
    /// is larger than `max_size` bytes. Downloads land in a scratch directory
    /// that is removed before this returns, whatever the outcome.
    pub async fn upload<S, R>(
        self,
        source: &S,
        run: &mut R,
        run_id: &str,
        info: &FileInfo,
        max_size: u64,
    ) -> Result<UploadOutcome>
    where
        S: TrackingSource + ?Sized,
        R: DestinationRun + ?Sized,
    {
        if !self.handles(info) {
            return Ok(UploadOutcome::NotApplicable);
        }

        let listed_size = match self {
            ArtifactUpload::File => info.file_size.map(|size| size.max(0) as u64),
            ArtifactUpload::Directory => None,
        };
        if let Some(size) = listed_size {
            if size > max_size {
                return Ok(UploadOutcome::Skipped {
                    size,
                    limit: max_size,
                });
            }
        }

        let scratch = tempfile::Builder::new()
            .prefix("neptune-mlflow-")
            .tempdir()
            .context("failed to create a scratch directory")?;
        let local = source
            .download_artifacts(run_id, &info.path, scratch.path())
            .await
            .with_context(|| format!("failed to download artifact '{}'", info.path))?;

        let size = match (self, listed_size) {
            (_, Some(size)) => size,
            (ArtifactUpload::File, None) => std::fs::metadata(&local)
                .with_context(|| format!("failed to stat {}", local.display()))?
                .len(),
            (ArtifactUpload::Directory, None) => directory_size(&local)?,
        };
        if size > max_size {
            return Ok(UploadOutcome::Skipped {
                size,
                limit: max_size,
            });
        }

        let target = format!("{ARTIFACTS_NAMESPACE}/{}", info.path);
        match self {
            ArtifactUpload::File => run.upload_file(&target, &local).await?,
            ArtifactUpload::Directory => {
                let files = files_below(&local)?;
                run.upload_files(&target, &local, &files).await?;
            }
        }
        Ok(UploadOutcome::Uploaded)
    }
}

fn directory_size(root: &Path) -> Result<u64> {
    files_below(root)?.iter().try_fold(0u64, |total, file| -> Result<u64> {
        let len = std::fs::metadata(file)
            .with_context(|| format!("failed to stat {}", file.display()))?
            .len();
        Ok(total + len)
    })
}
