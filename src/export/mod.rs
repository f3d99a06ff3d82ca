//! `sync`: copy MLflow experiments and runs into a Neptune project.

use anyhow::Result;
use clap::Args;
use comfy_table::Cell;
use serde::Serialize;

use crate::args::BaseArgs;
use crate::config::{self, Config, ConfigError};
use crate::mlflow::{MlflowClient, DEFAULT_TRACKING_URI};
use crate::neptune::{NeptuneProject, RunMode};
use crate::ui::{self, print_command_status, CommandStatus};
use crate::utils::pluralize;

pub mod artifacts;
pub mod exporter;
pub mod fetcher;
pub mod orchestrator;
pub mod report;

use orchestrator::{Orchestrator, PlannedAction, PlannedRun};
use report::ConsoleReporter;

pub const DEFAULT_MAX_ARTIFACT_SIZE_MB: i64 = 50;
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    /// Do not copy run artifacts
    #[arg(short = 'e', long, conflicts_with = "include_artifacts")]
    pub exclude_artifacts: bool,

    /// Copy run artifacts even when a config file excludes them
    #[arg(long)]
    pub include_artifacts: bool,

    /// Largest artifact to copy, in MB [default: 50]
    #[arg(short = 'm', long, value_name = "MB")]
    pub max_artifact_size: Option<i64>,

    /// List what would be copied without writing to Neptune
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportConfig {
    pub exclude_artifacts: bool,
    /// Bytes.
    pub max_artifact_size: u64,
}

impl ExportConfig {
    pub fn new(exclude_artifacts: bool, max_artifact_size_mb: i64) -> Result<Self, ConfigError> {
        if max_artifact_size_mb <= 0 {
            return Err(ConfigError::InvalidMaxArtifactSize(max_artifact_size_mb));
        }
        let max_artifact_size = u64::try_from(max_artifact_size_mb)
            .ok()
            .and_then(|mb| mb.checked_mul(BYTES_PER_MB))
            .ok_or(ConfigError::MaxArtifactSizeTooLarge(max_artifact_size_mb))?;
        Ok(Self {
            exclude_artifacts,
            max_artifact_size,
        })
    }

    /// Size limit for artifact copies, or `None` when artifacts are excluded.
    pub fn artifact_limit(&self) -> Option<u64> {
        (!self.exclude_artifacts).then_some(self.max_artifact_size)
    }
}

impl SyncArgs {
    /// The artifact choice made on the command line, if any.
    fn exclude_artifacts_flag(&self) -> Option<bool> {
        if self.include_artifacts {
            Some(false)
        } else if self.exclude_artifacts {
            Some(true)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SyncSettings {
    project: Option<String>,
    tracking_uri: String,
    export: ExportConfig,
}

/// Flags and environment first, then config files, then built-in defaults.
fn resolve_settings(base: &BaseArgs, args: &SyncArgs, file: &Config) -> Result<SyncSettings> {
    let max_artifact_size = args
        .max_artifact_size
        .or(file.max_artifact_size)
        .unwrap_or(DEFAULT_MAX_ARTIFACT_SIZE_MB);
    let exclude_artifacts = args
        .exclude_artifacts_flag()
        .or(file.exclude_artifacts)
        .unwrap_or(false);
    Ok(SyncSettings {
        project: base.project.clone().or_else(|| file.project.clone()),
        tracking_uri: base
            .mlflow_tracking_uri
            .clone()
            .or_else(|| file.mlflow_tracking_uri.clone())
            .unwrap_or_else(|| DEFAULT_TRACKING_URI.to_string()),
        export: ExportConfig::new(exclude_artifacts, max_artifact_size)?,
    })
}

pub async fn run(base: BaseArgs, args: SyncArgs) -> Result<()> {
    let file = config::load().unwrap_or_default();
    let settings = resolve_settings(&base, &args, &file)?;
    tracing::debug!(
        tracking_uri = %settings.tracking_uri,
        project = ?settings.project,
        limit = ?settings.export.artifact_limit(),
        "resolved sync settings"
    );

    let source = MlflowClient::from_tracking_uri(&settings.tracking_uri)?;
    let project = ui::with_spinner(
        "Connecting to Neptune...",
        NeptuneProject::connect(
            settings.project.as_deref(),
            base.api_token.as_deref(),
            RunMode::Async,
        ),
    )
    .await?;

    let reporter = ConsoleReporter::new(base.json);
    let orchestrator = Orchestrator::new(&source, &project, &reporter, settings.export);

    if args.dry_run {
        let plan = ui::with_spinner("Reading MLflow and Neptune runs...", orchestrator.plan()).await?;
        return print_plan(&plan, project.qualified_name(), base.json);
    }

    orchestrator.run().await;
    Ok(())
}

#[derive(Serialize)]
struct PlanLine<'a> {
    run_id: &'a str,
    name: &'a str,
    experiment: &'a str,
    action: &'a str,
}

fn action_label(action: PlannedAction) -> &'static str {
    match action {
        PlannedAction::Copy => "copy",
        PlannedAction::Skip => "skip",
    }
}

fn print_plan(plan: &[PlannedRun], project: &str, json: bool) -> Result<()> {
    if json {
        for planned in plan {
            let line = PlanLine {
                run_id: &planned.run_id,
                name: &planned.name,
                experiment: &planned.experiment,
                action: action_label(planned.action),
            };
            println!("{}", serde_json::to_string(&line)?);
        }
        return Ok(());
    }

    if !plan.is_empty() {
        let mut table = ui::styled_table();
        table.set_header(vec![
            ui::header("Run"),
            ui::header("Experiment"),
            ui::header("Run ID"),
            ui::header("Action"),
        ]);
        ui::apply_column_padding(&mut table, (0, 2));
        for planned in plan {
            table.add_row(vec![
                Cell::new(ui::truncate(&planned.name, 40)),
                Cell::new(ui::truncate(&planned.experiment, 30)),
                Cell::new(&planned.run_id),
                Cell::new(action_label(planned.action)),
            ]);
        }
        println!("{table}");
    }

    let to_copy = plan
        .iter()
        .filter(|planned| planned.action == PlannedAction::Copy)
        .count();
    print_command_status(
        CommandStatus::Info,
        &format!(
            "{to_copy} {} to copy into {project}, {} already present",
            pluralize(to_copy, "run", None),
            plan.len() - to_copy
        ),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        base: BaseArgs,
        #[command(flatten)]
        args: SyncArgs,
    }

    fn parse(argv: &[&str]) -> TestCli {
        TestCli::try_parse_from(std::iter::once("sync").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn megabytes_become_bytes() {
        let config = ExportConfig::new(false, 50).unwrap();
        assert_eq!(config.max_artifact_size, 50 * 1024 * 1024);
        assert_eq!(config.artifact_limit(), Some(52_428_800));
        assert_eq!(ExportConfig::new(true, 1).unwrap().artifact_limit(), None);
    }

    #[test]
    fn non_positive_size_is_rejected() {
        assert_eq!(
            ExportConfig::new(false, 0),
            Err(ConfigError::InvalidMaxArtifactSize(0))
        );
        assert_eq!(
            ExportConfig::new(false, -5),
            Err(ConfigError::InvalidMaxArtifactSize(-5))
        );
    }

    #[test]
    fn size_beyond_byte_range_is_rejected() {
        assert_eq!(
            ExportConfig::new(false, 20_000_000_000_000),
            Err(ConfigError::MaxArtifactSizeTooLarge(20_000_000_000_000))
        );
        assert_eq!(
            ExportConfig::new(false, i64::MAX),
            Err(ConfigError::MaxArtifactSizeTooLarge(i64::MAX))
        );
        let largest = (u64::MAX / BYTES_PER_MB) as i64;
        assert_eq!(
            ExportConfig::new(false, largest).unwrap().max_artifact_size,
            (largest as u64) * BYTES_PER_MB
        );
    }

    #[test]
    fn fractional_size_fails_to_parse() {
        let parsed = TestCli::try_parse_from(["sync", "--max-artifact-size", "50.5"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn flags_win_over_config_files() {
        let cli = parse(&["-p", "team/cli", "-u", "http://cli:5000", "-m", "5"]);
        let file = Config {
            project: Some("team/file".into()),
            mlflow_tracking_uri: Some("http://file:5000".into()),
            max_artifact_size: Some(100),
            exclude_artifacts: Some(true),
            ..Default::default()
        };

        let settings = resolve_settings(&cli.base, &cli.args, &file).unwrap();

        assert_eq!(settings.project.as_deref(), Some("team/cli"));
        assert_eq!(settings.tracking_uri, "http://cli:5000");
        assert_eq!(settings.export.max_artifact_size, 5 * 1024 * 1024);
        assert!(settings.export.exclude_artifacts);
    }

    #[test]
    fn include_flag_overrides_excluding_config_file() {
        let file = Config {
            exclude_artifacts: Some(true),
            ..Default::default()
        };

        let cli = parse(&["--include-artifacts"]);
        let settings = resolve_settings(&cli.base, &cli.args, &file).unwrap();
        assert!(!settings.export.exclude_artifacts);

        let cli = parse(&[]);
        let settings = resolve_settings(&cli.base, &cli.args, &file).unwrap();
        assert!(settings.export.exclude_artifacts);
    }

    #[test]
    fn exclude_and_include_conflict() {
        let parsed = TestCli::try_parse_from(["sync", "-e", "--include-artifacts"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn defaults_fill_the_gaps() {
        let mut cli = parse(&[]);
        cli.base.project = None;
        cli.base.mlflow_tracking_uri = None;

        let settings = resolve_settings(&cli.base, &cli.args, &Config::default()).unwrap();

        assert_eq!(settings.tracking_uri, DEFAULT_TRACKING_URI);
        assert_eq!(
            settings.export,
            ExportConfig::new(false, DEFAULT_MAX_ARTIFACT_SIZE_MB).unwrap()
        );
    }

    #[test]
    fn invalid_size_from_config_file_is_rejected() {
        let cli = parse(&[]);
        let file = Config {
            max_artifact_size: Some(0),
            ..Default::default()
        };
        let err = resolve_settings(&cli.base, &cli.args, &file).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::InvalidMaxArtifactSize(0))
        );
    }
}
