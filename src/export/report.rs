use serde::Serialize;

use crate::ui::{print_command_status, CommandStatus};

/// An outcome of the copy loop, reported line by line as it happens.
#[derive(Debug)]
pub enum SyncEvent<'a> {
    FetchFailed { error: &'a anyhow::Error },
    ExistingRunsFailed { error: &'a anyhow::Error },
    Skipped { run: &'a str },
    Loading { run: &'a str },
    Saved { run: &'a str },
    Failed { run: &'a str, error: &'a anyhow::Error },
}

impl SyncEvent<'_> {
    pub fn message(&self) -> String {
        match self {
            SyncEvent::FetchFailed { error } => {
                format!("Error during MLflow data fetching: {error:#}")
            }
            SyncEvent::ExistingRunsFailed { error } => {
                format!("Error reading existing runs from Neptune: {error:#}")
            }
            SyncEvent::Skipped { run } => format!("Ignoring run '{run}' since it already exists"),
            SyncEvent::Loading { run } => format!("Loading run '{run}'"),
            SyncEvent::Saved { run } => format!("Run '{run}' was saved"),
            SyncEvent::Failed { run, error } => {
                format!("Error exporting run '{run}': {error:#}")
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SyncEvent::FetchFailed { .. } => "fetch_failed",
            SyncEvent::ExistingRunsFailed { .. } => "existing_runs_failed",
            SyncEvent::Skipped { .. } => "skipped",
            SyncEvent::Loading { .. } => "loading",
            SyncEvent::Saved { .. } => "saved",
            SyncEvent::Failed { .. } => "failed",
        }
    }

    fn run(&self) -> Option<&str> {
        match self {
            SyncEvent::FetchFailed { .. } | SyncEvent::ExistingRunsFailed { .. } => None,
            SyncEvent::Skipped { run }
            | SyncEvent::Loading { run }
            | SyncEvent::Saved { run }
            | SyncEvent::Failed { run, .. } => Some(*run),
        }
    }

    fn status(&self) -> CommandStatus {
        match self {
            SyncEvent::FetchFailed { .. }
            | SyncEvent::ExistingRunsFailed { .. }
            | SyncEvent::Failed { .. } => CommandStatus::Error,
            SyncEvent::Skipped { .. } => CommandStatus::Warning,
            SyncEvent::Loading { .. } => CommandStatus::Info,
            SyncEvent::Saved { .. } => CommandStatus::Success,
        }
    }
}

pub trait Reporter: Send + Sync {
    fn report(&self, event: &SyncEvent<'_>);
}

#[derive(Serialize)]
struct JsonLine<'a> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<&'a str>,
    message: String,
}

/// Status lines on stderr, or one JSON object per line on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter {
    json: bool,
}

impl ConsoleReporter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl Reporter for ConsoleReporter {
    fn report(&self, event: &SyncEvent<'_>) {
        if !self.json {
            print_command_status(event.status(), &event.message());
            return;
        }
        let line = JsonLine {
            event: event.kind(),
            run: event.run(),
            message: event.message(),
        };
        match serde_json::to_string(&line) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "failed to serialize sync event"),
        }
    }
}
