use serde::{Deserialize, Serialize};

use super::{FieldValue, SeriesPoint};

/// A single attribute operation as accepted by the `attributes/operations` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub path: String,
    #[serde(flatten)]
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OperationKind {
    AssignString { value: String },
    AssignDatetime { value_milliseconds: i64 },
    AddStrings { values: Vec<String> },
    LogFloats { entries: Vec<FloatEntry> },
    UploadFileSet { file_globs: Vec<String>, reset: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatEntry {
    pub value: f64,
    pub step: f64,
    pub timestamp_milliseconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    #[serde(default)]
    pub error_description: String,
}

impl Operation {
    pub fn assign(path: &str, value: FieldValue) -> Self {
        let kind = match value {
            FieldValue::String(value) => OperationKind::AssignString { value },
            FieldValue::Datetime(value) => OperationKind::AssignDatetime {
                value_milliseconds: value.timestamp_millis(),
            },
            FieldValue::StringSet(values) => OperationKind::AddStrings { values },
        };
        Self {
            path: path.to_string(),
            kind,
        }
    }

    pub fn log_floats(path: &str, points: &[SeriesPoint]) -> Self {
        let entries = points
            .iter()
            .map(|point| FloatEntry {
                value: point.value,
                step: point.step,
                timestamp_milliseconds: (point.timestamp * 1000.0).round() as i64,
            })
            .collect();
        Self {
            path: path.to_string(),
            kind: OperationKind::LogFloats { entries },
        }
    }

    pub fn reset_file_set(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: OperationKind::UploadFileSet {
                file_globs: Vec::new(),
                reset: true,
            },
        }
    }
}
