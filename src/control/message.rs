//! Messages exchanged between the two sides of a control sheet.

use super::field::{FieldConfig, FieldValue};
use serde::{Deserialize, Serialize};

/// Worker to host: authoritative changes the mirror must apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetUpdate {
    Enabled { field: String, enabled: bool },
    Config { field: String, config: FieldConfig },
    Value { field: String, value: FieldValue },
}

impl SheetUpdate {
    pub fn field(&self) -> &str {
        match self {
            SheetUpdate::Enabled { field, .. }
            | SheetUpdate::Config { field, .. }
            | SheetUpdate::Value { field, .. } => field,
        }
    }
}

/// Host to worker: requests the worker validates and may correct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetRequest {
    SetValue { field: String, value: FieldValue },
    Signal { field: String },
}

impl SheetRequest {
    pub fn field(&self) -> &str {
        match self {
            SheetRequest::SetValue { field, .. } | SheetRequest::Signal { field } => field,
        }
    }
}
