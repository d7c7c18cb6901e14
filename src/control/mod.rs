//! Control sheets: typed, range-checked stage parameters mirrored across the
//! host/worker boundary.
//!
//! Each stage declares a [`SheetSchema`]. The worker owns a [`WorkerSheet`],
//! which validates every change, persists it into the stage's
//! [`WorkerState`](crate::backend::WorkerState) and publishes the result as
//! [`SheetUpdate`]s. The host keeps a [`HostSheet`] mirror that only forwards
//! [`SheetRequest`]s and changes once the worker confirms.

pub mod field;
pub mod host;
pub mod message;
pub mod worker;

pub use field::{
    ChoiceConfig, ControlField, FieldConfig, FieldKind, FieldSpec, FieldValue, NumberConfig,
    SchemaBuilder, SheetSchema,
};
pub use host::HostSheet;
pub use message::{SheetRequest, SheetUpdate};
pub use worker::WorkerSheet;

use thiserror::Error;

/// Errors from declaring or driving a control sheet.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SheetError {
    #[error("Unknown control field '{0}'")]
    UnknownField(String),

    #[error("Field '{field}' is a {expected} field, got a {actual} value")]
    KindMismatch {
        field: String,
        expected: FieldKind,
        actual: FieldKind,
    },

    #[error("Field '{0}' is disabled")]
    Disabled(String),

    #[error("Field '{0}' is declared twice")]
    DuplicateField(String),
}
