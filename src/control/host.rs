//! Mirroring side of a control sheet.

use super::field::{ControlField, FieldConfig, FieldKind, FieldValue, SheetSchema};
use super::message::{SheetRequest, SheetUpdate};
use super::SheetError;
use std::collections::BTreeMap;

type ChangeCallback = Box<dyn FnMut(&FieldValue) + Send>;

/// Read-only mirror used by the embedding application. Setting a value
/// queues a request for the worker; the mirror itself only changes when
/// the worker's confirmation arrives through [`HostSheet::apply_update`].
pub struct HostSheet {
    fields: Vec<ControlField>,
    callbacks: BTreeMap<String, Vec<ChangeCallback>>,
    outbox: Vec<SheetRequest>,
}

impl HostSheet {
    pub fn new(schema: &SheetSchema) -> Self {
        Self {
            fields: schema.fields().iter().map(ControlField::from_spec).collect(),
            callbacks: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    fn field_mut(&mut self, name: &str) -> Result<&mut ControlField, SheetError> {
        self.fields
            .iter_mut()
            .find(|f| f.name() == name)
            .ok_or_else(|| SheetError::UnknownField(name.to_string()))
    }

    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> &[ControlField] {
        &self.fields
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.field(name).is_some_and(ControlField::is_enabled)
    }

    pub fn config(&self, name: &str) -> Option<&FieldConfig> {
        self.field(name).map(ControlField::config)
    }

    pub fn value(&self, name: &str) -> Option<FieldValue> {
        self.field(name).map(ControlField::value)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.value(name)?.as_number()
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.value(name)?.as_flag()
    }

    pub fn selection(&self, name: &str) -> Option<usize> {
        self.value(name)?.as_selection()
    }

    /// Subscribe to confirmed value changes of `name`.
    pub fn call_on_change<F>(&mut self, name: &str, callback: F) -> Result<(), SheetError>
    where
        F: FnMut(&FieldValue) + Send + 'static,
    {
        self.field_mut(name)?;
        self.callbacks
            .entry(name.to_string())
            .or_default()
            .push(Box::new(callback));
        Ok(())
    }

    fn check_writable(&self, name: &str, kind: FieldKind) -> Result<(), SheetError> {
        let field = self
            .field(name)
            .ok_or_else(|| SheetError::UnknownField(name.to_string()))?;
        field.check_kind(kind)?;
        if !field.is_enabled() {
            return Err(SheetError::Disabled(name.to_string()));
        }
        Ok(())
    }

    /// Ask the worker to change a value.
    pub fn set_value(&mut self, name: &str, value: FieldValue) -> Result<(), SheetError> {
        self.check_writable(name, value.kind())?;
        self.outbox.push(SheetRequest::SetValue {
            field: name.to_string(),
            value,
        });
        Ok(())
    }

    pub fn set_number(&mut self, name: &str, value: f64) -> Result<(), SheetError> {
        self.set_value(name, FieldValue::Number(value))
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> Result<(), SheetError> {
        self.set_value(name, FieldValue::Flag(value))
    }

    pub fn set_selection(&mut self, name: &str, index: Option<usize>) -> Result<(), SheetError> {
        self.set_value(name, FieldValue::Selection(index))
    }

    /// Fire a signal field.
    pub fn signal(&mut self, name: &str) -> Result<(), SheetError> {
        self.check_writable(name, FieldKind::Signal)?;
        self.outbox.push(SheetRequest::Signal {
            field: name.to_string(),
        });
        Ok(())
    }

    /// Apply a worker confirmation to the mirror.
    pub fn apply_update(&mut self, update: SheetUpdate) -> Result<(), SheetError> {
        match update {
            SheetUpdate::Enabled { field, enabled } => {
                self.field_mut(&field)?.set_enabled(enabled);
            }
            SheetUpdate::Config { field, config } => {
                let f = self.field_mut(&field)?;
                f.check_kind(config.kind())?;
                f.set_config_raw(config);
            }
            SheetUpdate::Value { field, value } => {
                let f = self.field_mut(&field)?;
                f.check_kind(value.kind())?;
                let changed = f.value() != value;
                f.set_value_raw(value);
                if changed {
                    if let Some(callbacks) = self.callbacks.get_mut(&field) {
                        for cb in callbacks.iter_mut() {
                            cb(&value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Requests queued since the last call, oldest first.
    pub fn take_requests(&mut self) -> Vec<SheetRequest> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Mark every field disabled locally, keeping values. Used while the
    /// worker is not running.
    pub fn disable_all(&mut self) {
        for field in &mut self.fields {
            field.set_enabled(false);
        }
        self.outbox.clear();
    }
}

impl std::fmt::Debug for HostSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSheet")
            .field("fields", &self.fields)
            .field("queued_requests", &self.outbox.len())
            .finish()
    }
}
