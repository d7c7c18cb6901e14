//! Authoritative side of a control sheet.

use super::field::{ControlField, FieldConfig, FieldKind, FieldValue, SheetSchema};
use super::message::{SheetRequest, SheetUpdate};
use super::SheetError;
use crate::backend::state::{StateValue, WorkerState};
use std::collections::BTreeMap;

type ChangeCallback = Box<dyn FnMut(&FieldValue) + Send>;

/// Worker-owned sheet. Every accepted change is clamped, published to the
/// host, written into the stage's [`WorkerState`] and handed to the field's
/// callback, in that order.
pub struct WorkerSheet {
    fields: Vec<ControlField>,
    callbacks: BTreeMap<String, ChangeCallback>,
    state: WorkerState,
    updates: Vec<SheetUpdate>,
    state_dirty: bool,
}

impl WorkerSheet {
    /// Build a sheet whose values come from `state`, falling back to schema
    /// defaults. All fields start disabled.
    pub fn new(schema: &SheetSchema, state: WorkerState) -> Self {
        let fields = schema
            .fields()
            .iter()
            .map(|spec| {
                let mut field = ControlField::from_spec(spec);
                if let Some(v) = restored_value(&spec.config, &state, &spec.name) {
                    field.set_value_raw(v);
                }
                field
            })
            .collect();
        Self {
            fields,
            callbacks: BTreeMap::new(),
            state,
            updates: Vec::new(),
            state_dirty: false,
        }
    }

    fn index(&self, name: &str) -> Result<usize, SheetError> {
        self.fields
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| SheetError::UnknownField(name.to_string()))
    }

    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn fields(&self) -> &[ControlField] {
        &self.fields
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Persist a value that is not backed by a field.
    pub fn store_extra(&mut self, name: &str, value: StateValue) {
        if self.state.get(name) != Some(value) {
            self.state.set(name, value);
            self.state_dirty = true;
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.field(name).is_some_and(ControlField::is_enabled)
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

    /// Register the callback run after each accepted change of `name`.
    /// Replaces any earlier callback.
    pub fn call_on_change<F>(&mut self, name: &str, callback: F) -> Result<(), SheetError>
    where
        F: FnMut(&FieldValue) + Send + 'static,
    {
        self.index(name)?;
        self.callbacks.insert(name.to_string(), Box::new(callback));
        Ok(())
    }

    pub fn enable(&mut self, name: &str) -> Result<(), SheetError> {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> Result<(), SheetError> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), SheetError> {
        let idx = self.index(name)?;
        let field = &mut self.fields[idx];
        field.set_enabled(enabled);
        if enabled {
            // The mirror may have missed earlier changes while disabled.
            self.updates.push(SheetUpdate::Config {
                field: name.to_string(),
                config: field.config().clone(),
            });
            self.updates.push(SheetUpdate::Value {
                field: name.to_string(),
                value: field.value(),
            });
        }
        self.updates.push(SheetUpdate::Enabled {
            field: name.to_string(),
            enabled,
        });
        Ok(())
    }

    pub fn enable_all(&mut self) {
        let names: Vec<String> = self.fields.iter().map(|f| f.name().to_string()).collect();
        for name in names {
            let _ = self.enable(&name);
        }
    }

    pub fn disable_all(&mut self) {
        let names: Vec<String> = self.fields.iter().map(|f| f.name().to_string()).collect();
        for name in names {
            let _ = self.disable(&name);
        }
    }

    /// Replace a field's config. The current value is re-validated and, if
    /// it had to change, goes through the normal change path.
    pub fn set_config(&mut self, name: &str, config: FieldConfig) -> Result<(), SheetError> {
        let idx = self.index(name)?;
        self.fields[idx].check_kind(config.kind())?;
        self.fields[idx].set_config_raw(config.clone());
        self.updates.push(SheetUpdate::Config {
            field: name.to_string(),
            config,
        });
        let current = self.fields[idx].value();
        let corrected = self.fields[idx].config().coerce(current).unwrap_or(current);
        if corrected != current {
            self.set_value(name, corrected)?;
        }
        Ok(())
    }

    /// Worker-side set. Always accepted: invalid input is corrected, never
    /// rejected. Returns the value actually stored.
    pub fn set_value(&mut self, name: &str, value: FieldValue) -> Result<FieldValue, SheetError> {
        let idx = self.index(name)?;
        self.fields[idx].check_kind(value.kind())?;
        let stored = self.fields[idx].config().coerce(value).unwrap_or(value);

        if stored != FieldValue::Signal {
            self.fields[idx].set_value_raw(stored);
            self.updates.push(SheetUpdate::Value {
                field: name.to_string(),
                value: stored,
            });
            self.persist(name, stored);
        }

        if let Some(callback) = self.callbacks.get_mut(name) {
            callback(&stored);
        }
        Ok(stored)
    }

    pub fn set_number(&mut self, name: &str, value: f64) -> Result<f64, SheetError> {
        let stored = self.set_value(name, FieldValue::Number(value))?;
        Ok(stored.as_number().unwrap_or(value))
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> Result<(), SheetError> {
        self.set_value(name, FieldValue::Flag(value)).map(|_| ())
    }

    pub fn set_selection(&mut self, name: &str, index: Option<usize>) -> Result<Option<usize>, SheetError> {
        let stored = self.set_value(name, FieldValue::Selection(index))?;
        Ok(stored.as_selection())
    }

    fn persist(&mut self, name: &str, value: FieldValue) {
        match value {
            FieldValue::Number(v) => self.state.set(name, StateValue::Float(v)),
            FieldValue::Flag(v) => self.state.set(name, StateValue::Bool(v)),
            FieldValue::Selection(Some(i)) => self.state.set(name, StateValue::Int(i as i64)),
            FieldValue::Selection(None) => {
                self.state.unset(name);
            }
            FieldValue::Signal => return,
        }
        self.state_dirty = true;
    }

    /// Apply a request forwarded from the host. Requests against disabled
    /// fields are refused and leave the value untouched.
    pub fn handle_request(&mut self, request: SheetRequest) -> Result<(), SheetError> {
        let idx = self.index(request.field())?;
        if !self.fields[idx].is_enabled() {
            return Err(SheetError::Disabled(request.field().to_string()));
        }
        match request {
            SheetRequest::SetValue { field, value } => self.set_value(&field, value).map(|_| ()),
            SheetRequest::Signal { field } => {
                self.fields[idx].check_kind(FieldKind::Signal)?;
                self.set_value(&field, FieldValue::Signal).map(|_| ())
            }
        }
    }

    /// Updates accumulated since the last call, oldest first.
    pub fn take_updates(&mut self) -> Vec<SheetUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// A copy of the state if it changed since the last call.
    pub fn take_dirty_state(&mut self) -> Option<WorkerState> {
        if self.state_dirty {
            self.state_dirty = false;
            Some(self.state.clone())
        } else {
            None
        }
    }
}

impl std::fmt::Debug for WorkerSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSheet")
            .field("fields", &self.fields)
            .field("pending_updates", &self.updates.len())
            .finish()
    }
}

fn restored_value(config: &FieldConfig, state: &WorkerState, name: &str) -> Option<FieldValue> {
    let raw = match config {
        FieldConfig::Number(_) => FieldValue::Number(state.float(name)?),
        FieldConfig::Flag => FieldValue::Flag(state.bool(name)?),
        FieldConfig::Switch(_) => {
            let i = state.int(name)?;
            FieldValue::Selection(usize::try_from(i).ok())
        }
        FieldConfig::Signal => return None,
    };
    config.coerce(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::field::{ChoiceConfig, NumberConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn schema() -> SheetSchema {
        SheetSchema::builder()
            .number("face_coverage", NumberConfig::new(0.1, 4.0, 0.1).with_decimals(1), 2.2)
            .flag("head_mode", false)
            .switch("device", ChoiceConfig::new(["cpu", "gpu"]), Some(0))
            .signal("reset")
            .build()
            .unwrap()
    }

    #[test]
    fn test_defaults_when_state_empty() {
        let sheet = WorkerSheet::new(&schema(), WorkerState::new());
        assert_eq!(sheet.number("face_coverage"), Some(2.2));
        assert_eq!(sheet.flag("head_mode"), Some(false));
        assert_eq!(sheet.selection("device"), Some(0));
        assert!(!sheet.is_enabled("face_coverage"));
    }

    #[test]
    fn test_restores_and_clamps_persisted_values() {
        let mut state = WorkerState::new();
        state.set("face_coverage", StateValue::Float(9.0));
        state.set("head_mode", StateValue::Bool(true));
        state.set("device", StateValue::Int(7));
        let sheet = WorkerSheet::new(&schema(), state);
        assert_eq!(sheet.number("face_coverage"), Some(4.0));
        assert_eq!(sheet.flag("head_mode"), Some(true));
        assert_eq!(sheet.selection("device"), None);
    }

    #[test]
    fn test_set_value_clamps_publishes_persists_and_calls_back() {
        let mut sheet = WorkerSheet::new(&schema(), WorkerState::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        sheet
            .call_on_change("face_coverage", move |v| {
                assert_eq!(*v, FieldValue::Number(4.0));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(sheet.set_number("face_coverage", 12.0).unwrap(), 4.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sheet.take_updates(),
            vec![SheetUpdate::Value {
                field: "face_coverage".into(),
                value: FieldValue::Number(4.0)
            }]
        );
        let state = sheet.take_dirty_state().unwrap();
        assert_eq!(state.float("face_coverage"), Some(4.0));
        assert!(sheet.take_dirty_state().is_none());
    }

    #[test]
    fn test_request_against_disabled_field_is_refused() {
        let mut sheet = WorkerSheet::new(&schema(), WorkerState::new());
        let err = sheet
            .handle_request(SheetRequest::SetValue {
                field: "head_mode".into(),
                value: FieldValue::Flag(true),
            })
            .unwrap_err();
        assert_eq!(err, SheetError::Disabled("head_mode".into()));
        assert_eq!(sheet.flag("head_mode"), Some(false));

        sheet.enable("head_mode").unwrap();
        sheet
            .handle_request(SheetRequest::SetValue {
                field: "head_mode".into(),
                value: FieldValue::Flag(true),
            })
            .unwrap();
        assert_eq!(sheet.flag("head_mode"), Some(true));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut sheet = WorkerSheet::new(&schema(), WorkerState::new());
        assert!(matches!(
            sheet.set_value("head_mode", FieldValue::Number(1.0)),
            Err(SheetError::KindMismatch { .. })
        ));
        assert!(matches!(
            sheet.set_value("missing", FieldValue::Flag(true)),
            Err(SheetError::UnknownField(_))
        ));
    }

    #[test]
    fn test_signal_invokes_callback_without_persisting() {
        let mut sheet = WorkerSheet::new(&schema(), WorkerState::new());
        sheet.enable_all();
        sheet.take_updates();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        sheet
            .call_on_change("reset", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        sheet
            .handle_request(SheetRequest::Signal { field: "reset".into() })
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(sheet.take_updates().is_empty());
        assert!(sheet.take_dirty_state().is_none());
    }

    #[test]
    fn test_set_config_recorrects_value() {
        let mut sheet = WorkerSheet::new(&schema(), WorkerState::new());
        sheet.set_selection("device", Some(1)).unwrap();
        sheet
            .set_config("device", FieldConfig::Switch(ChoiceConfig::new(["cpu"])))
            .unwrap();
        assert_eq!(sheet.selection("device"), None);
        assert!(sheet.state().get("device").is_none());
        assert!(sheet
            .set_config("device", FieldConfig::Flag)
            .is_err());
    }

    #[test]
    fn test_enable_republishes_current_value() {
        let mut sheet = WorkerSheet::new(&schema(), WorkerState::new());
        sheet.enable("head_mode").unwrap();
        let updates = sheet.take_updates();
        assert!(updates.contains(&SheetUpdate::Value {
            field: "head_mode".into(),
            value: FieldValue::Flag(false)
        }));
        assert_eq!(
            updates.last(),
            Some(&SheetUpdate::Enabled {
                field: "head_mode".into(),
                enabled: true
            })
        );
    }
}
