//! Control field kinds, configurations and sheet schemas.

use super::SheetError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The closed set of control field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Number,
    Flag,
    Signal,
    DynamicSingleSwitch,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::Number => "number",
            FieldKind::Flag => "flag",
            FieldKind::Signal => "signal",
            FieldKind::DynamicSingleSwitch => "switch",
        };
        f.write_str(name)
    }
}

/// Range, step and display precision of a number field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberConfig {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub decimals: u32,
    /// Whether the UI may push values while a slider is still moving.
    pub allow_instant_update: bool,
}

impl NumberConfig {
    /// Create a config; `min` and `max` are swapped if given backwards.
    /// Decimals are derived from `step`.
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let step = if step.is_finite() && step > 0.0 { step } else { 0.0 };
        Self {
            min,
            max,
            step,
            decimals: decimals_of(step),
            allow_instant_update: false,
        }
    }

    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn with_instant_update(mut self, allow: bool) -> Self {
        self.allow_instant_update = allow;
        self
    }

    /// Bring `value` into range, onto the step grid and to `decimals`
    /// digits. NaN maps to `min`.
    pub fn clamp(&self, value: f64) -> f64 {
        let value = if value.is_nan() { self.min } else { value };
        let mut v = value.clamp(self.min, self.max);
        if self.step > 0.0 {
            v = self.min + ((v - self.min) / self.step).round() * self.step;
        }
        let scale = 10f64.powi(self.decimals.min(12) as i32);
        v = (v * scale).round() / scale;
        v.clamp(self.min, self.max)
    }
}

fn decimals_of(step: f64) -> u32 {
    if step <= 0.0 {
        return 6;
    }
    let mut d = 0;
    while d < 6 {
        let scaled = step * 10f64.powi(d as i32);
        if (scaled - scaled.round()).abs() < 1e-9 {
            break;
        }
        d += 1;
    }
    d
}

/// Choices offered by a single-selection switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceConfig {
    pub choices: Vec<String>,
    /// Label shown when nothing is selected, if "nothing" is allowed.
    pub none_choice_name: Option<String>,
}

impl ChoiceConfig {
    pub fn new<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            choices: choices.into_iter().map(Into::into).collect(),
            none_choice_name: None,
        }
    }

    pub fn with_none_choice(mut self, name: impl Into<String>) -> Self {
        self.none_choice_name = Some(name.into());
        self
    }

    /// Out-of-range selections become no selection.
    pub fn normalize(&self, index: Option<usize>) -> Option<usize> {
        index.filter(|i| *i < self.choices.len())
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.choices.get(index).map(String::as_str)
    }
}

/// Per-kind configuration of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldConfig {
    Number(NumberConfig),
    Flag,
    Signal,
    Switch(ChoiceConfig),
}

impl FieldConfig {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldConfig::Number(_) => FieldKind::Number,
            FieldConfig::Flag => FieldKind::Flag,
            FieldConfig::Signal => FieldKind::Signal,
            FieldConfig::Switch(_) => FieldKind::DynamicSingleSwitch,
        }
    }

    /// Validate `value` against this config, correcting it where possible.
    pub fn coerce(&self, value: FieldValue) -> Option<FieldValue> {
        match (self, value) {
            (FieldConfig::Number(cfg), FieldValue::Number(v)) => Some(FieldValue::Number(cfg.clamp(v))),
            (FieldConfig::Flag, FieldValue::Flag(v)) => Some(FieldValue::Flag(v)),
            (FieldConfig::Signal, FieldValue::Signal) => Some(FieldValue::Signal),
            (FieldConfig::Switch(cfg), FieldValue::Selection(i)) => {
                Some(FieldValue::Selection(cfg.normalize(i)))
            }
            _ => None,
        }
    }
}

/// Current value of a field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Number(f64),
    Flag(bool),
    Selection(Option<usize>),
    Signal,
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Flag(_) => FieldKind::Flag,
            FieldValue::Selection(_) => FieldKind::DynamicSingleSwitch,
            FieldValue::Signal => FieldKind::Signal,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_selection(&self) -> Option<usize> {
        match self {
            FieldValue::Selection(v) => *v,
            _ => None,
        }
    }
}

/// One field as held by either side of a sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlField {
    name: String,
    enabled: bool,
    config: FieldConfig,
    value: FieldValue,
}

impl ControlField {
    pub(crate) fn from_spec(spec: &FieldSpec) -> Self {
        Self {
            name: spec.name.clone(),
            enabled: false,
            config: spec.config.clone(),
            value: spec.default,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.config.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    pub fn value(&self) -> FieldValue {
        self.value
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn set_config_raw(&mut self, config: FieldConfig) {
        self.config = config;
    }

    pub(crate) fn set_value_raw(&mut self, value: FieldValue) {
        self.value = value;
    }

    pub(crate) fn check_kind(&self, actual: FieldKind) -> Result<(), SheetError> {
        if self.kind() == actual {
            Ok(())
        } else {
            Err(SheetError::KindMismatch {
                field: self.name.clone(),
                expected: self.kind(),
                actual,
            })
        }
    }
}

/// Declaration of one field: name, initial config and default value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub config: FieldConfig,
    pub default: FieldValue,
}

/// Ordered, validated set of field declarations for one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetSchema {
    fields: Vec<FieldSpec>,
}

impl SheetSchema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    fn push(mut self, name: &str, config: FieldConfig, default: FieldValue) -> Self {
        let default = config.coerce(default).unwrap_or(default);
        self.fields.push(FieldSpec {
            name: name.to_string(),
            config,
            default,
        });
        self
    }

    pub fn number(self, name: &str, config: NumberConfig, default: f64) -> Self {
        self.push(name, FieldConfig::Number(config), FieldValue::Number(default))
    }

    pub fn flag(self, name: &str, default: bool) -> Self {
        self.push(name, FieldConfig::Flag, FieldValue::Flag(default))
    }

    pub fn signal(self, name: &str) -> Self {
        self.push(name, FieldConfig::Signal, FieldValue::Signal)
    }

    pub fn switch(self, name: &str, config: ChoiceConfig, default: Option<usize>) -> Self {
        self.push(name, FieldConfig::Switch(config), FieldValue::Selection(default))
    }

    /// Finish the schema, rejecting duplicate names.
    pub fn build(self) -> Result<SheetSchema, SheetError> {
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SheetError::DuplicateField(field.name.clone()));
            }
        }
        Ok(SheetSchema {
            fields: self.fields,
        })
    }
}
