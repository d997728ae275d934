//! Setting values and maps

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered mapping from setting key to value.
///
/// A `BTreeMap` keeps iteration order stable, so two snapshots of the same
/// scene encode byte-identical `Setting` payloads.
pub type SettingMap = BTreeMap<String, SettingValue>;

/// A scalar setting value as understood by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    /// Textual form sent on the wire.
    ///
    /// Booleans use the capitalised spelling the engine's setting parser expects.
    pub fn to_wire_string(&self) -> String {
        match self {
            SettingValue::Bool(true) => "True".to_string(),
            SettingValue::Bool(false) => "False".to_string(),
            SettingValue::Int(v) => v.to_string(),
            SettingValue::Float(v) => v.to_string(),
            SettingValue::Text(v) => v.clone(),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        SettingValue::Int(value as i64)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}
