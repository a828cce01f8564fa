use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw per-target settings as they come out of the configuration source
pub type Settings = Map<String, Value>;

/// Input widget a settings form should render for a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Password,
    Number,
    Checkbox,
    Url,
    List,
    Select { options: Vec<String> },
}

/// One entry of a target's settings schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl SettingsField {
    pub fn new(key: &str, field_type: FieldType, label: &str) -> Self {
        Self {
            key: key.to_string(),
            field_type,
            label: label.to_string(),
            help: None,
            default: None,
            required: false,
        }
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Overlay `overrides` on `defaults`. Null overrides keep the default.
pub fn merge_settings(defaults: &Settings, overrides: &Settings) -> Settings {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        if !value.is_null() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Deserialize settings into a target's typed configuration, filling every
/// missing key from `T::default()`.
pub fn typed_settings<T>(settings: &Settings) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let defaults = match serde_json::to_value(T::default())? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let merged = merge_settings(&defaults, settings);
    serde_json::from_value(Value::Object(merged))
        .map_err(|e| Error::ConfigParse(format!("invalid settings: {}", e)))
}

/// True when the optional string holds something other than whitespace
pub fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Push a "<label> is required" problem for every blank field
pub fn require(problems: &mut Vec<String>, fields: &[(&str, &Option<String>)]) {
    for (label, value) in fields {
        if !is_set(value) {
            problems.push(format!("{} is required", label));
        }
    }
}
