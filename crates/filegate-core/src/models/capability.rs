use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Form fields that were not files, as sent by the client.
pub type RawOptions = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityGroup {
    Image,
    Video,
    Audio,
    Pdf,
    Conversion,
}

impl CapabilityGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityGroup::Image => "image",
            CapabilityGroup::Video => "video",
            CapabilityGroup::Audio => "audio",
            CapabilityGroup::Pdf => "pdf",
            CapabilityGroup::Conversion => "conversion",
        }
    }
}

/// Whether a capability can run without any uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InputPolicy {
    Required,
    Optional,
}

/// Option names a capability understands, with their defaults. `Value::Null`
/// marks an option without a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OptionSchema(BTreeMap<String, Value>);

impl OptionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, default: impl Into<Value>) -> Self {
        self.0.insert(name.to_string(), default.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Schema defaults overlaid with the client's values, kept exactly as
    /// sent. Unknown keys are dropped; an empty string counts as "not
    /// provided".
    pub fn merge(&self, raw: &RawOptions) -> Options {
        let mut values = self.0.clone();
        for (name, value) in raw {
            if let Some(slot) = values.get_mut(name) {
                if !value.is_empty() {
                    *slot = Value::String(value.clone());
                }
            }
        }
        Options(values)
    }
}

/// Merged, per-request options handed to a handler. Form values arrive as
/// strings, so the typed getters parse either representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, Value>);

impl Options {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// A keyword option (format, position, ...) with surrounding whitespace
    /// removed. Blank counts as missing.
    pub fn get_keyword(&self, name: &str) -> Option<String> {
        self.get_str(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.get(name)? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        }
    }

    pub fn get_f32(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64().map(|v| v as f32),
            Value::String(s) => s.trim().parse::<f32>().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Options {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Options(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_applies_defaults_and_overrides() {
        let schema = OptionSchema::new().with("quality", 85).with("format", "jpg");
        let options = schema.merge(&raw(&[("quality", "50")]));
        assert_eq!(options.get_u32("quality"), Some(50));
        assert_eq!(options.get_str("format").as_deref(), Some("jpg"));
    }

    #[test]
    fn merge_ignores_unknown_keys() {
        let schema = OptionSchema::new().with("quality", 85);
        let options = schema.merge(&raw(&[("evil", "1")]));
        assert!(options.get("evil").is_none());
    }

    #[test]
    fn empty_value_keeps_default() {
        let schema = OptionSchema::new().with("text", "SAMPLE");
        let options = schema.merge(&raw(&[("text", "")]));
        assert_eq!(options.get_str("text").as_deref(), Some("SAMPLE"));
    }

    #[test]
    fn free_text_is_passed_through_verbatim() {
        let schema = OptionSchema::new()
            .with("password", Value::Null)
            .with("secret", Value::Null);
        let options = schema.merge(&raw(&[("password", " pw "), ("secret", "   ")]));
        assert_eq!(options.get_str("password").as_deref(), Some(" pw "));
        assert_eq!(options.get_str("secret").as_deref(), Some("   "));
    }

    #[test]
    fn keywords_and_numbers_tolerate_padding() {
        let schema = OptionSchema::new()
            .with("position", "center")
            .with("quality", 85)
            .with("format", Value::Null);
        let options = schema.merge(&raw(&[("position", " Top-Left "), ("quality", " 40 "), ("format", "  ")]));
        assert_eq!(options.get_keyword("position").as_deref(), Some("Top-Left"));
        assert_eq!(options.get_u32("quality"), Some(40));
        assert_eq!(options.get_keyword("format"), None);
    }

    #[test]
    fn null_default_reads_as_missing() {
        let schema = OptionSchema::new().with("password", Value::Null);
        let options = schema.merge(&RawOptions::new());
        assert_eq!(options.get_str("password"), None);
    }

    #[test]
    fn typed_getters_parse_strings() {
        let schema = OptionSchema::new()
            .with("bold", false)
            .with("opacity", 0.3)
            .with("scale", 2);
        let options = schema.merge(&raw(&[("bold", "true"), ("opacity", "0.5"), ("scale", "four")]));
        assert_eq!(options.get_bool("bold"), Some(true));
        assert_eq!(options.get_f32("opacity"), Some(0.5));
        assert_eq!(options.get_u32("scale"), None);
    }
}
