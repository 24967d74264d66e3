use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A dynamic option value as it crosses the plugin socket.
///
/// Plugin options are heterogeneous JSON scalars (a size is a number,
/// a description is a string, a flag is a bool). Modeling them as a
/// small tagged type keeps the hot paths free of generic JSON
/// reflection while still serialising to the natural wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<OptionValue>),
    Map(BTreeMap<String, OptionValue>),
}

/// An option map keyed by option name.
///
/// A `BTreeMap` keeps construction deterministic: identical inputs
/// produce identical maps, which the provisioner relies on when
/// comparing and logging option sets.
pub type OptionsMap = BTreeMap<String, OptionValue>;

impl OptionValue {
    /// Returns the string form when the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer form, converting numeric strings as well.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            OptionValue::Float(f) => Some(*f as i64),
            OptionValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Returns the boolean form, converting "true"/"false" strings.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            OptionValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(x) => write!(f, "{}", x),
            OptionValue::String(s) => write!(f, "{}", s),
            other => {
                let json = serde_json::to_string(other).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::String(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::String(s)
    }
}

impl From<i64> for OptionValue {
    fn from(i: i64) -> Self {
        OptionValue::Int(i)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_wire_shape() {
        let mut map = OptionsMap::new();
        map.insert("size".to_string(), OptionValue::Int(16));
        map.insert("description".to_string(), OptionValue::from("fast"));
        map.insert("thin".to_string(), OptionValue::Bool(true));

        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"size": 16, "description": "fast", "thin": true})
        );
    }

    #[test]
    fn test_untagged_round_trip() {
        let json = serde_json::json!({
            "size": 10,
            "ratio": 1.5,
            "name": "vol",
            "flags": ["a", "b"],
            "nested": {"k": "v"}
        });
        let map: OptionsMap = serde_json::from_value(json).unwrap();
        assert_eq!(map["size"], OptionValue::Int(10));
        assert_eq!(map["ratio"], OptionValue::Float(1.5));
        assert_eq!(map["name"], OptionValue::from("vol"));
        assert!(matches!(map["flags"], OptionValue::Array(_)));
        assert!(matches!(map["nested"], OptionValue::Map(_)));
    }

    #[test]
    fn test_as_i64_coerces_strings() {
        assert_eq!(OptionValue::from("123").as_i64(), Some(123));
        assert_eq!(OptionValue::Int(7).as_i64(), Some(7));
        assert_eq!(OptionValue::from("nope").as_i64(), None);
    }

    #[test]
    fn test_as_bool_coerces_strings() {
        assert_eq!(OptionValue::from("true").as_bool(), Some(true));
        assert_eq!(OptionValue::Bool(false).as_bool(), Some(false));
        assert_eq!(OptionValue::Int(1).as_bool(), None);
    }
}
