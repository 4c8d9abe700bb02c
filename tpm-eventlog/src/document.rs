// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Structured boot event log tree as produced by the event log decoder

use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use yaml_rust2::{Yaml, YamlLoader};

use crate::ParseError;

/// Mapping key of a decoded log
///
/// The decoder emits native integers for PCR indices, which never compare
/// equal to the string keys used everywhere else. See
/// [`crate::enrich::stringify_pcr_keys`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum LogKey {
    Int(i64),
    Str(String),
}

impl LogKey {
    fn from_yaml(yaml: &Yaml) -> Self {
        match yaml {
            Yaml::Integer(i) => LogKey::Int(*i),
            Yaml::String(s) | Yaml::Real(s) => LogKey::Str(s.clone()),
            Yaml::Boolean(b) => LogKey::Str(b.to_string()),
            _ => LogKey::Str("~".to_string()),
        }
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKey::Int(i) => write!(f, "{i}"),
            LogKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for LogKey {
    fn from(s: &str) -> Self {
        LogKey::Str(s.to_string())
    }
}

pub type LogMapping = BTreeMap<LogKey, LogValue>;

/// A node of the decoded event log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Numbers that do not fit an `i64`, kept as their source text
    Real(String),
    String(String),
    Sequence(Vec<LogValue>),
    Mapping(LogMapping),
}

impl LogValue {
    pub fn from_yaml(yaml: &Yaml) -> Self {
        match yaml {
            Yaml::Integer(i) => LogValue::Integer(*i),
            Yaml::Real(s) => LogValue::Real(s.clone()),
            Yaml::String(s) => LogValue::String(s.clone()),
            Yaml::Boolean(b) => LogValue::Bool(*b),
            Yaml::Array(items) => LogValue::Sequence(items.iter().map(Self::from_yaml).collect()),
            Yaml::Hash(hash) => LogValue::Mapping(
                hash.iter()
                    .map(|(k, v)| (LogKey::from_yaml(k), Self::from_yaml(v)))
                    .collect(),
            ),
            Yaml::Alias(_) | Yaml::Null | Yaml::BadValue => LogValue::Null,
        }
    }

    pub fn as_mapping(&self) -> Option<&LogMapping> {
        match self {
            LogValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut LogMapping> {
        match self {
            LogValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LogValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a string key in a mapping node
    pub fn get(&self, key: &str) -> Option<&LogValue> {
        self.as_mapping()?.get(&LogKey::from(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut LogValue> {
        self.as_mapping_mut()?.get_mut(&LogKey::from(key))
    }

    /// Interpret a non-negative integer node as hex digits without leading zeros
    ///
    /// Accepts native integers, `0x`-prefixed hex text and arbitrarily long
    /// decimal text. Zero is rendered as `"0"`.
    pub fn integer_hex(&self) -> Option<String> {
        match self {
            LogValue::Integer(i) if *i >= 0 => Some(format!("{i:x}")),
            LogValue::String(s) | LogValue::Real(s) => text_integer_hex(s.trim()),
            _ => None,
        }
    }
}

fn text_integer_hex(text: &str) -> Option<String> {
    if let Some(digits) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        return Some(strip_leading_zeros(&digits.to_ascii_lowercase()));
    }
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Little-endian base-256 accumulator
    let mut bytes: Vec<u8> = Vec::new();
    for digit in text.bytes() {
        let mut carry = u32::from(digit - b'0');
        for byte in bytes.iter_mut() {
            let v = u32::from(*byte) * 10 + carry;
            *byte = (v & 0xff) as u8;
            carry = v >> 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    bytes.reverse();
    Some(strip_leading_zeros(&hex::encode(bytes)))
}

fn strip_leading_zeros(digits: &str) -> String {
    match digits.trim_start_matches('0') {
        "" => "0".to_string(),
        rest => rest.to_string(),
    }
}

/// Parse the decoder's YAML output into a log tree
pub fn parse_yaml(text: &str) -> Result<LogValue, ParseError> {
    let docs = YamlLoader::load_from_str(text).map_err(|e| ParseError::Yaml(e.to_string()))?;
    let doc = docs.first().ok_or(ParseError::EmptyDocument)?;
    Ok(LogValue::from_yaml(doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_keeps_integer_keys() {
        let log = parse_yaml("pcrs:\n  sha256:\n    0  : 0x01\n    1  : 2\n").unwrap();
        let cells = log
            .get("pcrs")
            .and_then(|p| p.get("sha256"))
            .and_then(LogValue::as_mapping)
            .unwrap();
        assert!(cells.contains_key(&LogKey::Int(0)));
        assert!(cells.contains_key(&LogKey::Int(1)));
        assert!(!cells.contains_key(&LogKey::from("0")));
    }

    #[test]
    fn test_integer_hex_forms() {
        assert_eq!(LogValue::Integer(255).integer_hex().unwrap(), "ff");
        assert_eq!(LogValue::Integer(0).integer_hex().unwrap(), "0");
        assert_eq!(LogValue::Integer(-1).integer_hex(), None);
        assert_eq!(
            LogValue::String("0x00ABcd".into()).integer_hex().unwrap(),
            "abcd"
        );
        // 2^64 does not fit an i64 and arrives as text
        assert_eq!(
            LogValue::Real("18446744073709551616".into())
                .integer_hex()
                .unwrap(),
            "10000000000000000"
        );
        assert_eq!(LogValue::String("12ab".into()).integer_hex(), None);
        assert_eq!(LogValue::String("0x".into()).integer_hex(), None);
        assert_eq!(LogValue::Bool(true).integer_hex(), None);
    }

    #[test]
    fn test_large_hex_scalar_survives_yaml() {
        let digest = "3d458cfe55cc03ea1f443f1562beec8df51c75e14a9fcf9a7234a13f198e7969";
        let log = parse_yaml(&format!("pcrs:\n  sha256:\n    0  : 0x{digest}\n")).unwrap();
        let value = log
            .get("pcrs")
            .and_then(|p| p.get("sha256"))
            .and_then(LogValue::as_mapping)
            .and_then(|m| m.get(&LogKey::Int(0)))
            .unwrap();
        assert_eq!(value.integer_hex().unwrap(), digest);
    }

    #[test]
    fn test_parse_yaml_errors() {
        assert!(matches!(parse_yaml(""), Err(ParseError::EmptyDocument)));
        assert!(matches!(
            parse_yaml("key: [unclosed"),
            Err(ParseError::Yaml(_))
        ));
    }

    #[test]
    fn test_serialize_to_json() {
        let log = parse_yaml("pcrs:\n  sha1:\n    7  : 5\nname: x\n").unwrap();
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["pcrs"]["sha1"]["7"], 5);
        assert_eq!(json["name"], "x");
    }
}
