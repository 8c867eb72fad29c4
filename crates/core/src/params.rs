//! Run parameters as a tagged variant
//!
//! Parameters arrive in three shapes: a flat string map, a rich JSON map,
//! or a raw string of `KEY=VALUE` tokens. Hashing for deterministic
//! sub-run IDs relies on the canonical JSON form being stable, which the
//! sorted map representations guarantee.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Discriminator for the parameter representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsType {
    Simple,
    Rich,
    Raw,
}

/// Parameters passed to a DAG run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Simple(BTreeMap<String, String>),
    Rich(BTreeMap<String, serde_json::Value>),
    Raw(String),
}

impl Default for Params {
    fn default() -> Self {
        Params::Simple(BTreeMap::new())
    }
}

impl Params {
    #[must_use]
    pub fn params_type(&self) -> ParamsType {
        match self {
            Params::Simple(_) => ParamsType::Simple,
            Params::Rich(_) => ParamsType::Rich,
            Params::Raw(_) => ParamsType::Raw,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Params::Simple(map) => map.is_empty(),
            Params::Rich(map) => map.is_empty(),
            Params::Raw(raw) => raw.trim().is_empty(),
        }
    }

    /// Materialize the parameters as a flat string map.
    ///
    /// Rich values that are not strings are rendered as compact JSON. Raw
    /// input is tokenized on whitespace; `KEY=VALUE` tokens keep their
    /// key, bare tokens get positional keys `1`, `2`, ….
    #[must_use]
    pub fn as_string_map(&self) -> BTreeMap<String, String> {
        match self {
            Params::Simple(map) => map.clone(),
            Params::Rich(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), json_value_to_string(v)))
                .collect(),
            Params::Raw(raw) => {
                let mut out = BTreeMap::new();
                let mut position = 0usize;
                for token in raw.split_whitespace() {
                    match token.split_once('=') {
                        Some((key, value)) if !key.is_empty() => {
                            out.insert(key.to_string(), value.to_string());
                        }
                        _ => {
                            position += 1;
                            out.insert(position.to_string(), token.to_string());
                        }
                    }
                }
                out
            }
        }
    }

    /// Canonical form used when hashing parameters into sub-run IDs.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        match self {
            Params::Raw(raw) => raw.trim().to_string(),
            other => serde_json::to_string(&other).unwrap_or_default(),
        }
    }
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
