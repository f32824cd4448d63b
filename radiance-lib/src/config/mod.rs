//! Server-delivered configuration: model, merge semantics, persistence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::{fmt, fs};

use crate::dirs;

pub mod handler;

pub use handler::{ConfigUpdated, Handler};

pub const FILE_NAME: &str = "proxy.conf";
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Deserialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("outbound or endpoint without a tag")]
    MissingTag,
    #[error("duplicate outbound tag: {0}")]
    DuplicateTag(String),
}

/// A `{country, city}` pair the backend offers proxies in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLocation {
    pub country: String,
    pub city: String,
}

/// Outbounds, rules and rule-sets delivered for an optional routing policy
/// (smart routing, ad blocking). Opaque to the core beyond their tags.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleBlock {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_sets: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerLocation>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub features: HashMap<String, bool>,
    /// Outbound option blocks, opaque tagged records `{type, tag, …}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_routing: Option<RuleBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_block: Option<RuleBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded: Option<Value>,
}

impl Config {
    pub fn parse(bytes: &[u8]) -> Result<Config, Error> {
        let config: Config = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Every outbound and endpoint must carry a non-empty tag, unique across
    /// the union of both lists.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for block in self.outbounds.iter().chain(self.endpoints.iter()) {
            let tag = block
                .get("tag")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or(Error::MissingTag)?;
            if !seen.insert(tag.to_string()) {
                return Err(Error::DuplicateTag(tag.to_string()));
            }
        }
        Ok(())
    }

    /// Deep right-biased merge: fields of `new` win unless they are zero
    /// (null, false, 0, empty string/array/object). Merging a config into
    /// itself is a no-op.
    pub fn merge(&self, new: &Config) -> Result<Config, Error> {
        let mut base = serde_json::to_value(self)?;
        let overlay = serde_json::to_value(new)?;
        merge_values(&mut base, &overlay);
        Ok(serde_json::from_value(base)?)
    }
}

pub fn merge_values(base: &mut Value, new: &Value) {
    match (base, new) {
        (Value::Object(base_map), Value::Object(new_map)) => {
            for (key, new_value) in new_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, new_value),
                    None => {
                        if !is_zero(new_value) {
                            base_map.insert(key.clone(), new_value.clone());
                        }
                    }
                }
            }
        }
        (base, new) => {
            if !is_zero(new) {
                *base = new.clone();
            }
        }
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Reads the persisted config. Missing file is `None`; a parse failure is an
/// error the caller logs and survives.
pub fn load(dir: &Path) -> Result<Option<Config>, Error> {
    let path = dir.join(FILE_NAME);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::IO(e)),
    };
    Ok(Some(Config::parse(&bytes)?))
}

pub fn persist(dir: &Path, config: &Config) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(config)?;
    dirs::write_atomic(&dir.join(FILE_NAME), &bytes, FILE_MODE)?;
    Ok(())
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.country)
    }
}
