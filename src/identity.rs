use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BatchError;

const FINGERPRINT_LEN: usize = 8;

/// Short hash of a parameter set. Eight hex characters of MD5: collisions
/// between different parameter sets of one run are possible but unlikely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamsFingerprint(String);

impl ParamsFingerprint {
    pub fn of_text(text: &str) -> Self {
        let digest = Md5::digest(text.as_bytes());
        let hex = format!("{digest:x}");
        Self(hex[..FINGERPRINT_LEN].to_string())
    }

    /// Fingerprint of a JSON parameter object. Keys are serialized in sorted
    /// order, so insertion order does not affect the result.
    pub fn of_payload(params: &Map<String, Value>) -> Self {
        let canonical = canonical_json(&Value::Object(params.clone()));
        Self::of_text(&canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParamsFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = BatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(BatchError::InvalidConfig(format!(
                "invalid batch identifier: {value:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// `<key>:<fingerprint>`. The identifier is embedded in job descriptions
/// and read back up to the next whitespace, so whitespace in the key is
/// percent-encoded, and so is `%` to keep the encoding injective. Keys
/// without either character are used verbatim.
pub fn derive(work_unit_key: &str, fingerprint: &ParamsFingerprint) -> Identifier {
    Identifier(format!("{}:{fingerprint}", encode_key(work_unit_key)))
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for ch in key.chars() {
        if ch == '%' || ch.is_whitespace() {
            encoded.push_str(&urlencoding::encode(ch.encode_utf8(&mut [0; 4])));
        } else {
            encoded.push(ch);
        }
    }
    encoded
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let fields = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect::<Vec<_>>();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items = items.iter().map(canonical_json).collect::<Vec<_>>();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
