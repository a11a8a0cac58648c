use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(RunId, "run");

/// Whether a session identifier takes part in job deduplication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// Identical content from different sessions runs separately.
    #[default]
    Session,
    /// Identical content is shared by every session.
    Content,
}

/// Idempotency key identifying one logical execution.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Content-addressed key: `<pipeline>:<sha256 of canonical request>`.
    ///
    /// Under [`KeyScope::Session`] a request without a session id gets a
    /// fresh nonce, so its execution is never shared and cannot be resumed.
    pub fn derive(pipeline: &str, input: &Value, session_id: Option<&str>, scope: KeyScope) -> Self {
        let session = match scope {
            KeyScope::Content => Value::Null,
            KeyScope::Session => match session_id {
                Some(id) => Value::String(id.trim().to_string()),
                None => Value::String(format!("nonce_{}", Uuid::now_v7())),
            },
        };

        let mut envelope = serde_json::Map::new();
        envelope.insert("input".into(), canonicalize(input));
        envelope.insert("pipeline".into(), Value::String(pipeline.to_string()));
        envelope.insert("session".into(), session);

        let digest = Sha256::digest(Value::Object(envelope).to_string().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("{pipeline}:{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pipeline prefix of a derived key.
    pub fn pipeline(&self) -> Option<&str> {
        self.0.split_once(':').map(|(p, _)| p)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Rebuild a JSON value with object keys in sorted order, so hashing does not
/// depend on the order fields arrived in.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
