//! Value encoding.
//!
//! Values are serialized to bytes in a declared [`Format`]. Decoding runs
//! the raw bytes through the structural parse for the format, then through
//! an ordered chain of [`DecodeStage`]s over the intermediate
//! [`serde_json::Value`] accumulator, and finally through the typed decode.
//! Unknown format tags are rejected before anything else runs.

use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::{env, str};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::ident::Identifier;

//------------ Format --------------------------------------------------------

/// A value encoding format, identified by its string tag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Format {
    /// Structured text: JSON.
    #[default]
    Json,

    /// Compact text: TOML.
    Toml,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Toml => "toml",
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Format {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Format::Json),
            "toml" => Ok(Format::Toml),
            other => Err(CodecError::UnsupportedFormat(other.to_owned())),
        }
    }
}

//------------ DecodeStage ---------------------------------------------------

/// One step of the decode middleware chain.
///
/// Stages run strictly in registration order. Each receives the identifier
/// being decoded, the raw bytes as they arrived, and the accumulator
/// produced by the structural parse and any earlier stages.
pub trait DecodeStage: Send + Sync {
    fn apply(&self, identifier: &Identifier, raw: &[u8], acc: Value) -> Result<Value, CodecError>;
}

//------------ ValueCodec ----------------------------------------------------

/// Serializes and deserializes values of one domain type.
pub struct ValueCodec<T> {
    default_format: Format,
    stages: Vec<Box<dyn DecodeStage>>,
    marker: PhantomData<fn() -> T>,
}

impl<T> ValueCodec<T> {
    pub fn new(default_format: Format) -> Self {
        ValueCodec {
            default_format,
            stages: Vec::new(),
            marker: PhantomData,
        }
    }

    /// Appends a decode stage to the end of the chain.
    pub fn with_stage(mut self, stage: impl DecodeStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// The format used when serializing.
    pub fn default_format(&self) -> Format {
        self.default_format
    }
}

impl<T: Serialize + DeserializeOwned> ValueCodec<T> {
    /// Serializes a value in the default format.
    pub fn serialize(&self, value: &T) -> Result<Bytes, CodecError> {
        match self.default_format {
            Format::Json => serde_json::to_vec(value).map(Bytes::from).map_err(CodecError::encode),
            Format::Toml => toml::to_string(value)
                .map(|s| Bytes::from(s.into_bytes()))
                .map_err(CodecError::encode),
        }
    }

    /// Deserializes a value from raw bytes in the given format.
    ///
    /// The format tag is checked first; an unknown tag fails with
    /// [`CodecError::UnsupportedFormat`] before any stage runs.
    pub fn deserialize(&self, identifier: &Identifier, raw: &[u8], format: &str) -> Result<T, CodecError> {
        let format = Format::from_str(format)?;

        let mut acc = Self::structural(format, raw)?;
        for stage in &self.stages {
            acc = stage.apply(identifier, raw, acc)?;
        }

        serde_json::from_value(acc).map_err(CodecError::decode)
    }

    /// Parses raw bytes into the intermediate accumulator.
    fn structural(format: Format, raw: &[u8]) -> Result<Value, CodecError> {
        match format {
            Format::Json => serde_json::from_slice(raw).map_err(CodecError::decode),
            Format::Toml => {
                let text = str::from_utf8(raw).map_err(CodecError::decode)?;
                let value: toml::Value = toml::from_str(text).map_err(CodecError::decode)?;
                serde_json::to_value(value).map_err(CodecError::decode)
            }
        }
    }
}

//------------ EnvSubstitution -----------------------------------------------

/// Replaces `${NAME}` references in string leaves with the value of the
/// named environment variable. References to unset variables are left
/// untouched.
pub struct EnvSubstitution;

impl EnvSubstitution {
    fn substitute(value: &mut Value) {
        match value {
            Value::String(s) => {
                if let Some(replaced) = Self::substitute_str(s) {
                    *s = replaced;
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::substitute(item);
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    Self::substitute(item);
                }
            }
            _ => {}
        }
    }

    /// Returns the substituted string, or `None` if nothing changed.
    fn substitute_str(s: &str) -> Option<String> {
        if !s.contains("${") {
            return None;
        }

        let mut result = String::with_capacity(s.len());
        let mut rest = s;
        let mut changed = false;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match env::var(name) {
                        Ok(replacement) => {
                            result.push_str(&replacement);
                            changed = true;
                        }
                        Err(_) => {
                            result.push_str("${");
                            result.push_str(name);
                            result.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    result.push_str("${");
                    rest = after;
                }
            }
        }
        result.push_str(rest);

        changed.then_some(result)
    }
}

impl DecodeStage for EnvSubstitution {
    fn apply(&self, _identifier: &Identifier, _raw: &[u8], mut acc: Value) -> Result<Value, CodecError> {
        Self::substitute(&mut acc);
        Ok(acc)
    }
}

//------------ StoredValues --------------------------------------------------

/// Looks up the currently stored value for an identifier.
///
/// Implemented by the cache so that [`MergeWithStored`] can augment partial
/// updates with the existing value.
pub trait StoredValues: Send + Sync {
    fn stored(&self, identifier: &Identifier) -> Option<Value>;
}

//------------ MergeWithStored -----------------------------------------------

/// Merges the incoming value over the previously stored one, so partial
/// updates augment nested structure instead of replacing it.
pub struct MergeWithStored {
    lookup: Arc<dyn StoredValues>,
}

impl MergeWithStored {
    pub fn new(lookup: Arc<dyn StoredValues>) -> Self {
        MergeWithStored { lookup }
    }
}

impl DecodeStage for MergeWithStored {
    fn apply(&self, identifier: &Identifier, _raw: &[u8], acc: Value) -> Result<Value, CodecError> {
        match self.lookup.stored(identifier) {
            Some(base) => Ok(merge(base, acc)),
            None => Ok(acc),
        }
    }
}

/// Copies `base` and overrides it field by field with `overlay`.
///
/// Objects merge recursively; for any other pairing the overlay wins.
pub fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, merge(existing, value));
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

//------------ CodecError ----------------------------------------------------

/// This type defines possible errors for value encoding.
#[derive(Debug)]
pub enum CodecError {
    UnsupportedFormat(String),
    Decode(String),
    Encode(String),
}

impl CodecError {
    fn decode(e: impl Display) -> Self {
        CodecError::Decode(e.to_string())
    }

    fn encode(e: impl Display) -> Self {
        CodecError::Encode(e.to_string())
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::UnsupportedFormat(tag) => write!(f, "unsupported format: '{}'", tag),
            CodecError::Decode(e) => write!(f, "cannot decode value: {}", e),
            CodecError::Encode(e) => write!(f, "cannot encode value: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

//------------ Tests ---------------------------------------------------------
