use std::fmt::Display;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Implemented by every payload that may travel inside an [`AnyMessage`].
pub trait TypeTagged {
    const TYPE_URL: &'static str;
}

/// Type-tagged opaque payload, the equivalent of a protobuf `Any`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnyMessage {
    pub type_url: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug)]
pub enum UnpackError {
    TypeMismatch { expected: String, found: String },
    Decode(serde_json::Error),
}

impl Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnpackError::TypeMismatch { expected, found } => {
                write!(f, "expected payload of type {expected}, found {found}")
            }
            UnpackError::Decode(e) => write!(f, "failed to decode payload: {e}"),
        }
    }
}

impl std::error::Error for UnpackError {}

impl AnyMessage {
    pub fn pack<T: TypeTagged + Serialize>(msg: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_url: T::TYPE_URL.to_string(),
            value: serde_json::to_value(msg)?,
        })
    }

    pub fn is<T: TypeTagged>(&self) -> bool {
        self.type_url == T::TYPE_URL
    }

    pub fn unpack<T: TypeTagged + DeserializeOwned>(&self) -> Result<T, UnpackError> {
        if !self.is::<T>() {
            return Err(UnpackError::TypeMismatch {
                expected: T::TYPE_URL.to_string(),
                found: self.type_url.clone(),
            });
        }
        serde_json::from_value(self.value.clone()).map_err(UnpackError::Decode)
    }
}
