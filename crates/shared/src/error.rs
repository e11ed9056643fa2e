//! Error types shared across billsync crates

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedError {
    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl SharedError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        SharedError::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}
