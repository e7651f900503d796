//! Error types for the VirtualMachineInstance model
//!
//! Errors carry the offending value so a user can find it in their manifest.

use thiserror::Error;

/// Errors raised while interpreting a VirtualMachineInstance spec
#[derive(Debug, Error)]
pub enum Error {
    /// A resource quantity could not be parsed
    #[error("invalid quantity '{value}': {message}")]
    InvalidQuantity {
        /// The quantity string as written
        value: String,
        /// What is wrong with it
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create an invalid quantity error
    pub fn invalid_quantity(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
