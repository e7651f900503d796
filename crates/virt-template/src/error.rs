//! Launch manifest compilation errors
//!
//! Every variant is fatal to the current render call; nothing is retried
//! here. The calling controller decides whether to requeue.

use thiserror::Error;

/// Errors that can occur while rendering a launch manifest
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The claim store failed to answer
    #[error("failed to look up claim {namespace}/{claim}: {message}")]
    ClaimLookup {
        /// Namespace of the claim
        namespace: String,
        /// Claim name
        claim: String,
        /// Underlying store error
        message: String,
    },

    /// A volume references a claim that doesn't exist
    #[error("didn't find PVC {namespace}/{claim}")]
    ClaimNotFound {
        /// Namespace of the claim
        namespace: String,
        /// Claim name
        claim: String,
    },

    /// The cluster configuration store failed to answer
    #[error("failed to read cluster config key '{key}': {message}")]
    ConfigLookup {
        /// Config key being read
        key: String,
        /// Underlying store error
        message: String,
    },

    /// A configuration value is malformed
    #[error("invalid configuration '{key}' = '{value}': {message}")]
    InvalidConfiguration {
        /// Config key or setting name
        key: String,
        /// Offending value
        value: String,
        /// What is wrong with it
        message: String,
    },

    /// Hook sidecar declarations could not be parsed
    #[error("failed to parse hook sidecars: {message}")]
    SidecarParse {
        /// Parser error
        message: String,
    },

    /// A declared resource quantity is unusable
    #[error("invalid resource '{resource}': {message}")]
    InvalidResource {
        /// Resource name (e.g. `memory`)
        resource: String,
        /// What is wrong with it
        message: String,
    },

    /// The VM lacks required metadata
    #[error("VirtualMachineInstance is missing {field}")]
    MissingMetadata {
        /// Missing field (e.g. `metadata.name`)
        field: String,
    },
}

impl TemplateError {
    /// Create a claim lookup error
    pub fn claim_lookup(namespace: &str, claim: &str, message: impl Into<String>) -> Self {
        Self::ClaimLookup {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            message: message.into(),
        }
    }

    /// Create a claim not found error
    pub fn claim_not_found(namespace: &str, claim: &str) -> Self {
        Self::ClaimNotFound {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
        }
    }

    /// Create a config lookup error
    pub fn config_lookup(key: &str, message: impl Into<String>) -> Self {
        Self::ConfigLookup {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(key: &str, value: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            key: key.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    /// Create a sidecar parse error
    pub fn sidecar_parse(message: impl Into<String>) -> Self {
        Self::SidecarParse {
            message: message.into(),
        }
    }

    /// Create an invalid resource error
    pub fn invalid_resource(resource: &str, message: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    /// Create a missing metadata error
    pub fn missing_metadata(field: &str) -> Self {
        Self::MissingMetadata {
            field: field.to_string(),
        }
    }

    /// True when the user can fix this by changing their VM or its references
    ///
    /// Callers surface these on the VM status instead of retrying.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::ClaimNotFound { .. }
                | Self::SidecarParse { .. }
                | Self::InvalidResource { .. }
                | Self::MissingMetadata { .. }
        )
    }
}

impl From<virt_common::Error> for TemplateError {
    fn from(e: virt_common::Error) -> Self {
        match e {
            virt_common::Error::InvalidQuantity { value, message } => Self::InvalidResource {
                resource: value,
                message,
            },
            virt_common::Error::Serialization { message } => Self::SidecarParse { message },
        }
    }
}
