//! Error types for modalgen
//!
//! Every failure in this crate is local and synchronous. None of them are
//! transient: they report a configuration or data defect (bad dimensions,
//! malformed packed weights, invalid sampling parameters) or a resource limit
//! that retrying cannot fix.

use thiserror::Error;

/// Result type alias for modalgen operations
pub type Result<T> = std::result::Result<T, ModalgenError>;

/// Error type for all modalgen operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModalgenError {
    /// A dimension is zero, negative-equivalent, or otherwise unusable
    #[error("Invalid dimension: {reason}")]
    InvalidDimension {
        /// Description of the offending dimension
        reason: String,
    },

    /// Packed quantized data is malformed or uses an unsupported bit width
    #[error("Invalid quantization: {reason}")]
    InvalidQuantization {
        /// Description of the quantization problem
        reason: String,
    },

    /// Two operands disagree on a shared dimension
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Operation in which the mismatch was detected
        context: String,
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Attention was asked to attend over zero key positions
    #[error("Empty attention context: key/value sequence has length 0")]
    EmptyAttentionContext,

    /// Sampling parameters are out of range
    #[error("Sampling configuration error: {reason}")]
    SamplingConfiguration {
        /// Description of the invalid parameter
        reason: String,
    },

    /// A bounded resource (sequence length, scratch capacity) was exceeded
    #[error("Resource exhausted: {resource} needs {requested}, limit is {limit}")]
    ResourceExhausted {
        /// Name of the exhausted resource
        resource: String,
        /// Requested amount
        requested: usize,
        /// Configured limit
        limit: usize,
    },

    /// Tensor shape is invalid
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape problem
        reason: String,
    },

    /// Tensor data does not fill its declared shape
    #[error("Data size {data_size} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual data length
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Expected data length
        expected: usize,
    },

    /// Generic inference failure
    #[error("Inference error: {0}")]
    Inference(String),
}

impl ModalgenError {
    /// Short hint a front-end can show next to the error message
    #[must_use]
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            Self::InvalidQuantization { .. } => {
                Some("re-export the model weights; packed data does not match its header")
            },
            Self::DimensionMismatch { .. } | Self::InvalidDimension { .. } => {
                Some("check that num_heads * head_dim equals the model hidden dimension")
            },
            Self::EmptyAttentionContext => Some("provide at least one key/value position"),
            Self::SamplingConfiguration { .. } => Some(
                "use temperature > 0, top_k >= 1, and top_p in (0, 1]",
            ),
            Self::ResourceExhausted { .. } => {
                Some("shorten the input or raise max_sequence_length")
            },
            Self::InvalidShape { .. } | Self::DataShapeMismatch { .. } | Self::Inference(_) => {
                None
            },
        }
    }

    /// Convenience constructor for [`ModalgenError::DimensionMismatch`]
    pub(crate) fn mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}
