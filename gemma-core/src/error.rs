//! Error types for configuration resolution and the vision tower.

use thiserror::Error;

use crate::variants::GemmaVariant;

/// Error type for `gemma-core`.
///
/// Configuration functions return [`Result<T>`](type@Result). Tensor code keeps candle's
/// result type; these errors are wrapped into [`candle_core::Error`] with their message
/// preserved when they are raised inside a forward pass.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The variant selector is not one of the registered names.
    #[error("Invalid variant `{variant}`. Supported variants are {}.", GemmaVariant::supported_names())]
    InvalidVariant { variant: String },

    /// The dtype string is not in the fixed dtype table.
    #[error(
        "Model DType `{0}` is not supported. Supported dtypes are `float16`, `float`, `float32` and `bfloat16`."
    )]
    UnsupportedDType(String),

    /// A configuration violates one of its structural invariants.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A patch sequence cannot be laid out on a square grid.
    #[error("Sequence length {seq_len} is not a perfect square. Cannot reshape to a square image.")]
    InvalidShape { seq_len: usize },
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for candle_core::Error {
    fn from(err: Error) -> Self {
        candle_core::Error::wrap(err)
    }
}
