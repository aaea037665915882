//! Gemma decoder configurations and the SigLIP vision tower that turns pixels into
//! embeddings the decoder can consume.

mod config;
mod error;
pub mod layers;
mod utils;
mod variants;
pub mod vision_models;

pub use config::{Architecture, AttentionType, ModelConfig};
pub use error::{Error, Result};
pub use utils::{dtype::ModelDType, log::initialize_logging};
pub use variants::{get_model_config, GemmaVariant};
pub use vision_models::siglip::{SiglipVisionConfig, SiglipVisionModel};
