use std::{fmt::Display, str::FromStr};

use indexmap::IndexMap;
use tracing::info;

use crate::{
    config::{Architecture, AttentionType, ModelConfig},
    error::{Error, Result},
    utils::dtype::ModelDType,
    vision_models::siglip::SiglipVisionConfig,
};

const GEMMA3_TOKENIZER: &str = "tokenizer/gemma3_cleaned_262144_v2.spiece.model";
const GEMMA3_VOCAB_SIZE: usize = 262_144;

/// Five local sliding-window layers followed by one global layer.
const GEMMA3_ATTN_PATTERN: [AttentionType; 6] = [
    AttentionType::LocalSliding,
    AttentionType::LocalSliding,
    AttentionType::LocalSliding,
    AttentionType::LocalSliding,
    AttentionType::LocalSliding,
    AttentionType::Global,
];

const GEMMA2_ATTN_PATTERN: [AttentionType; 2] =
    [AttentionType::LocalSliding, AttentionType::Global];

/// The registered Gemma variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmaVariant {
    Gemma1_2b,
    Gemma1_7b,
    Gemma2_2b,
    Gemma2_9b,
    Gemma2_27b,
    Gemma3_1b,
    Gemma3_4b,
    Gemma3_12b,
    Gemma3_27b,
}

impl GemmaVariant {
    pub const ALL: [GemmaVariant; 9] = [
        Self::Gemma3_1b,
        Self::Gemma1_2b,
        Self::Gemma2_2b,
        Self::Gemma3_4b,
        Self::Gemma1_7b,
        Self::Gemma2_9b,
        Self::Gemma3_12b,
        Self::Gemma2_27b,
        Self::Gemma3_27b,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gemma1_2b => "2b",
            Self::Gemma1_7b => "7b",
            Self::Gemma2_2b => "2b-v2",
            Self::Gemma2_9b => "9b",
            Self::Gemma2_27b => "27b",
            Self::Gemma3_1b => "1b",
            Self::Gemma3_4b => "4b",
            Self::Gemma3_12b => "12b",
            Self::Gemma3_27b => "27b_v3",
        }
    }

    /// Comma separated, quoted list of every registered name.
    pub fn supported_names() -> String {
        Self::ALL
            .iter()
            .map(|v| format!("`{}`", v.name()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn config(&self, dtype: ModelDType) -> ModelConfig {
        match self {
            Self::Gemma1_2b => config_for_2b(dtype),
            Self::Gemma1_7b => config_for_7b(dtype),
            Self::Gemma2_2b => config_for_2b_v2(dtype),
            Self::Gemma2_9b => config_for_9b(dtype),
            Self::Gemma2_27b => config_for_27b(dtype),
            Self::Gemma3_1b => config_for_1b(dtype),
            Self::Gemma3_4b => config_for_4b(dtype),
            Self::Gemma3_12b => config_for_12b(dtype),
            Self::Gemma3_27b => config_for_27b_v3(dtype),
        }
    }
}

impl Display for GemmaVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for GemmaVariant {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| Error::InvalidVariant {
                variant: s.to_string(),
            })
    }
}

/// Resolve the canonical configuration of `variant` with weights stored as `dtype`.
pub fn get_model_config(variant: &str, dtype: &str) -> Result<ModelConfig> {
    let variant: GemmaVariant = variant.parse()?;
    let dtype: ModelDType = dtype.parse()?;
    let config = variant.config(dtype);
    config.validate()?;
    info!(
        "Using {:?} config for variant `{variant}` with dtype {dtype}.",
        config.architecture
    );
    Ok(config)
}

/// Repeat `pattern` until it covers `num_layers` layers.
fn layer_schedule(pattern: &[AttentionType], num_layers: usize) -> Vec<AttentionType> {
    pattern.iter().copied().cycle().take(num_layers).collect()
}

fn gemma3_rope_wave_length() -> IndexMap<AttentionType, usize> {
    IndexMap::from([
        (AttentionType::LocalSliding, 10_000),
        (AttentionType::Global, 1_000_000),
    ])
}

fn config_for_7b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        dtype,
        ..Default::default()
    }
}

fn config_for_2b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        dtype,
        num_hidden_layers: 18,
        num_attention_heads: 8,
        num_key_value_heads: 1,
        hidden_size: 2_048,
        intermediate_size: 16_384,
        ..Default::default()
    }
}

/// Shared shape of the Gemma 2 family: logit softcapping, pre/post FFW norms and
/// alternating local/global attention.
fn gemma2_config(dtype: ModelDType, num_hidden_layers: usize) -> ModelConfig {
    ModelConfig {
        dtype,
        architecture: Architecture::Gemma2,
        num_hidden_layers,
        use_pre_ffw_norm: true,
        use_post_ffw_norm: true,
        final_logit_softcapping: Some(30.0),
        attn_logit_softcapping: Some(50.0),
        head_dim: 256,
        attn_types: Some(layer_schedule(&GEMMA2_ATTN_PATTERN, num_hidden_layers)),
        sliding_window_size: Some(4_096),
        ..Default::default()
    }
}

fn config_for_2b_v2(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 8,
        num_key_value_heads: 4,
        hidden_size: 2_304,
        intermediate_size: 9_216,
        ..gemma2_config(dtype, 26)
    }
}

fn config_for_9b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 16,
        num_key_value_heads: 8,
        hidden_size: 3_584,
        intermediate_size: 14_336,
        ..gemma2_config(dtype, 42)
    }
}

fn config_for_27b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 32,
        num_key_value_heads: 16,
        hidden_size: 4_608,
        intermediate_size: 36_864,
        head_dim: 128,
        // hidden_size / num_attention_heads
        query_pre_attn_scalar: Some(144),
        ..gemma2_config(dtype, 46)
    }
}

/// Shared shape of the Gemma 3 family: QK norm, the 5:1 local/global schedule, dual RoPE
/// wavelengths and the larger vocabulary.
fn gemma3_config(dtype: ModelDType, num_hidden_layers: usize) -> ModelConfig {
    ModelConfig {
        dtype,
        architecture: Architecture::Gemma3,
        num_hidden_layers,
        use_pre_ffw_norm: true,
        use_post_ffw_norm: true,
        head_dim: 256,
        attn_types: Some(layer_schedule(&GEMMA3_ATTN_PATTERN, num_hidden_layers)),
        sliding_window_size: Some(1_024),
        rope_wave_length: Some(gemma3_rope_wave_length()),
        vocab_size: GEMMA3_VOCAB_SIZE,
        tokenizer: Some(GEMMA3_TOKENIZER.to_string()),
        use_qk_norm: true,
        ..Default::default()
    }
}

fn config_for_1b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 4,
        num_key_value_heads: 1,
        hidden_size: 1_152,
        intermediate_size: 6_912,
        sliding_window_size: Some(512),
        max_position_embeddings: 32_768,
        vision_config: None,
        ..gemma3_config(dtype, 26)
    }
}

fn config_for_4b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 8,
        num_key_value_heads: 4,
        hidden_size: 2_560,
        intermediate_size: 10_240,
        vision_config: Some(SiglipVisionConfig::default()),
        rope_scaling_factor: Some(8),
        ..gemma3_config(dtype, 34)
    }
}

fn config_for_12b(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 16,
        num_key_value_heads: 8,
        hidden_size: 3_840,
        intermediate_size: 3_840 * 8 / 2,
        max_position_embeddings: 131_072,
        vision_config: Some(SiglipVisionConfig::default()),
        rope_scaling_factor: Some(8),
        ..gemma3_config(dtype, 48)
    }
}

fn config_for_27b_v3(dtype: ModelDType) -> ModelConfig {
    ModelConfig {
        num_attention_heads: 32,
        num_key_value_heads: 16,
        hidden_size: 5_376,
        intermediate_size: 5_376 * 8 / 2,
        head_dim: 128,
        query_pre_attn_scalar: Some(5_376 / 32),
        max_position_embeddings: 131_072,
        vision_config: Some(SiglipVisionConfig::default()),
        rope_scaling_factor: Some(8),
        ..gemma3_config(dtype, 62)
    }
}
