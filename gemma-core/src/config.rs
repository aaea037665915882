use candle_core::DType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    serde_default_fn,
    utils::dtype::ModelDType,
    vision_models::siglip::SiglipVisionConfig,
};

/// Generation of the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Architecture {
    #[default]
    Gemma1,
    Gemma2,
    Gemma3,
}

/// Attention pattern used by one decoder layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttentionType {
    Global,
    LocalSliding,
}

serde_default_fn!(usize, vocab_size, 256_000);
serde_default_fn!(usize, max_position_embeddings, 8_192);
serde_default_fn!(usize, num_hidden_layers, 28);
serde_default_fn!(usize, num_attention_heads, 16);
serde_default_fn!(usize, num_key_value_heads, 16);
serde_default_fn!(usize, hidden_size, 3_072);
serde_default_fn!(usize, intermediate_size, 24_576);
serde_default_fn!(usize, head_dim, 256);
serde_default_fn!(f64, rms_norm_eps, 1e-6);
serde_default_fn!(
    Option<String>,
    tokenizer,
    Some("tokenizer/tokenizer.model".to_string())
);

/// Decoder configuration for one Gemma variant.
///
/// Built once (see [`crate::get_model_config`]) and read-only afterwards. Optional fields act
/// as feature switches: a mechanism is active exactly when its field is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default = "vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "num_key_value_heads")]
    pub num_key_value_heads: usize,
    #[serde(default = "hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "head_dim")]
    pub head_dim: usize,
    #[serde(default = "rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default)]
    pub dtype: ModelDType,
    #[serde(default)]
    pub quant: bool,
    #[serde(default = "tokenizer")]
    pub tokenizer: Option<String>,
    /// One entry per decoder layer.
    #[serde(default)]
    pub attn_types: Option<Vec<AttentionType>>,
    #[serde(default)]
    pub sliding_window_size: Option<usize>,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    /// Queries are scaled by `query_pre_attn_scalar^-0.5` instead of `head_dim^-0.5`.
    #[serde(default)]
    pub query_pre_attn_scalar: Option<usize>,
    #[serde(default)]
    pub use_pre_ffw_norm: bool,
    #[serde(default)]
    pub use_post_ffw_norm: bool,
    #[serde(default)]
    pub rope_wave_length: Option<IndexMap<AttentionType, usize>>,
    #[serde(default)]
    pub use_qk_norm: bool,
    #[serde(default)]
    pub vision_config: Option<SiglipVisionConfig>,
    /// Divisor applied to the global RoPE wavelength.
    #[serde(default)]
    pub rope_scaling_factor: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Gemma1,
            vocab_size: vocab_size(),
            max_position_embeddings: max_position_embeddings(),
            num_hidden_layers: num_hidden_layers(),
            num_attention_heads: num_attention_heads(),
            num_key_value_heads: num_key_value_heads(),
            hidden_size: hidden_size(),
            intermediate_size: intermediate_size(),
            head_dim: head_dim(),
            rms_norm_eps: rms_norm_eps(),
            dtype: ModelDType::default(),
            quant: false,
            tokenizer: tokenizer(),
            attn_types: None,
            sliding_window_size: None,
            final_logit_softcapping: None,
            attn_logit_softcapping: None,
            query_pre_attn_scalar: None,
            use_pre_ffw_norm: false,
            use_post_ffw_norm: false,
            rope_wave_length: None,
            use_qk_norm: false,
            vision_config: None,
            rope_scaling_factor: None,
        }
    }
}

impl ModelConfig {
    pub fn get_dtype(&self) -> DType {
        self.dtype.into()
    }

    /// Attention type of decoder layer `layer_idx`. Layers without a schedule attend globally.
    pub fn attn_type(&self, layer_idx: usize) -> AttentionType {
        self.attn_types
            .as_ref()
            .and_then(|types| types.get(layer_idx).copied())
            .unwrap_or(AttentionType::Global)
    }

    pub fn rope_wave_length_for(&self, attn_type: AttentionType) -> Option<usize> {
        self.rope_wave_length
            .as_ref()
            .and_then(|map| map.get(&attn_type).copied())
    }

    /// RoPE wavelength after applying `rope_scaling_factor`, which only affects global layers.
    pub fn scaled_rope_wave_length(&self, attn_type: AttentionType) -> Option<f64> {
        let wave_length = self.rope_wave_length_for(attn_type)? as f64;
        match (attn_type, self.rope_scaling_factor) {
            (AttentionType::Global, Some(factor)) => Some(wave_length / factor as f64),
            _ => Some(wave_length),
        }
    }

    pub fn query_scale(&self) -> f64 {
        let scalar = self.query_pre_attn_scalar.unwrap_or(self.head_dim);
        (scalar as f64).powf(-0.5)
    }

    pub fn num_queries_per_kv(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    pub fn has_vision(&self) -> bool {
        self.vision_config.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_key_value_heads == 0
            || self.num_attention_heads % self.num_key_value_heads != 0
        {
            return Err(Error::InvalidConfig(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if let Some(attn_types) = &self.attn_types {
            if attn_types.len() != self.num_hidden_layers {
                return Err(Error::InvalidConfig(format!(
                    "attention schedule has {} entries but the model has {} layers",
                    attn_types.len(),
                    self.num_hidden_layers
                )));
            }
            if attn_types.contains(&AttentionType::LocalSliding)
                && self.sliding_window_size.is_none()
            {
                return Err(Error::InvalidConfig(
                    "LOCAL_SLIDING layers require `sliding_window_size`".to_string(),
                ));
            }
        }
        if let Some(vision_config) = &self.vision_config {
            vision_config.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_schedule(attn_types: Vec<AttentionType>) -> ModelConfig {
        ModelConfig {
            num_hidden_layers: attn_types.len(),
            attn_types: Some(attn_types),
            ..Default::default()
        }
    }

    #[test]
    fn default_is_gemma1_7b_shape() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.architecture, Architecture::Gemma1);
        assert_eq!(cfg.num_hidden_layers, 28);
        assert_eq!(cfg.hidden_size, 3_072);
        assert_eq!(cfg.get_dtype(), DType::BF16);
        assert_eq!(cfg.tokenizer.as_deref(), Some("tokenizer/tokenizer.model"));
        cfg.validate().unwrap();
    }

    #[test]
    fn local_sliding_without_window_is_rejected() {
        let cfg = config_with_schedule(vec![AttentionType::LocalSliding, AttentionType::Global]);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let cfg = ModelConfig {
            sliding_window_size: Some(16),
            ..cfg
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn schedule_length_must_match_layers() {
        let cfg = ModelConfig {
            num_hidden_layers: 3,
            ..config_with_schedule(vec![AttentionType::Global; 2])
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("2 entries"));
    }

    #[test]
    fn attn_type_falls_back_to_global() {
        let cfg = ModelConfig {
            sliding_window_size: Some(8),
            ..config_with_schedule(vec![AttentionType::LocalSliding, AttentionType::Global])
        };
        assert_eq!(cfg.attn_type(0), AttentionType::LocalSliding);
        assert_eq!(cfg.attn_type(1), AttentionType::Global);
        assert_eq!(ModelConfig::default().attn_type(5), AttentionType::Global);
    }

    #[test]
    fn query_scale_prefers_pre_attn_scalar() {
        let cfg = ModelConfig {
            head_dim: 128,
            query_pre_attn_scalar: Some(144),
            ..Default::default()
        };
        assert!((cfg.query_scale() - 1.0 / 12.0).abs() < 1e-12);

        let cfg = ModelConfig {
            head_dim: 256,
            ..Default::default()
        };
        assert!((cfg.query_scale() - 1.0 / 16.0).abs() < 1e-12);
    }

    #[test]
    fn rope_scaling_only_touches_global_layers() {
        let cfg = ModelConfig {
            rope_wave_length: Some(IndexMap::from([
                (AttentionType::LocalSliding, 10_000),
                (AttentionType::Global, 1_000_000),
            ])),
            rope_scaling_factor: Some(8),
            ..Default::default()
        };
        assert_eq!(
            cfg.scaled_rope_wave_length(AttentionType::Global),
            Some(125_000.0)
        );
        assert_eq!(
            cfg.scaled_rope_wave_length(AttentionType::LocalSliding),
            Some(10_000.0)
        );
        assert_eq!(ModelConfig::default().rope_wave_length_for(AttentionType::Global), None);
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{
                "architecture": "GEMMA2",
                "num_hidden_layers": 2,
                "dtype": "float",
                "attn_types": ["LOCAL_SLIDING", "GLOBAL"],
                "sliding_window_size": 4096,
                "rope_wave_length": {"GLOBAL": 1000000}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.architecture, Architecture::Gemma2);
        assert_eq!(cfg.get_dtype(), DType::F32);
        assert_eq!(cfg.vocab_size, 256_000);
        assert_eq!(cfg.attn_type(0), AttentionType::LocalSliding);
        assert_eq!(
            cfg.rope_wave_length_for(AttentionType::Global),
            Some(1_000_000)
        );
        assert!(!cfg.has_vision());
        cfg.validate().unwrap();
    }
}
