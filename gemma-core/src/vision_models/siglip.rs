#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::{
    conv2d, conv2d_no_bias, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding,
    LayerNorm, Linear, Module, VarBuilder,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::Error,
    layers::{AvgPool2d, GeluPytorchTanh},
    serde_default_fn,
};

/// Side of the square window used to pool patch embeddings before they reach the decoder.
pub const POOL_KERNEL_SIZE: usize = 4;

serde_default_fn!(usize, input_channels, 3);
serde_default_fn!(usize, embedding_dim, 1152);
serde_default_fn!(usize, num_hidden_layers, 27);
serde_default_fn!(usize, num_attention_heads, 16);
serde_default_fn!(usize, head_dim, 72);
serde_default_fn!(usize, intermediate_size, 4304);
serde_default_fn!(f64, layer_norm_eps, 1e-6);
serde_default_fn!(usize, conv2d_patch_size, 14);
serde_default_fn!(usize, image_size, 896);
serde_default_fn!(usize, encoding_sequence_length, 256);
serde_default_fn!(bool, embedding_use_bias, true);

/// Geometry of the SigLIP vision tower. The default is the tower used by Gemma 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiglipVisionConfig {
    #[serde(default = "input_channels")]
    pub input_channels: usize,
    #[serde(default = "embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "head_dim")]
    pub head_dim: usize,
    #[serde(default = "intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "conv2d_patch_size")]
    pub conv2d_patch_size: usize,
    #[serde(default = "image_size")]
    pub image_size: usize,
    /// Number of embeddings handed to the decoder per image, after pooling.
    #[serde(default = "encoding_sequence_length")]
    pub encoding_sequence_length: usize,
    #[serde(default = "embedding_use_bias")]
    pub embedding_use_bias: bool,
}

impl Default for SiglipVisionConfig {
    fn default() -> Self {
        Self {
            input_channels: input_channels(),
            embedding_dim: embedding_dim(),
            num_hidden_layers: num_hidden_layers(),
            num_attention_heads: num_attention_heads(),
            head_dim: head_dim(),
            intermediate_size: intermediate_size(),
            layer_norm_eps: layer_norm_eps(),
            conv2d_patch_size: conv2d_patch_size(),
            image_size: image_size(),
            encoding_sequence_length: encoding_sequence_length(),
            embedding_use_bias: embedding_use_bias(),
        }
    }
}

impl SiglipVisionConfig {
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.conv2d_patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches_per_side().pow(2)
    }

    pub fn pooled_sequence_length(&self) -> usize {
        (self.num_patches_per_side() / POOL_KERNEL_SIZE).pow(2)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.conv2d_patch_size == 0 || self.image_size % self.conv2d_patch_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "image_size ({}) must be divisible by conv2d_patch_size ({})",
                self.image_size, self.conv2d_patch_size
            )));
        }
        if self.num_patches_per_side() < POOL_KERNEL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "patch grid side ({}) is smaller than the {POOL_KERNEL_SIZE}x{POOL_KERNEL_SIZE} \
                 pooling window",
                self.num_patches_per_side()
            )));
        }
        if self.embedding_dim != self.num_attention_heads * self.head_dim {
            return Err(Error::InvalidConfig(format!(
                "embedding_dim ({}) must equal num_attention_heads ({}) * head_dim ({})",
                self.embedding_dim, self.num_attention_heads, self.head_dim
            )));
        }
        if self.encoding_sequence_length != self.pooled_sequence_length() {
            return Err(Error::InvalidConfig(format!(
                "encoding_sequence_length ({}) does not match the pooled patch count ({})",
                self.encoding_sequence_length,
                self.pooled_sequence_length()
            )));
        }
        Ok(())
    }
}

/// Non-overlapping strided convolution: one embedding per `patch x patch` tile.
struct PatchEmbedding {
    proj: Conv2d,
}

impl PatchEmbedding {
    fn new(cfg: &SiglipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: cfg.conv2d_patch_size,
            padding: 0,
            ..Default::default()
        };
        let proj = if cfg.embedding_use_bias {
            conv2d(
                cfg.input_channels,
                cfg.embedding_dim,
                cfg.conv2d_patch_size,
                conv_config,
                vb,
            )?
        } else {
            conv2d_no_bias(
                cfg.input_channels,
                cfg.embedding_dim,
                cfg.conv2d_patch_size,
                conv_config,
                vb,
            )?
        };
        Ok(Self { proj })
    }
}

impl Module for PatchEmbedding {
    /// (b, c, h, w) -> (b, num_patches, embedding_dim)
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.proj
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)
    }
}

/// Learned table added to the patch sequence. Positions are always `0..num_positions`.
struct PositionEmbedding {
    table: Embedding,
    num_positions: usize,
}

impl PositionEmbedding {
    fn new(cfg: &SiglipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let num_positions = cfg.num_patches();
        Ok(Self {
            table: embedding(num_positions, cfg.embedding_dim, vb)?,
            num_positions,
        })
    }
}

impl Module for PositionEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let position_ids = Tensor::arange(
            0u32,
            self.num_positions as u32,
            self.table.embeddings().device(),
        )?;
        let positions = self.table.forward(&position_ids)?;
        xs.broadcast_add(&positions.to_device(xs.device())?)
    }
}

/// Bidirectional multi-head self-attention with biased projections.
struct SelfAttention {
    cfg: Arc<SiglipVisionConfig>,
    scale: f64,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
}

impl SelfAttention {
    fn new(cfg: &Arc<SiglipVisionConfig>, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embedding_dim;
        let inner_dim = cfg.num_attention_heads * cfg.head_dim;
        Ok(Self {
            cfg: cfg.clone(),
            scale: 1.0 / (cfg.head_dim as f64).sqrt(),
            q_proj: linear(dim, inner_dim, vb.pp("q_proj"))?,
            k_proj: linear(dim, inner_dim, vb.pp("k_proj"))?,
            v_proj: linear(dim, inner_dim, vb.pp("v_proj"))?,
            o_proj: linear(inner_dim, dim, vb.pp("o_proj"))?,
        })
    }

    /// (b, seq, dim) -> (b, heads, seq, head_dim)
    fn project_heads(&self, proj: &Linear, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        proj.forward(xs)?
            .reshape((b_sz, seq_len, self.cfg.num_attention_heads, self.cfg.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Softmax over keys of the scaled scores; each row sums to one.
    fn attention_weights(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        candle_nn::ops::softmax_last_dim(&scores)
    }
}

impl Module for SelfAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;

        let q = self.project_heads(&self.q_proj, xs)?;
        let k = self.project_heads(&self.k_proj, xs)?;
        let v = self.project_heads(&self.v_proj, xs)?;

        let attn_weights = self.attention_weights(&q, &k)?;
        attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((
                b_sz,
                seq_len,
                self.cfg.num_attention_heads * self.cfg.head_dim,
            ))?
            .apply(&self.o_proj)
    }
}

struct VisionMLP {
    fc1: Linear,
    act: GeluPytorchTanh,
    fc2: Linear,
}

impl VisionMLP {
    fn new(cfg: &SiglipVisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.embedding_dim, cfg.intermediate_size, vb.pp("fc1"))?,
            act: GeluPytorchTanh,
            fc2: linear(cfg.intermediate_size, cfg.embedding_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for VisionMLP {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.apply(&self.act)?.apply(&self.fc2)
    }
}

/// Pre-norm transformer block. The residual bypasses the normalization.
struct EncoderBlock {
    layer_norm1: LayerNorm,
    self_attn: SelfAttention,
    layer_norm2: LayerNorm,
    mlp: VisionMLP,
}

impl EncoderBlock {
    fn new(cfg: &Arc<SiglipVisionConfig>, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(cfg.embedding_dim, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: SelfAttention::new(cfg, vb.pp("self_attn"))?,
            layer_norm2: layer_norm(cfg.embedding_dim, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
            mlp: VisionMLP::new(cfg, vb.pp("mlp"))?,
        })
    }
}

impl Module for EncoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let hidden_states = xs.apply(&self.layer_norm1)?.apply(&self.self_attn)?;
        let hidden_states = (hidden_states + residual)?;

        let residual = &hidden_states;
        let mlp_out = hidden_states.apply(&self.layer_norm2)?.apply(&self.mlp)?;
        mlp_out + residual
    }
}

struct EncoderStack {
    blocks: Vec<EncoderBlock>,
}

impl EncoderStack {
    fn new(cfg: &Arc<SiglipVisionConfig>, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..cfg.num_hidden_layers)
            .map(|i| EncoderBlock::new(cfg, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }
}

impl Module for EncoderStack {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut hidden_states = xs.clone();
        for block in &self.blocks {
            hidden_states = block.forward(&hidden_states)?;
        }
        Ok(hidden_states)
    }
}

/// Lays a square patch sequence back out as a grid and average-pools it with a fixed
/// `4 x 4` window: (b, s^2, c) -> (b, (s/4)^2, c).
pub struct AveragePool2d {
    pool: AvgPool2d,
}

impl AveragePool2d {
    pub fn new() -> Self {
        Self {
            pool: AvgPool2d::new(POOL_KERNEL_SIZE, POOL_KERNEL_SIZE),
        }
    }
}

impl Default for AveragePool2d {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for AveragePool2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, channels) = xs.dims3()?;
        let width = seq_len.isqrt();
        if width * width != seq_len {
            return Err(Error::InvalidShape { seq_len }.into());
        }
        let grid = xs
            .transpose(1, 2)?
            .reshape((b_sz, channels, width, width))?
            .contiguous()?;
        self.pool.forward(&grid)?.flatten_from(2)?.transpose(1, 2)
    }
}

/// SigLIP vision tower: pixels in, pooled patch embeddings out.
///
/// Parameters are requested from the supplied [`VarBuilder`] under the names `patch_embedding`,
/// `position_embedding`, `encoder_blocks.{i}` and `final_norm`. The model holds no mutable state,
/// so one instance can serve any number of concurrent forward calls.
pub struct SiglipVisionModel {
    patch_embedding: PatchEmbedding,
    position_embedding: PositionEmbedding,
    encoder: EncoderStack,
    final_norm: LayerNorm,
    avg_pool: AveragePool2d,
    cfg: Arc<SiglipVisionConfig>,
}

impl SiglipVisionModel {
    pub fn new(cfg: &SiglipVisionConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg.clone());

        let model = Self {
            patch_embedding: PatchEmbedding::new(&cfg, vb.pp("patch_embedding"))?,
            position_embedding: PositionEmbedding::new(&cfg, vb.pp("position_embedding"))?,
            encoder: EncoderStack::new(&cfg, vb.pp("encoder_blocks"))?,
            final_norm: layer_norm(cfg.embedding_dim, cfg.layer_norm_eps, vb.pp("final_norm"))?,
            avg_pool: AveragePool2d::new(),
            cfg,
        };
        debug!(
            "Built SigLIP vision tower: {} layers, {} patches pooled to {}.",
            model.cfg.num_hidden_layers,
            model.cfg.num_patches(),
            model.cfg.pooled_sequence_length()
        );
        Ok(model)
    }

    pub fn config(&self) -> &SiglipVisionConfig {
        &self.cfg
    }

    /// Encoder output after the final norm, before pooling: (b, num_patches, embedding_dim).
    pub fn forward_hidden_states(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let xs = self.patch_embedding.forward(pixel_values)?;
        let xs = self.position_embedding.forward(&xs)?;
        let xs = self.encoder.forward(&xs)?;
        xs.apply(&self.final_norm)
    }
}

impl Module for SiglipVisionModel {
    /// (b, channels, image_size, image_size) -> (b, num_patches / 16, embedding_dim)
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let hidden_states = self.forward_hidden_states(pixel_values)?;
        let pooled = self.avg_pool.forward(&hidden_states)?;
        debug!(
            "Vision forward: {:?} -> {:?}",
            pixel_values.dims(),
            pooled.dims()
        );
        Ok(pooled)
    }
}
