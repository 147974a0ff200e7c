//! Architecture options shared by the ControlNet and the UNet
//!
//! Field names and string values follow diffusers `config.json` files so
//! that configurations can be read from existing checkpoints.

use serde::{Deserialize, Serialize};

use super::layers::Activation;
use crate::error::{config_err, Result};

/// A value given once for every block, or once per block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerBlock<T> {
    Uniform(T),
    Each(Vec<T>),
}

impl<T: Clone> PerBlock<T> {
    pub fn resolve(&self, num_blocks: usize, field: &str) -> Result<Vec<T>> {
        match self {
            PerBlock::Uniform(v) => Ok(vec![v.clone(); num_blocks]),
            PerBlock::Each(values) if values.len() == num_blocks => Ok(values.clone()),
            PerBlock::Each(values) => Err(config_err(format!(
                "`{field}` has {} entries but there are {num_blocks} down blocks",
                values.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownBlockType {
    CrossAttnDownBlock2D,
    DownBlock2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpBlockType {
    CrossAttnUpBlock2D,
    UpBlock2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidBlockType {
    UNetMidBlock2DCrossAttn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassEmbedType {
    Timestep,
    Identity,
    Projection,
    SimpleProjection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdditionEmbedType {
    TextTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderHidDimType {
    TextProj,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeScaleShift {
    #[default]
    Default,
    ScaleShift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Options for one cross-attention transformer stack.
#[derive(Debug, Clone, Copy)]
pub struct AttentionOptions {
    pub num_heads: usize,
    pub depth: usize,
    pub cross_attention_dim: usize,
    pub only_cross_attention: bool,
    pub use_linear_projection: bool,
    pub upcast_attention: bool,
    pub norm_num_groups: usize,
}

/// Resolved, validated description of the encoder half of a UNet.
///
/// Both the ControlNet and the UNet build their time embeddings, `conv_in`,
/// down blocks and mid block from this, so the shared submodules of the two
/// networks have identical paths and shapes when built from matching
/// configurations.
#[derive(Debug, Clone)]
pub struct TrunkConfig {
    pub in_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<DownBlockType>,
    pub mid_block_type: Option<MidBlockType>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub mid_block_scale_factor: f64,
    pub act_fn: Activation,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub transformer_layers_per_block: Vec<usize>,
    pub num_attention_heads: Vec<usize>,
    pub only_cross_attention: Vec<bool>,
    pub use_linear_projection: bool,
    pub upcast_attention: bool,
    pub resnet_time_scale_shift: TimeScaleShift,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub class_embed_type: Option<ClassEmbedType>,
    pub num_class_embeds: Option<usize>,
    pub projection_class_embeddings_input_dim: Option<usize>,
    pub addition_embed_type: Option<AdditionEmbedType>,
    pub addition_time_embed_dim: Option<usize>,
    pub encoder_hid_dim: Option<usize>,
    pub encoder_hid_dim_type: Option<EncoderHidDimType>,
    pub time_cond_proj_dim: Option<usize>,
}

impl TrunkConfig {
    pub fn time_embed_dim(&self) -> usize {
        self.block_out_channels[0] * 4
    }

    pub fn attention(&self, block: usize) -> AttentionOptions {
        AttentionOptions {
            num_heads: self.num_attention_heads[block],
            depth: self.transformer_layers_per_block[block],
            cross_attention_dim: self.cross_attention_dim,
            only_cross_attention: self.only_cross_attention[block],
            use_linear_projection: self.use_linear_projection,
            upcast_attention: self.upcast_attention,
            norm_num_groups: self.norm_num_groups,
        }
    }

    /// Options for the mid block, which uses the last block's settings.
    pub fn mid_attention(&self) -> AttentionOptions {
        let last = self.block_out_channels.len() - 1;
        AttentionOptions {
            only_cross_attention: false,
            ..self.attention(last)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.block_out_channels.len();
        if n == 0 {
            return Err(config_err("`block_out_channels` must not be empty"));
        }
        if self.down_block_types.len() != n {
            return Err(config_err(format!(
                "`down_block_types` has {} entries, `block_out_channels` has {n}",
                self.down_block_types.len()
            )));
        }
        if self.layers_per_block == 0 {
            return Err(config_err("`layers_per_block` must be positive"));
        }
        if self.norm_num_groups == 0 {
            return Err(config_err("`norm_num_groups` must be positive"));
        }
        for &channels in &self.block_out_channels {
            if channels % self.norm_num_groups != 0 {
                return Err(config_err(format!(
                    "{channels} block channels are not divisible by {} norm groups",
                    self.norm_num_groups
                )));
            }
        }
        for (i, block) in self.down_block_types.iter().enumerate() {
            let uses_attention = *block == DownBlockType::CrossAttnDownBlock2D
                || (i == n - 1 && self.mid_block_type.is_some());
            let heads = self.num_attention_heads[i];
            if uses_attention && (heads == 0 || self.block_out_channels[i] % heads != 0) {
                return Err(config_err(format!(
                    "block {i}: {} channels cannot be split into {heads} attention heads",
                    self.block_out_channels[i]
                )));
            }
        }
        match self.class_embed_type {
            Some(ClassEmbedType::Projection) | Some(ClassEmbedType::SimpleProjection)
                if self.projection_class_embeddings_input_dim.is_none() =>
            {
                return Err(config_err(
                    "projection class embeddings need `projection_class_embeddings_input_dim`",
                ))
            }
            Some(_) if self.num_class_embeds.is_some() => {
                return Err(config_err(
                    "`num_class_embeds` and `class_embed_type` are mutually exclusive",
                ))
            }
            _ => {}
        }
        if self.addition_embed_type == Some(AdditionEmbedType::TextTime)
            && (self.addition_time_embed_dim.is_none()
                || self.projection_class_embeddings_input_dim.is_none())
        {
            return Err(config_err(
                "`text_time` addition embedding needs `addition_time_embed_dim` and \
                 `projection_class_embeddings_input_dim`",
            ));
        }
        if self.encoder_hid_dim_type.is_some() && self.encoder_hid_dim.is_none() {
            return Err(config_err("`encoder_hid_dim_type` is set without `encoder_hid_dim`"));
        }
        Ok(())
    }
}

// serde default helpers shared by the model configs
pub(crate) fn default_in_channels() -> usize {
    4
}
pub(crate) fn default_true() -> bool {
    true
}
pub(crate) fn default_block_out_channels() -> Vec<usize> {
    vec![320, 640, 1280, 1280]
}
pub(crate) fn default_down_block_types() -> Vec<DownBlockType> {
    vec![
        DownBlockType::CrossAttnDownBlock2D,
        DownBlockType::CrossAttnDownBlock2D,
        DownBlockType::CrossAttnDownBlock2D,
        DownBlockType::DownBlock2D,
    ]
}
pub(crate) fn default_mid_block_type() -> Option<MidBlockType> {
    Some(MidBlockType::UNetMidBlock2DCrossAttn)
}
pub(crate) fn default_only_cross_attention() -> PerBlock<bool> {
    PerBlock::Uniform(false)
}
pub(crate) fn default_layers_per_block() -> usize {
    2
}
pub(crate) fn default_one() -> usize {
    1
}
pub(crate) fn default_scale_factor() -> f64 {
    1.0
}
pub(crate) fn default_norm_num_groups() -> usize {
    32
}
pub(crate) fn default_norm_eps() -> f64 {
    1e-5
}
pub(crate) fn default_cross_attention_dim() -> usize {
    1280
}
pub(crate) fn default_transformer_layers() -> PerBlock<usize> {
    PerBlock::Uniform(1)
}
pub(crate) fn default_attention_head_dim() -> PerBlock<usize> {
    PerBlock::Uniform(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_block_parses_int_or_list() {
        let uniform: PerBlock<usize> = serde_json::from_str("2").unwrap();
        assert_eq!(uniform.resolve(3, "x").unwrap(), vec![2, 2, 2]);

        let each: PerBlock<usize> = serde_json::from_str("[1, 2, 10]").unwrap();
        assert_eq!(each.resolve(3, "x").unwrap(), vec![1, 2, 10]);
        assert!(each.resolve(4, "x").is_err());
    }

    #[test]
    fn test_enum_strings_match_diffusers() {
        let t: TimeScaleShift = serde_json::from_str("\"scale_shift\"").unwrap();
        assert_eq!(t, TimeScaleShift::ScaleShift);
        let c: ClassEmbedType = serde_json::from_str("\"simple_projection\"").unwrap();
        assert_eq!(c, ClassEmbedType::SimpleProjection);
        let b: DownBlockType = serde_json::from_str("\"CrossAttnDownBlock2D\"").unwrap();
        assert_eq!(b, DownBlockType::CrossAttnDownBlock2D);
        let a: Activation = serde_json::from_str("\"swish\"").unwrap();
        assert_eq!(a, Activation::Silu);
    }
}
