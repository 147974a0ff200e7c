//! ControlNet with low-rank adapters on the submodules it shares with a UNet
//!
//! The shared submodules (`conv_in`, the time embeddings, `down_blocks`,
//! `mid_block`) carry the UNet's own weights through tied `Var` handles and
//! only their adapters are trained and saved. Everything else (conditioning
//! embedding, zero convolutions) belongs to this network.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, CONFIG_METADATA_KEY};
use crate::error::{ControlLoraError, Result};
use crate::models::config::ChannelOrder;
use crate::models::controlnet::{ControlNetConfig, ControlNetInput, ControlNetModel, ControlNetOutput};
use crate::models::layers::{LoraAdapter, ParamFactory};
use crate::models::params::{self, is_adapter_path, top_level, Layer, LayerMut, LoadReport, ParamTree, StateDict};
use crate::models::unet::{UNet2DConditionModel, UNetConfig, CONFIG_NAME, WEIGHTS_NAME};
use crate::models::vae::LatentEncoder;

/// Top-level submodules whose base weights come from the UNet.
pub const SHARED_SUBMODULES: &[&str] = &[
    "conv_in",
    "time_proj",
    "time_embedding",
    "class_embedding",
    "down_blocks",
    "mid_block",
    "vae",
];

/// Submodules copied by reference from the UNet in [`ControlLoraModel::tie_weights`].
pub const TIED_SUBMODULES: &[&str] = &[
    "conv_in",
    "time_proj",
    "time_embedding",
    "class_embedding",
    "down_blocks",
    "mid_block",
];

/// Allow-list of shared top-level submodule names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSubmodules {
    names: Vec<String>,
}

impl SharedSubmodules {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether the first segment of `path` is allow-listed.
    pub fn is_shared(&self, path: &str) -> bool {
        let top = top_level(path);
        self.names.iter().any(|name| name == top)
    }

    /// Whether `path` belongs in saved state: owned parameters and adapters.
    pub fn is_persisted(&self, path: &str) -> bool {
        !self.is_shared(path) || is_adapter_path(path)
    }
}

impl Default for SharedSubmodules {
    fn default() -> Self {
        Self::new(SHARED_SUBMODULES.iter().copied())
    }
}

fn default_linear_rank() -> usize {
    4
}

/// ControlNet options plus the adapter options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLoraConfig {
    #[serde(flatten)]
    pub controlnet: ControlNetConfig,
    #[serde(default = "default_linear_rank", alias = "adapter_linear_rank")]
    pub lora_linear_rank: usize,
    #[serde(default, alias = "adapter_conv_rank")]
    pub lora_conv2d_rank: usize,
    /// Condition on the upsampled latent of the conditioning image.
    #[serde(default)]
    pub use_conditioning_latent: bool,
    /// Use the latent itself as the sample, skipping the conditioning embedding.
    #[serde(default)]
    pub use_same_level_conditioning_latent: bool,
}

impl Default for ControlLoraConfig {
    fn default() -> Self {
        Self {
            controlnet: ControlNetConfig::default(),
            lora_linear_rank: default_linear_rank(),
            lora_conv2d_rank: 0,
            use_conditioning_latent: false,
            use_same_level_conditioning_latent: false,
        }
    }
}

impl ControlLoraConfig {
    /// Copies the UNet architecture and takes the rest from `options`.
    pub fn from_unet_config(unet: &UNetConfig, options: &FromUnetOptions) -> Self {
        let controlnet = ControlNetConfig {
            in_channels: unet.in_channels,
            conditioning_channels: options.conditioning_channels,
            flip_sin_to_cos: unet.flip_sin_to_cos,
            freq_shift: unet.freq_shift,
            down_block_types: unet.down_block_types.clone(),
            mid_block_type: unet.mid_block_type,
            only_cross_attention: unet.only_cross_attention.clone(),
            block_out_channels: unet.block_out_channels.clone(),
            layers_per_block: unet.layers_per_block,
            downsample_padding: unet.downsample_padding,
            mid_block_scale_factor: unet.mid_block_scale_factor,
            act_fn: unet.act_fn,
            norm_num_groups: unet.norm_num_groups,
            norm_eps: unet.norm_eps,
            cross_attention_dim: unet.cross_attention_dim,
            transformer_layers_per_block: unet.transformer_layers_per_block.clone(),
            encoder_hid_dim: unet.encoder_hid_dim,
            encoder_hid_dim_type: unet.encoder_hid_dim_type,
            attention_head_dim: unet.attention_head_dim.clone(),
            num_attention_heads: unet.num_attention_heads.clone(),
            use_linear_projection: unet.use_linear_projection,
            class_embed_type: unet.class_embed_type,
            addition_embed_type: unet.addition_embed_type,
            addition_time_embed_dim: unet.addition_time_embed_dim,
            num_class_embeds: unet.num_class_embeds,
            upcast_attention: unet.upcast_attention,
            resnet_time_scale_shift: unet.resnet_time_scale_shift,
            projection_class_embeddings_input_dim: unet.projection_class_embeddings_input_dim,
            controlnet_conditioning_channel_order: options.controlnet_conditioning_channel_order,
            conditioning_embedding_out_channels: options.conditioning_embedding_out_channels.clone(),
            time_cond_proj_dim: unet.time_cond_proj_dim,
            ..ControlNetConfig::default()
        };
        Self {
            controlnet,
            lora_linear_rank: options.lora_linear_rank,
            lora_conv2d_rank: options.lora_conv2d_rank,
            use_conditioning_latent: options.use_conditioning_latent,
            use_same_level_conditioning_latent: options.use_same_level_conditioning_latent,
        }
    }
}

/// Options of [`ControlLoraModel::from_unet`] that the UNet cannot supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FromUnetOptions {
    pub conditioning_channels: usize,
    pub controlnet_conditioning_channel_order: ChannelOrder,
    pub conditioning_embedding_out_channels: Vec<usize>,
    #[serde(alias = "adapter_linear_rank")]
    pub lora_linear_rank: usize,
    #[serde(alias = "adapter_conv_rank")]
    pub lora_conv2d_rank: usize,
    pub use_conditioning_latent: bool,
    pub use_same_level_conditioning_latent: bool,
}

impl Default for FromUnetOptions {
    fn default() -> Self {
        Self {
            conditioning_channels: 3,
            controlnet_conditioning_channel_order: ChannelOrder::Rgb,
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
            lora_linear_rank: default_linear_rank(),
            lora_conv2d_rank: 0,
            use_conditioning_latent: false,
            use_same_level_conditioning_latent: false,
        }
    }
}

impl From<&ControlLoraConfig> for FromUnetOptions {
    fn from(config: &ControlLoraConfig) -> Self {
        Self {
            conditioning_channels: config.controlnet.conditioning_channels,
            controlnet_conditioning_channel_order: config.controlnet.controlnet_conditioning_channel_order,
            conditioning_embedding_out_channels: config.controlnet.conditioning_embedding_out_channels.clone(),
            lora_linear_rank: config.lora_linear_rank,
            lora_conv2d_rank: config.lora_conv2d_rank,
            use_conditioning_latent: config.use_conditioning_latent,
            use_same_level_conditioning_latent: config.use_same_level_conditioning_latent,
        }
    }
}

pub struct ControlLoraModel {
    net: ControlNetModel,
    config: ControlLoraConfig,
    shared: SharedSubmodules,
    encoder: Option<Arc<dyn LatentEncoder>>,
}

impl ControlLoraModel {
    pub fn new(config: ControlLoraConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::with_shared_submodules(config, SharedSubmodules::default(), device, dtype)
    }

    pub fn with_shared_submodules(
        mut config: ControlLoraConfig,
        shared: SharedSubmodules,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let mut net_config = config.controlnet.clone();
        if config.use_conditioning_latent {
            net_config.conditioning_channels = net_config.in_channels;
        }
        let mut net = ControlNetModel::new(&net_config, device, dtype)?;

        if config.use_same_level_conditioning_latent {
            net.disable_conditioning_embedding();
            config.use_conditioning_latent = false;
        }

        let pf = ParamFactory::new(device, dtype);
        let (linear_rank, conv_rank) = (config.lora_linear_rank, config.lora_conv2d_rank);
        let (mut linear_adapters, mut conv_adapters) = (0usize, 0usize);
        net.visit_mut("", &mut |path, layer| {
            if !shared.is_shared(path) {
                return Ok(());
            }
            match layer {
                LayerMut::Conv2d(conv) => {
                    conv.set_adapter_removable(false);
                    if conv_rank > 0 {
                        let adapter = LoraAdapter::conv2d(
                            conv.in_channels(),
                            conv.out_channels(),
                            conv_rank,
                            conv.kernel_size(),
                            conv.config(),
                            &pf,
                        )?;
                        conv.set_adapter(Some(adapter));
                        conv_adapters += 1;
                        debug!("conv adapter on {path}");
                    }
                }
                LayerMut::Linear(linear) => {
                    linear.set_adapter_removable(false);
                    if linear_rank > 0 {
                        let adapter = LoraAdapter::linear(
                            linear.in_features(),
                            linear.out_features(),
                            linear_rank,
                            &pf,
                        )?;
                        linear.set_adapter(Some(adapter));
                        linear_adapters += 1;
                        debug!("linear adapter on {path}");
                    }
                }
                LayerMut::Norm(_) | LayerMut::Embedding(_) => {}
            }
            Ok(())
        })?;
        info!(
            "Installed {linear_adapters} linear (rank {linear_rank}) and {conv_adapters} conv (rank {conv_rank}) adapters"
        );

        Ok(Self {
            net,
            config,
            shared,
            encoder: None,
        })
    }

    /// Builds the adapted network from a UNet's architecture and ties the
    /// shared submodules to its weights.
    pub fn from_unet(unet: &UNet2DConditionModel, options: FromUnetOptions) -> Result<Self> {
        let config = ControlLoraConfig::from_unet_config(unet.config(), &options);
        let mut model = Self::new(config, unet.device(), unet.dtype())?;
        model.tie_weights(unet)?;
        Ok(model)
    }

    pub fn config(&self) -> &ControlLoraConfig {
        &self.config
    }

    pub fn shared_submodules(&self) -> &SharedSubmodules {
        &self.shared
    }

    /// The wrapped ControlNet.
    pub fn controlnet(&self) -> &ControlNetModel {
        &self.net
    }

    pub fn device(&self) -> &Device {
        self.net.device()
    }

    pub fn dtype(&self) -> DType {
        self.net.dtype()
    }

    /// Owned parameters and adapter parameters, in parameter order.
    pub fn state_dict(&self) -> StateDict {
        self.full_state_dict()
            .into_iter()
            .filter(|(path, _)| self.shared.is_persisted(path))
            .collect()
    }

    /// Every parameter, shared ones included.
    pub fn full_state_dict(&self) -> StateDict {
        self.net.state_dict()
    }

    /// Loads `state`, filling shared entries it lacks with the current values.
    pub fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<LoadReport> {
        let mut working = state.clone();
        let mut backfilled = 0usize;
        for (path, tensor) in self.full_state_dict() {
            if self.shared.is_shared(&path) && !working.contains_key(&path) {
                working.insert(path, tensor);
                backfilled += 1;
            }
        }
        debug!("back-filled {backfilled} shared tensors");
        self.net.load_state_dict(&working, strict)
    }

    /// Shares the UNet's parameter storage for every tied submodule.
    ///
    /// Adapter parameters are left alone. A failure may leave the network
    /// partially tied.
    pub fn tie_weights(&mut self, unet: &UNet2DConditionModel) -> Result<()> {
        let has_class_embedding = self.net.has_class_embedding();
        let source: IndexMap<String, Var> = params::named_parameters(unet)
            .into_iter()
            .filter(|(path, _)| {
                let top = top_level(path);
                TIED_SUBMODULES.contains(&top) && (top != "class_embedding" || has_class_embedding)
            })
            .collect();

        let mut tied = HashSet::new();
        params::for_each_param_mut(&mut self.net, |path, var| {
            let Some(theirs) = source.get(path) else {
                return Ok(());
            };
            if var.shape() != theirs.shape() || var.dtype() != theirs.dtype() {
                return Err(ControlLoraError::TieMismatch {
                    path: path.to_string(),
                    ours: var.shape().clone(),
                    our_dtype: var.dtype(),
                    theirs: theirs.shape().clone(),
                    their_dtype: theirs.dtype(),
                });
            }
            *var = theirs.clone();
            tied.insert(path.to_string());
            Ok(())
        })?;

        if let Some(path) = source.keys().find(|path| !tied.contains(path.as_str())) {
            return Err(ControlLoraError::TieTarget { path: path.clone() });
        }
        info!("Tied {} parameters to the base UNet", tied.len());
        Ok(())
    }

    /// Sets the encoder used when latent conditioning is enabled.
    pub fn bind_encoder(&mut self, encoder: Arc<dyn LatentEncoder>) {
        self.encoder = Some(encoder);
    }

    pub fn uses_latent_conditioning(&self) -> bool {
        self.config.use_conditioning_latent || self.config.use_same_level_conditioning_latent
    }

    /// Parameters an optimizer should update: adapters and owned layers.
    pub fn trainable_parameters(&self) -> IndexMap<String, Var> {
        params::named_parameters(&self.net)
            .into_iter()
            .filter(|(path, _)| self.shared.is_persisted(path))
            .collect()
    }

    pub fn forward(&self, input: &ControlNetInput) -> Result<ControlNetOutput> {
        if !self.uses_latent_conditioning() {
            return self.net.forward(input);
        }
        let encoder = self.encoder.as_ref().ok_or(ControlLoraError::EncoderNotBound)?;
        let latent = self.encode_condition(encoder.as_ref(), input)?;

        if self.config.use_same_level_conditioning_latent {
            let input = ControlNetInput {
                sample: &latent,
                ..*input
            };
            self.net.forward(&input)
        } else {
            let input = ControlNetInput {
                controlnet_cond: &latent,
                ..*input
            };
            self.net.forward(&input)
        }
    }

    /// Scaled latent of the conditioning image, outside the autograd graph.
    fn encode_condition(&self, encoder: &dyn LatentEncoder, input: &ControlNetInput) -> Result<Tensor> {
        let sample = input.sample;
        let images = input
            .controlnet_cond
            .affine(2.0, -1.0)?
            .to_device(encoder.device())?
            .to_dtype(encoder.dtype())?;
        let latent = encoder
            .encode(&images)?
            .detach()
            .to_device(sample.device())?
            .to_dtype(sample.dtype())?
            .affine(encoder.scaling_factor(), 0.0)?;

        if self.config.use_conditioning_latent {
            let factor = encoder.downsample_factor();
            let (_, _, h, w) = latent.dims4()?;
            Ok(latent.upsample_nearest2d(h * factor, w * factor)?)
        } else {
            Ok(latent)
        }
    }

    fn checkpoint_metadata(&self) -> Result<HashMap<String, String>> {
        let mut metadata = HashMap::new();
        metadata.insert(CONFIG_METADATA_KEY.to_string(), serde_json::to_string(&self.config)?);
        Ok(metadata)
    }

    /// Writes the persisted state as safetensors, with the configuration
    /// embedded in the metadata.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(&self.state_dict(), self.checkpoint_metadata()?, path.as_ref())
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>, strict: bool) -> Result<LoadReport> {
        let (state, metadata) = checkpoint::load(path.as_ref(), self.device())?;
        if let Some(raw) = metadata.get(CONFIG_METADATA_KEY) {
            let saved: ControlLoraConfig = serde_json::from_str(raw)?;
            if saved != self.config {
                warn!("checkpoint was saved with a different configuration");
            }
        }
        self.load_state_dict(&state, strict)
    }

    /// Reads the configuration embedded in a checkpoint, if any.
    pub fn checkpoint_config(path: impl AsRef<Path>) -> Result<Option<ControlLoraConfig>> {
        let (_, metadata) = checkpoint::load(path.as_ref(), &Device::Cpu)?;
        match metadata.get(CONFIG_METADATA_KEY) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Writes `config.json` and the persisted weights into `dir`.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CONFIG_NAME), serde_json::to_string_pretty(&self.config)?)?;
        checkpoint::save(&self.state_dict(), self.checkpoint_metadata()?, &dir.join(WEIGHTS_NAME))?;
        info!("Saved adapted ControlNet to {}", dir.display());
        Ok(())
    }

    /// Rebuilds a model written by [`save_pretrained`](Self::save_pretrained)
    /// on top of `unet`.
    pub fn from_pretrained(dir: impl AsRef<Path>, unet: &UNet2DConditionModel) -> Result<Self> {
        let dir = dir.as_ref();
        let config: ControlLoraConfig =
            serde_json::from_str(&std::fs::read_to_string(dir.join(CONFIG_NAME))?)?;
        let mut model = Self::new(config, unet.device(), unet.dtype())?;
        model.tie_weights(unet)?;
        model.load_checkpoint(dir.join(WEIGHTS_NAME), true)?;
        Ok(model)
    }
}

impl ParamTree for ControlLoraModel {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.net.visit(prefix, f)
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()> {
        self.net.visit_mut(prefix, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::ClassEmbedType;
    use crate::models::controlnet::tests::{inputs, tiny_config};
    use crate::models::params::named_parameters;
    use crate::models::unet::tests::tiny_config as tiny_unet_config;

    fn lora_config(linear_rank: usize, conv_rank: usize) -> ControlLoraConfig {
        ControlLoraConfig {
            controlnet: tiny_config(),
            lora_linear_rank: linear_rank,
            lora_conv2d_rank: conv_rank,
            ..Default::default()
        }
    }

    fn tiny_options() -> FromUnetOptions {
        FromUnetOptions {
            conditioning_embedding_out_channels: vec![16, 32],
            ..Default::default()
        }
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    /// Fills every owned parameter with noise so outputs are not all zero.
    fn randomize_owned(model: &ControlLoraModel) -> Result<()> {
        for (path, var) in model.trainable_parameters() {
            if !is_adapter_path(&path) {
                var.set(&var.randn_like(0.0, 0.1)?)?;
            }
        }
        Ok(())
    }

    /// Average-pools to half resolution and pads to four channels.
    struct PoolEncoder {
        device: Device,
        block_out_channels: Vec<usize>,
    }

    impl PoolEncoder {
        fn new() -> Self {
            Self {
                device: Device::Cpu,
                block_out_channels: vec![8, 8],
            }
        }
    }

    impl LatentEncoder for PoolEncoder {
        fn encode(&self, images: &Tensor) -> candle_core::Result<Tensor> {
            let pooled = images.avg_pool2d(2)?;
            let first = pooled.narrow(1, 0, 1)?;
            Tensor::cat(&[&pooled, &first], 1)
        }

        fn scaling_factor(&self) -> f64 {
            0.5
        }

        fn block_out_channels(&self) -> &[usize] {
            &self.block_out_channels
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn dtype(&self) -> DType {
            DType::F32
        }
    }

    #[test]
    fn test_linear_rank_only_adapts_linear_layers_in_shared_submodules() -> Result<()> {
        let model = ControlLoraModel::new(lora_config(4, 0), &Device::Cpu, DType::F32)?;
        let mut adapted_linear = 0;
        model.visit("", &mut |path, layer| {
            let shared = model.shared_submodules().is_shared(path);
            match layer {
                Layer::Linear(l) => {
                    assert_eq!(l.adapter().is_some(), shared, "{path}");
                    assert_eq!(l.adapter_removable(), !shared, "{path}");
                    if shared {
                        assert_eq!(l.adapter().map(|a| a.rank()), Some(4));
                        adapted_linear += 1;
                    }
                }
                Layer::Conv2d(c) => {
                    assert!(c.adapter().is_none(), "{path}");
                    assert_eq!(c.adapter_removable(), !shared, "{path}");
                }
                _ => {}
            }
        });
        assert!(adapted_linear > 0);

        // Persisted state: both projections of every adapter, nothing else shared.
        let state = model.state_dict();
        let adapter_keys: Vec<&String> = state.keys().filter(|k| is_adapter_path(k)).collect();
        assert_eq!(adapter_keys.len(), 2 * adapted_linear);
        for key in state.keys() {
            assert!(
                !model.shared_submodules().is_shared(key) || is_adapter_path(key),
                "{key} should not be persisted"
            );
        }
        assert!(state.contains_key(
            "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.lora_layer.down.weight"
        ));
        assert!(state.contains_key("time_embedding.linear_1.lora_layer.up.weight"));
        assert!(state.contains_key("controlnet_cond_embedding.conv_in.weight"));
        assert!(state.contains_key("controlnet_mid_block.bias"));
        assert!(!state.contains_key("conv_in.weight"));
        Ok(())
    }

    #[test]
    fn test_conv_rank_uses_its_own_rank_and_geometry() -> Result<()> {
        let model = ControlLoraModel::new(lora_config(0, 2), &Device::Cpu, DType::F32)?;
        let state = model.state_dict();
        assert_eq!(state["conv_in.lora_layer.down.weight"].dims(), &[2, 4, 3, 3]);
        assert_eq!(state["conv_in.lora_layer.up.weight"].dims(), &[32, 2, 1, 1]);
        assert_eq!(
            state["down_blocks.0.downsamplers.0.conv.lora_layer.down.weight"].dims(),
            &[2, 32, 3, 3]
        );
        assert!(!state.keys().any(|k| k.contains("to_q.lora_layer")));
        Ok(())
    }

    #[test]
    fn test_clear_adapter_is_ignored_in_shared_submodules() -> Result<()> {
        let mut model = ControlLoraModel::new(lora_config(4, 0), &Device::Cpu, DType::F32)?;
        let before = model.state_dict().len();
        model.visit_mut("", &mut |_, layer| {
            match layer {
                LayerMut::Linear(l) => l.set_adapter(None),
                LayerMut::Conv2d(c) => c.clear_adapter(),
                _ => {}
            }
            Ok(())
        })?;
        assert_eq!(model.state_dict().len(), before);
        Ok(())
    }

    #[test]
    fn test_save_load_is_idempotent() -> Result<()> {
        let dev = Device::Cpu;
        let mut model = ControlLoraModel::new(lora_config(4, 2), &dev, DType::F32)?;
        randomize_owned(&model)?;
        let saved = model.state_dict();
        let report = model.load_state_dict(&saved, true)?;
        assert!(report.is_clean());

        let again = model.state_dict();
        assert_eq!(saved.keys().collect::<Vec<_>>(), again.keys().collect::<Vec<_>>());
        for (key, tensor) in &saved {
            assert_eq!(max_diff(tensor, &again[key])?, 0.0, "{key}");
        }

        // Into a fresh model of the same configuration.
        let mut fresh = ControlLoraModel::new(lora_config(4, 2), &dev, DType::F32)?;
        fresh.load_state_dict(&saved, true)?;
        for (key, tensor) in fresh.state_dict() {
            assert_eq!(max_diff(&tensor, &saved[&key])?, 0.0, "{key}");
        }
        Ok(())
    }

    #[test]
    fn test_strict_load_rejects_foreign_adapters() -> Result<()> {
        let dev = Device::Cpu;
        let rank4 = ControlLoraModel::new(lora_config(4, 0), &dev, DType::F32)?;
        let state = rank4.state_dict();

        let mut rank8 = ControlLoraModel::new(lora_config(8, 0), &dev, DType::F32)?;
        assert!(matches!(
            rank8.load_state_dict(&state, true),
            Err(ControlLoraError::ShapeMismatch { .. })
        ));

        let mut plain = ControlLoraModel::new(lora_config(0, 0), &dev, DType::F32)?;
        match plain.load_state_dict(&state, true) {
            Err(ControlLoraError::StateDict { missing, unexpected }) => {
                assert!(missing.is_empty());
                assert!(unexpected.iter().all(|k| is_adapter_path(k)));
            }
            _ => panic!("expected a state dict error"),
        }
        let report = plain.load_state_dict(&state, false)?;
        assert!(!report.unexpected_keys.is_empty());
        Ok(())
    }

    #[test]
    fn test_tied_parameters_share_storage_with_unet() -> Result<()> {
        let dev = Device::Cpu;
        let unet = UNet2DConditionModel::new(&tiny_unet_config(), &dev, DType::F32)?;
        let model = ControlLoraModel::from_unet(&unet, tiny_options())?;

        let ours = named_parameters(&model);
        let theirs = named_parameters(&unet);
        let mut checked = 0;
        for (path, var) in &theirs {
            if TIED_SUBMODULES.contains(&top_level(path)) {
                assert_eq!(ours[path].as_tensor().id(), var.as_tensor().id(), "{path}");
                checked += 1;
            }
        }
        assert!(checked > 0);
        // Adapters stay private.
        assert!(ours.keys().filter(|k| is_adapter_path(k)).all(|k| !theirs.contains_key(k)));

        // An update through the UNet is visible here.
        let w = &theirs["down_blocks.0.resnets.0.conv1.weight"];
        w.set(&w.zeros_like()?)?;
        let seen = model.full_state_dict()["down_blocks.0.resnets.0.conv1.weight"]
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(seen, 0.0);
        Ok(())
    }

    #[test]
    fn test_class_embedding_is_tied_only_when_present() -> Result<()> {
        let dev = Device::Cpu;
        let mut with_class = tiny_unet_config();
        with_class.class_embed_type = Some(ClassEmbedType::Timestep);
        let unet = UNet2DConditionModel::new(&with_class, &dev, DType::F32)?;

        let model = ControlLoraModel::from_unet(&unet, tiny_options())?;
        assert!(model.controlnet().has_class_embedding());
        let ours = named_parameters(&model);
        let theirs = named_parameters(&unet);
        let class_keys: Vec<&String> = theirs
            .keys()
            .filter(|k| top_level(k) == "class_embedding")
            .collect();
        assert!(!class_keys.is_empty());
        for path in class_keys {
            assert_eq!(ours[path].as_tensor().id(), theirs[path].as_tensor().id(), "{path}");
        }
        // Adapters on the class embedding are persisted, its base weights are not.
        let state = model.state_dict();
        assert!(state.keys().any(|k| top_level(k) == "class_embedding" && is_adapter_path(k)));
        assert!(state.keys().all(|k| top_level(k) != "class_embedding" || is_adapter_path(k)));

        // A network without one skips the UNet's class embedding.
        let mut plain = ControlLoraModel::new(lora_config(4, 0), &dev, DType::F32)?;
        assert!(!plain.controlnet().has_class_embedding());
        plain.tie_weights(&unet)?;
        assert!(named_parameters(&plain).keys().all(|k| top_level(k) != "class_embedding"));
        Ok(())
    }

    #[test]
    fn test_tie_rejects_mismatched_unets() -> Result<()> {
        let dev = Device::Cpu;
        let mut model = ControlLoraModel::new(lora_config(4, 0), &dev, DType::F32)?;

        let mut wider = tiny_unet_config();
        wider.block_out_channels = vec![32, 96];
        let unet = UNet2DConditionModel::new(&wider, &dev, DType::F32)?;
        assert!(matches!(
            model.tie_weights(&unet),
            Err(ControlLoraError::TieMismatch { .. })
        ));

        let mut with_cond = tiny_unet_config();
        with_cond.time_cond_proj_dim = Some(8);
        let unet = UNet2DConditionModel::new(&with_cond, &dev, DType::F32)?;
        let mut model = ControlLoraModel::new(lora_config(4, 0), &dev, DType::F32)?;
        match model.tie_weights(&unet) {
            Err(ControlLoraError::TieTarget { path }) => {
                assert_eq!(path, "time_embedding.cond_proj.weight")
            }
            _ => panic!("expected a tie target error"),
        }
        Ok(())
    }

    #[test]
    fn test_zero_rank_matches_plain_controlnet_bit_for_bit() -> Result<()> {
        let dev = Device::Cpu;
        let plain = ControlNetModel::new(&tiny_config(), &dev, DType::F32)?;
        for (_, var) in named_parameters(&plain) {
            var.set(&var.randn_like(0.0, 0.05)?)?;
        }
        let mut model = ControlLoraModel::new(lora_config(0, 0), &dev, DType::F32)?;
        model.load_state_dict(&plain.state_dict(), true)?;

        let data = inputs(&dev)?;
        let a = plain.forward(&data.as_input())?;
        let b = model.forward(&data.as_input())?;
        for (x, y) in a.down_block_res_samples.iter().zip(b.down_block_res_samples.iter()) {
            assert_eq!(max_diff(x, y)?, 0.0);
        }
        assert_eq!(max_diff(&a.mid_block_res_sample, &b.mid_block_res_sample)?, 0.0);
        assert!(a.mid_block_res_sample.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn test_latent_modes_need_a_bound_encoder() -> Result<()> {
        let dev = Device::Cpu;
        let mut config = lora_config(4, 0);
        config.use_conditioning_latent = true;
        let model = ControlLoraModel::new(config, &dev, DType::F32)?;
        let data = inputs(&dev)?;
        assert!(matches!(
            model.forward(&data.as_input()),
            Err(ControlLoraError::EncoderNotBound)
        ));
        Ok(())
    }

    #[test]
    fn test_full_latent_conditioning_upsamples_to_pixel_size() -> Result<()> {
        let dev = Device::Cpu;
        let mut config = lora_config(4, 0);
        config.use_conditioning_latent = true;
        let mut model = ControlLoraModel::new(config, &dev, DType::F32)?;
        assert!(model.controlnet().has_conditioning_embedding());
        // Conditioning embedding now takes latent channels.
        assert_eq!(
            model.state_dict()["controlnet_cond_embedding.conv_in.weight"].dims(),
            &[16, 4, 3, 3]
        );
        model.bind_encoder(Arc::new(PoolEncoder::new()));
        let data = inputs(&dev)?;
        let out = model.forward(&data.as_input())?;
        assert_eq!(out.down_block_res_samples[0].dims(), &[2, 32, 16, 16]);
        Ok(())
    }

    #[test]
    fn test_same_level_latent_replaces_sample() -> Result<()> {
        let dev = Device::Cpu;
        let mut config = lora_config(4, 0);
        config.use_conditioning_latent = true;
        config.use_same_level_conditioning_latent = true;
        let mut model = ControlLoraModel::new(config, &dev, DType::F32)?;
        assert!(!model.config().use_conditioning_latent);
        assert!(!model.controlnet().has_conditioning_embedding());
        assert!(!model.state_dict().keys().any(|k| k.starts_with("controlnet_cond_embedding")));
        randomize_owned(&model)?;
        let encoder = Arc::new(PoolEncoder::new());
        model.bind_encoder(encoder.clone());

        let data = inputs(&dev)?;
        let out = model.forward(&data.as_input())?;

        let latent = (encoder.encode(&data.cond.affine(2.0, -1.0)?)? * 0.5)?;
        let mut direct = data.as_input();
        direct.sample = &latent;
        let expected = model.controlnet().forward(&direct)?;
        assert_eq!(max_diff(&out.mid_block_res_sample, &expected.mid_block_res_sample)?, 0.0);

        // The noisy sample plays no part.
        let other = Tensor::randn(0f32, 1f32, data.sample.dims(), &dev)?;
        let mut replaced = data.as_input();
        replaced.sample = &other;
        let out2 = model.forward(&replaced)?;
        assert_eq!(max_diff(&out.mid_block_res_sample, &out2.mid_block_res_sample)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_config_reads_adapter_aliases() -> Result<()> {
        let json = r#"{
            "block_out_channels": [32, 64],
            "down_block_types": ["CrossAttnDownBlock2D", "DownBlock2D"],
            "adapter_linear_rank": 8,
            "adapter_conv_rank": 2,
            "use_same_level_conditioning_latent": true
        }"#;
        let config: ControlLoraConfig = serde_json::from_str(json)?;
        assert_eq!(config.lora_linear_rank, 8);
        assert_eq!(config.lora_conv2d_rank, 2);
        assert!(config.use_same_level_conditioning_latent);
        assert_eq!(config.controlnet.block_out_channels, vec![32, 64]);

        let defaults: ControlLoraConfig = serde_json::from_str("{}")?;
        assert_eq!(defaults.lora_linear_rank, 4);
        assert_eq!(defaults.lora_conv2d_rank, 0);
        Ok(())
    }

    #[test]
    fn test_checkpoint_round_trip_through_unet() -> Result<()> {
        let dev = Device::Cpu;
        let unet = UNet2DConditionModel::new(&tiny_unet_config(), &dev, DType::F32)?;
        let model = ControlLoraModel::from_unet(&unet, tiny_options())?;
        randomize_owned(&model)?;
        for (path, var) in model.trainable_parameters() {
            if is_adapter_path(&path) {
                var.set(&var.randn_like(0.0, 0.1)?)?;
            }
        }

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("controllora.safetensors");
        model.save_checkpoint(&file)?;
        assert_eq!(ControlLoraModel::checkpoint_config(&file)?.as_ref(), Some(model.config()));

        let mut restored = ControlLoraModel::from_unet(&unet, tiny_options())?;
        restored.load_checkpoint(&file, true)?;
        for (key, tensor) in model.state_dict() {
            assert_eq!(max_diff(&tensor, &restored.state_dict()[&key])?, 0.0, "{key}");
        }

        model.save_pretrained(dir.path().join("pretrained"))?;
        let reloaded = ControlLoraModel::from_pretrained(dir.path().join("pretrained"), &unet)?;
        assert_eq!(reloaded.config(), model.config());
        let key = "controlnet_down_blocks.0.weight";
        assert_eq!(max_diff(&model.state_dict()[key], &reloaded.state_dict()[key])?, 0.0);
        // Still tied after loading.
        assert_eq!(
            named_parameters(&reloaded)["conv_in.weight"].as_tensor().id(),
            named_parameters(&unet)["conv_in.weight"].as_tensor().id()
        );
        Ok(())
    }

    #[test]
    fn test_trainable_parameters_exclude_shared_weights() -> Result<()> {
        let model = ControlLoraModel::new(lora_config(4, 0), &Device::Cpu, DType::F32)?;
        let trainable = model.trainable_parameters();
        assert!(trainable.keys().all(|k| model.shared_submodules().is_persisted(k)));
        assert_eq!(trainable.len(), model.state_dict().len());
        Ok(())
    }
}
