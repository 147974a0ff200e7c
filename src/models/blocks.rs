//! Down, mid and up blocks of the UNet trunk

use candle_core::{Result, Tensor};

use super::attention::Transformer2DModel;
use super::config::{AttentionOptions, DownBlockType, TrunkConfig, UpBlockType};
use super::layers::ParamFactory;
use super::params::{join, Layer, LayerMut, ParamTree};
use super::resnet::{Downsample2D, ResnetBlock2D, ResnetBlock2DConfig, Upsample2D};

/// Per-call inputs shared by every block.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub temb: &'a Tensor,
    pub encoder_hidden_states: &'a Tensor,
    pub encoder_attention_bias: Option<&'a Tensor>,
}

fn resnet_config(cfg: &TrunkConfig, out_channels: usize, output_scale_factor: f64) -> ResnetBlock2DConfig {
    ResnetBlock2DConfig {
        out_channels,
        temb_channels: Some(cfg.time_embed_dim()),
        groups: cfg.norm_num_groups,
        eps: cfg.norm_eps,
        output_scale_factor,
        time_scale_shift: cfg.resnet_time_scale_shift,
        act: cfg.act_fn,
    }
}

#[derive(Debug, Clone)]
pub struct DownBlock2D {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<Transformer2DModel>,
    downsamplers: Vec<Downsample2D>,
}

impl DownBlock2D {
    /// `attention` turns this into a CrossAttnDownBlock2D.
    pub fn new(
        cfg: &TrunkConfig,
        in_channels: usize,
        out_channels: usize,
        add_downsample: bool,
        attention: Option<AttentionOptions>,
        pf: &ParamFactory,
    ) -> Result<Self> {
        let rcfg = resnet_config(cfg, out_channels, 1.0);
        let mut resnets = Vec::with_capacity(cfg.layers_per_block);
        let mut attentions = Vec::new();
        for i in 0..cfg.layers_per_block {
            let in_channels = if i == 0 { in_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(in_channels, rcfg, pf)?);
            if let Some(opts) = &attention {
                attentions.push(Transformer2DModel::new(out_channels, opts, pf)?);
            }
        }
        let downsamplers = if add_downsample {
            vec![Downsample2D::new(out_channels, cfg.downsample_padding, pf)?]
        } else {
            vec![]
        };
        Ok(Self {
            resnets,
            attentions,
            downsamplers,
        })
    }

    /// Returns the output and every intermediate state (the skip connections).
    pub fn forward(&self, xs: &Tensor, ctx: &BlockContext) -> Result<(Tensor, Vec<Tensor>)> {
        let mut states = Vec::with_capacity(self.resnets.len() + self.downsamplers.len());
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(ctx.temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, ctx.encoder_hidden_states, ctx.encoder_attention_bias)?;
            }
            states.push(xs.clone());
        }
        for downsampler in &self.downsamplers {
            xs = downsampler.forward(&xs)?;
            states.push(xs.clone());
        }
        Ok((xs, states))
    }

    pub fn num_states(&self) -> usize {
        self.resnets.len() + self.downsamplers.len()
    }
}

impl ParamTree for DownBlock2D {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.resnets.visit(&join(prefix, "resnets"), f);
        self.attentions.visit(&join(prefix, "attentions"), f);
        self.downsamplers.visit(&join(prefix, "downsamplers"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.resnets.visit_mut(&join(prefix, "resnets"), f)?;
        self.attentions.visit_mut(&join(prefix, "attentions"), f)?;
        self.downsamplers.visit_mut(&join(prefix, "downsamplers"), f)
    }
}

/// Builds the down blocks described by `cfg`.
pub fn build_down_blocks(cfg: &TrunkConfig, pf: &ParamFactory) -> Result<Vec<DownBlock2D>> {
    let n = cfg.block_out_channels.len();
    let mut output_channel = cfg.block_out_channels[0];
    let mut blocks = Vec::with_capacity(n);
    for (i, block_type) in cfg.down_block_types.iter().enumerate() {
        let input_channel = output_channel;
        output_channel = cfg.block_out_channels[i];
        let attention = match block_type {
            DownBlockType::CrossAttnDownBlock2D => Some(cfg.attention(i)),
            DownBlockType::DownBlock2D => None,
        };
        blocks.push(DownBlock2D::new(
            cfg,
            input_channel,
            output_channel,
            i != n - 1,
            attention,
            pf,
        )?);
    }
    Ok(blocks)
}

/// UNetMidBlock2DCrossAttn.
#[derive(Debug, Clone)]
pub struct MidBlock2DCrossAttn {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<Transformer2DModel>,
}

impl MidBlock2DCrossAttn {
    pub fn new(cfg: &TrunkConfig, pf: &ParamFactory) -> Result<Self> {
        let channels = cfg.block_out_channels[cfg.block_out_channels.len() - 1];
        let rcfg = resnet_config(cfg, channels, cfg.mid_block_scale_factor);
        let opts = cfg.mid_attention();
        Ok(Self {
            resnets: vec![
                ResnetBlock2D::new(channels, rcfg, pf)?,
                ResnetBlock2D::new(channels, rcfg, pf)?,
            ],
            attentions: vec![Transformer2DModel::new(channels, &opts, pf)?],
        })
    }

    pub fn forward(&self, xs: &Tensor, ctx: &BlockContext) -> Result<Tensor> {
        let mut xs = self.resnets[0].forward(xs, Some(ctx.temb))?;
        for (attn, resnet) in self.attentions.iter().zip(self.resnets.iter().skip(1)) {
            xs = attn.forward(&xs, ctx.encoder_hidden_states, ctx.encoder_attention_bias)?;
            xs = resnet.forward(&xs, Some(ctx.temb))?;
        }
        Ok(xs)
    }
}

impl ParamTree for MidBlock2DCrossAttn {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.attentions.visit(&join(prefix, "attentions"), f);
        self.resnets.visit(&join(prefix, "resnets"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.attentions.visit_mut(&join(prefix, "attentions"), f)?;
        self.resnets.visit_mut(&join(prefix, "resnets"), f)
    }
}

#[derive(Debug, Clone)]
pub struct UpBlock2D {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<Transformer2DModel>,
    upsamplers: Vec<Upsample2D>,
}

impl UpBlock2D {
    /// `attention` turns this into a CrossAttnUpBlock2D.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &TrunkConfig,
        in_channels: usize,
        prev_output_channels: usize,
        out_channels: usize,
        add_upsample: bool,
        attention: Option<AttentionOptions>,
        pf: &ParamFactory,
    ) -> Result<Self> {
        let num_layers = cfg.layers_per_block + 1;
        let rcfg = resnet_config(cfg, out_channels, 1.0);
        let mut resnets = Vec::with_capacity(num_layers);
        let mut attentions = Vec::new();
        for i in 0..num_layers {
            let res_skip_channels = if i == num_layers - 1 { in_channels } else { out_channels };
            let resnet_in_channels = if i == 0 { prev_output_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(resnet_in_channels + res_skip_channels, rcfg, pf)?);
            if let Some(opts) = &attention {
                attentions.push(Transformer2DModel::new(out_channels, opts, pf)?);
            }
        }
        let upsamplers = if add_upsample {
            vec![Upsample2D::new(out_channels, pf)?]
        } else {
            vec![]
        };
        Ok(Self {
            resnets,
            attentions,
            upsamplers,
        })
    }

    pub fn num_resnets(&self) -> usize {
        self.resnets.len()
    }

    /// `skips` are consumed from the back, one per resnet.
    pub fn forward(
        &self,
        xs: &Tensor,
        skips: &[Tensor],
        upsample_size: Option<(usize, usize)>,
        ctx: &BlockContext,
    ) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            let skip = &skips[skips.len() - 1 - i];
            xs = Tensor::cat(&[&xs, skip], 1)?;
            xs = resnet.forward(&xs, Some(ctx.temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, ctx.encoder_hidden_states, ctx.encoder_attention_bias)?;
            }
        }
        for upsampler in &self.upsamplers {
            xs = upsampler.forward(&xs, upsample_size)?;
        }
        Ok(xs)
    }
}

impl ParamTree for UpBlock2D {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.resnets.visit(&join(prefix, "resnets"), f);
        self.attentions.visit(&join(prefix, "attentions"), f);
        self.upsamplers.visit(&join(prefix, "upsamplers"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.resnets.visit_mut(&join(prefix, "resnets"), f)?;
        self.attentions.visit_mut(&join(prefix, "attentions"), f)?;
        self.upsamplers.visit_mut(&join(prefix, "upsamplers"), f)
    }
}

/// Builds the decoder blocks, mirroring the down blocks.
pub fn build_up_blocks(
    cfg: &TrunkConfig,
    up_block_types: &[UpBlockType],
    pf: &ParamFactory,
) -> Result<Vec<UpBlock2D>> {
    let reversed: Vec<usize> = cfg.block_out_channels.iter().rev().copied().collect();
    let n = reversed.len();
    let mut output_channel = reversed[0];
    let mut blocks = Vec::with_capacity(n);
    for (i, block_type) in up_block_types.iter().enumerate() {
        let prev_output_channel = output_channel;
        output_channel = reversed[i];
        let input_channel = reversed[(i + 1).min(n - 1)];
        // Attention settings come from the mirrored down block.
        let attention = match block_type {
            UpBlockType::CrossAttnUpBlock2D => Some(cfg.attention(n - 1 - i)),
            UpBlockType::UpBlock2D => None,
        };
        blocks.push(UpBlock2D::new(
            cfg,
            input_channel,
            prev_output_channel,
            output_channel,
            i != n - 1,
            attention,
            pf,
        )?);
    }
    Ok(blocks)
}
