//! ResNet block and the resampling layers used between UNet levels

use candle_core::{Module, Result, Tensor, D};

use super::config::TimeScaleShift;
use super::layers::{conv_config, Activation, Conv2d, Linear, Norm, ParamFactory};
use super::params::{join, Layer, LayerMut, ParamTree};

#[derive(Debug, Clone, Copy)]
pub struct ResnetBlock2DConfig {
    pub out_channels: usize,
    pub temb_channels: Option<usize>,
    pub groups: usize,
    pub eps: f64,
    pub output_scale_factor: f64,
    pub time_scale_shift: TimeScaleShift,
    pub act: Activation,
}

#[derive(Debug, Clone)]
pub struct ResnetBlock2D {
    norm1: Norm,
    conv1: Conv2d,
    time_emb_proj: Option<Linear>,
    norm2: Norm,
    conv2: Conv2d,
    conv_shortcut: Option<Conv2d>,
    config: ResnetBlock2DConfig,
}

impl ResnetBlock2D {
    pub fn new(in_channels: usize, config: ResnetBlock2DConfig, pf: &ParamFactory) -> Result<Self> {
        let out_channels = config.out_channels;
        let time_emb_proj = match config.temb_channels {
            Some(temb) => {
                let proj_out = match config.time_scale_shift {
                    TimeScaleShift::Default => out_channels,
                    TimeScaleShift::ScaleShift => out_channels * 2,
                };
                Some(Linear::new(temb, proj_out, true, pf)?)
            }
            None => None,
        };
        let conv_shortcut = if in_channels != out_channels {
            Some(Conv2d::new(in_channels, out_channels, 1, conv_config(0, 1), true, pf)?)
        } else {
            None
        };
        Ok(Self {
            norm1: Norm::group(config.groups, in_channels, config.eps, pf)?,
            conv1: Conv2d::new(in_channels, out_channels, 3, conv_config(1, 1), true, pf)?,
            time_emb_proj,
            norm2: Norm::group(config.groups, out_channels, config.eps, pf)?,
            conv2: Conv2d::new(out_channels, out_channels, 3, conv_config(1, 1), true, pf)?,
            conv_shortcut,
            config,
        })
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Result<Tensor> {
        let act = self.config.act;
        let hs = self.conv1.forward(&act.apply(&self.norm1.forward(xs)?)?)?;

        let temb = match (&self.time_emb_proj, temb) {
            (Some(proj), Some(temb)) => Some(
                proj.forward(&act.apply(temb)?)?
                    .unsqueeze(D::Minus1)?
                    .unsqueeze(D::Minus1)?,
            ),
            _ => None,
        };
        let hs = match (temb, self.config.time_scale_shift) {
            (Some(temb), TimeScaleShift::Default) => self.norm2.forward(&hs.broadcast_add(&temb)?)?,
            (Some(temb), TimeScaleShift::ScaleShift) => {
                let chunks = temb.chunk(2, 1)?;
                let hs = self.norm2.forward(&hs)?;
                hs.broadcast_mul(&(&chunks[0] + 1.0)?)?
                    .broadcast_add(&chunks[1])?
            }
            (None, _) => self.norm2.forward(&hs)?,
        };
        let hs = self.conv2.forward(&act.apply(&hs)?)?;

        let xs = match &self.conv_shortcut {
            Some(shortcut) => shortcut.forward(xs)?,
            None => xs.clone(),
        };
        (xs + hs)? / self.config.output_scale_factor
    }
}

impl ParamTree for ResnetBlock2D {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.norm1.visit(&join(prefix, "norm1"), f);
        self.conv1.visit(&join(prefix, "conv1"), f);
        self.time_emb_proj.visit(&join(prefix, "time_emb_proj"), f);
        self.norm2.visit(&join(prefix, "norm2"), f);
        self.conv2.visit(&join(prefix, "conv2"), f);
        self.conv_shortcut.visit(&join(prefix, "conv_shortcut"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.norm1.visit_mut(&join(prefix, "norm1"), f)?;
        self.conv1.visit_mut(&join(prefix, "conv1"), f)?;
        self.time_emb_proj.visit_mut(&join(prefix, "time_emb_proj"), f)?;
        self.norm2.visit_mut(&join(prefix, "norm2"), f)?;
        self.conv2.visit_mut(&join(prefix, "conv2"), f)?;
        self.conv_shortcut.visit_mut(&join(prefix, "conv_shortcut"), f)
    }
}

/// Strided 3x3 convolution halving the spatial size.
#[derive(Debug, Clone)]
pub struct Downsample2D {
    conv: Conv2d,
    padding: usize,
}

impl Downsample2D {
    pub fn new(channels: usize, padding: usize, pf: &ParamFactory) -> Result<Self> {
        Ok(Self {
            conv: Conv2d::new(channels, channels, 3, conv_config(padding, 2), true, pf)?,
            padding,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = if self.padding == 0 {
            xs.pad_with_zeros(D::Minus1, 0, 1)?.pad_with_zeros(D::Minus2, 0, 1)?
        } else {
            xs.clone()
        };
        self.conv.forward(&xs)
    }
}

impl ParamTree for Downsample2D {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.conv.visit(&join(prefix, "conv"), f)
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.conv.visit_mut(&join(prefix, "conv"), f)
    }
}

/// Nearest-neighbour upsampling followed by a 3x3 convolution.
#[derive(Debug, Clone)]
pub struct Upsample2D {
    conv: Conv2d,
}

impl Upsample2D {
    pub fn new(channels: usize, pf: &ParamFactory) -> Result<Self> {
        Ok(Self {
            conv: Conv2d::new(channels, channels, 3, conv_config(1, 1), true, pf)?,
        })
    }

    /// `size` overrides the default doubling, for odd-sized skip connections.
    pub fn forward(&self, xs: &Tensor, size: Option<(usize, usize)>) -> Result<Tensor> {
        let (h, w) = match size {
            Some(size) => size,
            None => {
                let (_, _, h, w) = xs.dims4()?;
                (h * 2, w * 2)
            }
        };
        self.conv.forward(&xs.upsample_nearest2d(h, w)?)
    }
}

impl ParamTree for Upsample2D {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.conv.visit(&join(prefix, "conv"), f)
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.conv.visit_mut(&join(prefix, "conv"), f)
    }
}
