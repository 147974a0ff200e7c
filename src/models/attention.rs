//! Cross-attention transformer used inside the UNet blocks

use candle_core::{DType, Module, Result, Tensor, D};

use super::config::AttentionOptions;
use super::layers::{conv_config, Conv2d, Linear, Norm, ParamFactory};
use super::params::{join, Layer, LayerMut, ParamTree};

/// Multi-head attention with separate q/k/v projections.
#[derive(Debug, Clone)]
pub struct Attention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    scale: f64,
    upcast: bool,
}

impl Attention {
    pub fn new(
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        upcast: bool,
        pf: &ParamFactory,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: Linear::new(query_dim, inner_dim, false, pf)?,
            to_k: Linear::new(context_dim, inner_dim, false, pf)?,
            to_v: Linear::new(context_dim, inner_dim, false, pf)?,
            to_out: Linear::new(inner_dim, query_dim, true, pf)?,
            heads,
            scale: 1.0 / (dim_head as f64).sqrt(),
            upcast,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, len, dim) = xs.dims3()?;
        xs.reshape((b, len, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `bias` is an additive `(batch, 1, 1, key_len)` attention bias.
    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>, bias: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(xs);
        let in_dtype = xs.dtype();
        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        let (q, k, v) = if self.upcast {
            (q.to_dtype(DType::F32)?, k.to_dtype(DType::F32)?, v.to_dtype(DType::F32)?)
        } else {
            (q, k, v)
        };
        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let scores = match bias {
            Some(bias) => scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v)?.to_dtype(in_dtype)?;

        let (b, heads, len, dim_head) = out.dims4()?;
        let out = out.transpose(1, 2)?.reshape((b, len, heads * dim_head))?;
        self.to_out.forward(&out)
    }
}

impl ParamTree for Attention {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.to_q.visit(&join(prefix, "to_q"), f);
        self.to_k.visit(&join(prefix, "to_k"), f);
        self.to_v.visit(&join(prefix, "to_v"), f);
        self.to_out.visit(&join(prefix, "to_out.0"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.to_q.visit_mut(&join(prefix, "to_q"), f)?;
        self.to_k.visit_mut(&join(prefix, "to_k"), f)?;
        self.to_v.visit_mut(&join(prefix, "to_v"), f)?;
        self.to_out.visit_mut(&join(prefix, "to_out.0"), f)
    }
}

/// GEGLU feed-forward.
#[derive(Debug, Clone)]
pub struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    pub fn new(dim: usize, pf: &ParamFactory) -> Result<Self> {
        let inner_dim = dim * 4;
        Ok(Self {
            proj_in: Linear::new(dim, inner_dim * 2, true, pf)?,
            proj_out: Linear::new(inner_dim, dim, true, pf)?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hs = self.proj_in.forward(xs)?;
        let chunks = hs.chunk(2, D::Minus1)?;
        let hs = (&chunks[0] * chunks[1].gelu_erf()?)?;
        self.proj_out.forward(&hs)
    }
}

impl ParamTree for FeedForward {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.proj_in.visit(&join(prefix, "net.0.proj"), f);
        self.proj_out.visit(&join(prefix, "net.2"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.proj_in.visit_mut(&join(prefix, "net.0.proj"), f)?;
        self.proj_out.visit_mut(&join(prefix, "net.2"), f)
    }
}

#[derive(Debug, Clone)]
pub struct BasicTransformerBlock {
    norm1: Norm,
    attn1: Attention,
    norm2: Norm,
    attn2: Attention,
    norm3: Norm,
    ff: FeedForward,
    only_cross_attention: bool,
}

impl BasicTransformerBlock {
    pub fn new(dim: usize, opts: &AttentionOptions, pf: &ParamFactory) -> Result<Self> {
        let dim_head = dim / opts.num_heads;
        let attn1_context = if opts.only_cross_attention {
            Some(opts.cross_attention_dim)
        } else {
            None
        };
        Ok(Self {
            norm1: Norm::layer(dim, 1e-5, pf)?,
            attn1: Attention::new(dim, attn1_context, opts.num_heads, dim_head, opts.upcast_attention, pf)?,
            norm2: Norm::layer(dim, 1e-5, pf)?,
            attn2: Attention::new(
                dim,
                Some(opts.cross_attention_dim),
                opts.num_heads,
                dim_head,
                opts.upcast_attention,
                pf,
            )?,
            norm3: Norm::layer(dim, 1e-5, pf)?,
            ff: FeedForward::new(dim, pf)?,
            only_cross_attention: opts.only_cross_attention,
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor, context_bias: Option<&Tensor>) -> Result<Tensor> {
        let hs = self.norm1.forward(xs)?;
        let hs = if self.only_cross_attention {
            self.attn1.forward(&hs, Some(context), context_bias)?
        } else {
            self.attn1.forward(&hs, None, None)?
        };
        let xs = (hs + xs)?;
        let hs = self.attn2.forward(&self.norm2.forward(&xs)?, Some(context), context_bias)?;
        let xs = (hs + xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

impl ParamTree for BasicTransformerBlock {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.norm1.visit(&join(prefix, "norm1"), f);
        self.attn1.visit(&join(prefix, "attn1"), f);
        self.norm2.visit(&join(prefix, "norm2"), f);
        self.attn2.visit(&join(prefix, "attn2"), f);
        self.norm3.visit(&join(prefix, "norm3"), f);
        self.ff.visit(&join(prefix, "ff"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.norm1.visit_mut(&join(prefix, "norm1"), f)?;
        self.attn1.visit_mut(&join(prefix, "attn1"), f)?;
        self.norm2.visit_mut(&join(prefix, "norm2"), f)?;
        self.attn2.visit_mut(&join(prefix, "attn2"), f)?;
        self.norm3.visit_mut(&join(prefix, "norm3"), f)?;
        self.ff.visit_mut(&join(prefix, "ff"), f)
    }
}

#[derive(Debug, Clone)]
enum Projection {
    Linear(Linear),
    Conv(Conv2d),
}

impl Projection {
    fn new(in_dim: usize, out_dim: usize, linear: bool, pf: &ParamFactory) -> Result<Self> {
        if linear {
            Ok(Projection::Linear(Linear::new(in_dim, out_dim, true, pf)?))
        } else {
            Ok(Projection::Conv(Conv2d::new(in_dim, out_dim, 1, conv_config(0, 1), true, pf)?))
        }
    }
}

impl ParamTree for Projection {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        match self {
            Projection::Linear(l) => l.visit(prefix, f),
            Projection::Conv(c) => c.visit(prefix, f),
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        match self {
            Projection::Linear(l) => l.visit_mut(prefix, f),
            Projection::Conv(c) => c.visit_mut(prefix, f),
        }
    }
}

/// Spatial transformer over a `(batch, channels, h, w)` feature map.
#[derive(Debug, Clone)]
pub struct Transformer2DModel {
    norm: Norm,
    proj_in: Projection,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Projection,
}

impl Transformer2DModel {
    pub fn new(channels: usize, opts: &AttentionOptions, pf: &ParamFactory) -> Result<Self> {
        let transformer_blocks = (0..opts.depth)
            .map(|_| BasicTransformerBlock::new(channels, opts, pf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            norm: Norm::group(opts.norm_num_groups, channels, 1e-6, pf)?,
            proj_in: Projection::new(channels, channels, opts.use_linear_projection, pf)?,
            transformer_blocks,
            proj_out: Projection::new(channels, channels, opts.use_linear_projection, pf)?,
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor, context_bias: Option<&Tensor>) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let residual = xs;
        let hs = self.norm.forward(xs)?;
        let mut hs = match &self.proj_in {
            Projection::Linear(proj) => {
                let hs = hs.permute((0, 2, 3, 1))?.reshape((b, h * w, c))?;
                proj.forward(&hs)?
            }
            Projection::Conv(proj) => {
                let hs = proj.forward(&hs)?;
                hs.permute((0, 2, 3, 1))?.reshape((b, h * w, c))?
            }
        };
        for block in &self.transformer_blocks {
            hs = block.forward(&hs, context, context_bias)?;
        }
        let hs = match &self.proj_out {
            Projection::Linear(proj) => proj
                .forward(&hs)?
                .reshape((b, h, w, c))?
                .permute((0, 3, 1, 2))?
                .contiguous()?,
            Projection::Conv(proj) => {
                let hs = hs.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?.contiguous()?;
                proj.forward(&hs)?
            }
        };
        hs + residual
    }
}

impl ParamTree for Transformer2DModel {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.norm.visit(&join(prefix, "norm"), f);
        self.proj_in.visit(&join(prefix, "proj_in"), f);
        self.transformer_blocks.visit(&join(prefix, "transformer_blocks"), f);
        self.proj_out.visit(&join(prefix, "proj_out"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.norm.visit_mut(&join(prefix, "norm"), f)?;
        self.proj_in.visit_mut(&join(prefix, "proj_in"), f)?;
        self.transformer_blocks.visit_mut(&join(prefix, "transformer_blocks"), f)?;
        self.proj_out.visit_mut(&join(prefix, "proj_out"), f)
    }
}

/// Additive attention bias from a `(batch, key_len)` keep-mask.
pub fn attention_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (b, len) = mask.dims2()?;
    mask.to_dtype(dtype)?
        .affine(10000.0, -10000.0)?
        .reshape((b, 1, 1, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::params::state_dict;
    use candle_core::Device;

    fn opts(linear: bool) -> AttentionOptions {
        AttentionOptions {
            num_heads: 2,
            depth: 1,
            cross_attention_dim: 12,
            only_cross_attention: false,
            use_linear_projection: linear,
            upcast_attention: true,
            norm_num_groups: 4,
        }
    }

    #[test]
    fn test_transformer_keeps_feature_map_shape() -> Result<()> {
        let dev = Device::Cpu;
        let pf = ParamFactory::new(&dev, DType::F32);
        let xs = Tensor::randn(0f32, 1f32, (2, 8, 4, 4), &dev)?;
        let context = Tensor::randn(0f32, 1f32, (2, 5, 12), &dev)?;
        for linear in [true, false] {
            let model = Transformer2DModel::new(8, &opts(linear), &pf)?;
            assert_eq!(model.forward(&xs, &context, None)?.dims(), &[2, 8, 4, 4]);
        }
        Ok(())
    }

    #[test]
    fn test_masked_keys_are_ignored() -> Result<()> {
        let dev = Device::Cpu;
        let pf = ParamFactory::new(&dev, DType::F32);
        let attn = Attention::new(8, Some(12), 2, 4, false, &pf)?;
        let xs = Tensor::randn(0f32, 1f32, (1, 3, 8), &dev)?;
        let context = Tensor::randn(0f32, 1f32, (1, 4, 12), &dev)?;
        let mask = Tensor::new(&[[1f32, 1.0, 0.0, 0.0]], &dev)?;
        let bias = attention_bias(&mask, DType::F32)?;

        let masked = attn.forward(&xs, Some(&context), Some(&bias))?;
        let truncated = attn.forward(&xs, Some(&context.narrow(1, 0, 2)?), None)?;
        let diff = (masked - truncated)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_diffusers_parameter_names() -> Result<()> {
        let pf = ParamFactory::new(&Device::Cpu, DType::F32);
        let block = BasicTransformerBlock::new(8, &opts(true), &pf)?;
        let keys: Vec<String> = state_dict(&block).into_keys().collect();
        assert!(keys.contains(&"attn1.to_out.0.weight".to_string()));
        assert!(keys.contains(&"ff.net.0.proj.weight".to_string()));
        assert!(keys.contains(&"ff.net.2.bias".to_string()));
        assert!(!keys.contains(&"attn1.to_q.bias".to_string()));
        Ok(())
    }
}
