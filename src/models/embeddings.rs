//! Timestep, class and addition embeddings of the UNet trunk

use candle_core::{DType, Module, Result, Tensor, D};

use super::config::{AdditionEmbedType, ClassEmbedType, EncoderHidDimType, TrunkConfig};
use super::layers::{Activation, Embedding, Linear, ParamFactory};
use super::params::{join, Layer, LayerMut, ParamTree};
use crate::error::ControlLoraError;

/// Sinusoidal timestep projection. Holds no parameters.
#[derive(Debug, Clone)]
pub struct Timesteps {
    num_channels: usize,
    flip_sin_to_cos: bool,
    downscale_freq_shift: f64,
}

impl Timesteps {
    pub fn new(num_channels: usize, flip_sin_to_cos: bool, downscale_freq_shift: f64) -> Self {
        Self {
            num_channels,
            flip_sin_to_cos,
            downscale_freq_shift,
        }
    }

    /// `timesteps` is 1D; the result is `(len, num_channels)` in f32.
    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let half_dim = self.num_channels / 2;
        let exponent = (Tensor::arange(0u32, half_dim as u32, timesteps.device())?
            .to_dtype(DType::F32)?
            * -f64::ln(10000.))?;
        let exponent = (exponent / (half_dim as f64 - self.downscale_freq_shift))?;
        let freqs = exponent.exp()?.unsqueeze(0)?;
        let emb = timesteps
            .to_dtype(DType::F32)?
            .unsqueeze(1)?
            .broadcast_mul(&freqs)?;
        let (sin, cos) = (emb.sin()?, emb.cos()?);
        let emb = if self.flip_sin_to_cos {
            Tensor::cat(&[&cos, &sin], D::Minus1)?
        } else {
            Tensor::cat(&[&sin, &cos], D::Minus1)?
        };
        if self.num_channels % 2 == 1 {
            emb.pad_with_zeros(D::Minus1, 0, 1)
        } else {
            Ok(emb)
        }
    }
}

impl ParamTree for Timesteps {
    fn visit(&self, _prefix: &str, _f: &mut dyn FnMut(&str, Layer<'_>)) {}

    fn visit_mut(
        &mut self,
        _prefix: &str,
        _f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
    cond_proj: Option<Linear>,
    act: Activation,
}

impl TimestepEmbedding {
    pub fn new(
        in_channels: usize,
        time_embed_dim: usize,
        act: Activation,
        cond_proj_dim: Option<usize>,
        pf: &ParamFactory,
    ) -> Result<Self> {
        let cond_proj = match cond_proj_dim {
            Some(dim) => Some(Linear::new(dim, in_channels, false, pf)?),
            None => None,
        };
        Ok(Self {
            linear_1: Linear::new(in_channels, time_embed_dim, true, pf)?,
            linear_2: Linear::new(time_embed_dim, time_embed_dim, true, pf)?,
            cond_proj,
            act,
        })
    }

    pub fn forward(&self, sample: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        let sample = match (&self.cond_proj, condition) {
            (Some(proj), Some(condition)) => (sample + proj.forward(condition)?)?,
            _ => sample.clone(),
        };
        let xs = self.act.apply(&self.linear_1.forward(&sample)?)?;
        self.linear_2.forward(&xs)
    }
}

impl ParamTree for TimestepEmbedding {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.linear_1.visit(&join(prefix, "linear_1"), f);
        self.linear_2.visit(&join(prefix, "linear_2"), f);
        self.cond_proj.visit(&join(prefix, "cond_proj"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.linear_1.visit_mut(&join(prefix, "linear_1"), f)?;
        self.linear_2.visit_mut(&join(prefix, "linear_2"), f)?;
        self.cond_proj.visit_mut(&join(prefix, "cond_proj"), f)
    }
}

#[derive(Debug, Clone)]
pub enum ClassEmbedding {
    Table(Embedding),
    Timestep(TimestepEmbedding),
    Identity,
    Projection(TimestepEmbedding),
    SimpleProjection(Linear),
}

impl ParamTree for ClassEmbedding {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        match self {
            ClassEmbedding::Table(m) => m.visit(prefix, f),
            ClassEmbedding::Timestep(m) | ClassEmbedding::Projection(m) => m.visit(prefix, f),
            ClassEmbedding::SimpleProjection(m) => m.visit(prefix, f),
            ClassEmbedding::Identity => {}
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        match self {
            ClassEmbedding::Table(m) => m.visit_mut(prefix, f),
            ClassEmbedding::Timestep(m) | ClassEmbedding::Projection(m) => m.visit_mut(prefix, f),
            ClassEmbedding::SimpleProjection(m) => m.visit_mut(prefix, f),
            ClassEmbedding::Identity => Ok(()),
        }
    }
}

/// SDXL micro-conditioning passed next to the text embeddings.
#[derive(Debug, Clone)]
pub struct AddedConditions {
    pub text_embeds: Tensor,
    pub time_ids: Tensor,
}

/// The embedding modules of the trunk.
///
/// Visiting does not add a path segment: the fields appear at the top level
/// of the owning network (`time_proj`, `time_embedding`, ...).
#[derive(Debug, Clone)]
pub struct TrunkEmbeddings {
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    class_embedding: Option<ClassEmbedding>,
    add_time_proj: Option<Timesteps>,
    add_embedding: Option<TimestepEmbedding>,
    encoder_hid_proj: Option<Linear>,
}

impl TrunkEmbeddings {
    pub fn new(cfg: &TrunkConfig, pf: &ParamFactory) -> Result<Self> {
        let timestep_input_dim = cfg.block_out_channels[0];
        let time_embed_dim = cfg.time_embed_dim();

        let class_embedding = match (cfg.class_embed_type, cfg.num_class_embeds) {
            (None, Some(n)) => Some(ClassEmbedding::Table(Embedding::new(n, time_embed_dim, pf)?)),
            (None, None) => None,
            (Some(ClassEmbedType::Timestep), _) => Some(ClassEmbedding::Timestep(
                TimestepEmbedding::new(timestep_input_dim, time_embed_dim, cfg.act_fn, None, pf)?,
            )),
            (Some(ClassEmbedType::Identity), _) => Some(ClassEmbedding::Identity),
            (Some(ClassEmbedType::Projection), _) => {
                let input_dim = required(cfg.projection_class_embeddings_input_dim)?;
                Some(ClassEmbedding::Projection(TimestepEmbedding::new(
                    input_dim,
                    time_embed_dim,
                    cfg.act_fn,
                    None,
                    pf,
                )?))
            }
            (Some(ClassEmbedType::SimpleProjection), _) => {
                let input_dim = required(cfg.projection_class_embeddings_input_dim)?;
                Some(ClassEmbedding::SimpleProjection(Linear::new(
                    input_dim,
                    time_embed_dim,
                    true,
                    pf,
                )?))
            }
        };

        let (add_time_proj, add_embedding) = match cfg.addition_embed_type {
            Some(AdditionEmbedType::TextTime) => {
                let time_dim = required(cfg.addition_time_embed_dim)?;
                let input_dim = required(cfg.projection_class_embeddings_input_dim)?;
                (
                    Some(Timesteps::new(time_dim, cfg.flip_sin_to_cos, cfg.freq_shift)),
                    Some(TimestepEmbedding::new(
                        input_dim,
                        time_embed_dim,
                        cfg.act_fn,
                        None,
                        pf,
                    )?),
                )
            }
            None => (None, None),
        };

        let encoder_hid_proj = match cfg.encoder_hid_dim_type {
            Some(EncoderHidDimType::TextProj) => Some(Linear::new(
                required(cfg.encoder_hid_dim)?,
                cfg.cross_attention_dim,
                true,
                pf,
            )?),
            None => None,
        };

        Ok(Self {
            time_proj: Timesteps::new(timestep_input_dim, cfg.flip_sin_to_cos, cfg.freq_shift),
            time_embedding: TimestepEmbedding::new(
                timestep_input_dim,
                time_embed_dim,
                cfg.act_fn,
                cfg.time_cond_proj_dim,
                pf,
            )?,
            class_embedding,
            add_time_proj,
            add_embedding,
            encoder_hid_proj,
        })
    }

    pub fn has_class_embedding(&self) -> bool {
        self.class_embedding.is_some()
    }

    /// Time embedding `temb` for a batch, in `dtype`.
    pub fn embed(
        &self,
        timestep: &Tensor,
        batch: usize,
        dtype: DType,
        timestep_cond: Option<&Tensor>,
        class_labels: Option<&Tensor>,
        added: Option<&AddedConditions>,
    ) -> crate::Result<Tensor> {
        let timesteps = broadcast_timesteps(timestep, batch)?;
        let t_emb = self.time_proj.forward(&timesteps)?.to_dtype(dtype)?;
        let mut emb = self.time_embedding.forward(&t_emb, timestep_cond)?;

        if let Some(class_embedding) = &self.class_embedding {
            let labels = class_labels.ok_or(ControlLoraError::MissingInput("class_labels"))?;
            let class_emb = match class_embedding {
                ClassEmbedding::Table(table) => table.forward(labels)?,
                ClassEmbedding::Timestep(m) => {
                    let labels = self.time_proj.forward(&labels.flatten_all()?)?.to_dtype(dtype)?;
                    m.forward(&labels, None)?
                }
                ClassEmbedding::Identity => labels.clone(),
                ClassEmbedding::Projection(m) => m.forward(labels, None)?,
                ClassEmbedding::SimpleProjection(m) => m.forward(labels)?,
            };
            emb = (emb + class_emb.to_dtype(dtype)?)?;
        }

        if let (Some(add_time_proj), Some(add_embedding)) = (&self.add_time_proj, &self.add_embedding) {
            let added = added.ok_or(ControlLoraError::MissingInput("added_cond (text_embeds, time_ids)"))?;
            let time_embeds = add_time_proj.forward(&added.time_ids.flatten_all()?)?;
            let time_embeds = time_embeds.reshape((batch, ()))?;
            let add_embeds = Tensor::cat(
                &[added.text_embeds.to_dtype(dtype)?, time_embeds.to_dtype(dtype)?],
                D::Minus1,
            )?;
            emb = (emb + add_embedding.forward(&add_embeds, None)?)?;
        }
        Ok(emb)
    }

    pub fn project_encoder_hidden_states(&self, encoder_hidden_states: &Tensor) -> Result<Tensor> {
        match &self.encoder_hid_proj {
            Some(proj) => proj.forward(encoder_hidden_states),
            None => Ok(encoder_hidden_states.clone()),
        }
    }
}

impl ParamTree for TrunkEmbeddings {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.time_proj.visit(&join(prefix, "time_proj"), f);
        self.time_embedding.visit(&join(prefix, "time_embedding"), f);
        self.class_embedding.visit(&join(prefix, "class_embedding"), f);
        self.add_time_proj.visit(&join(prefix, "add_time_proj"), f);
        self.add_embedding.visit(&join(prefix, "add_embedding"), f);
        self.encoder_hid_proj.visit(&join(prefix, "encoder_hid_proj"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        self.time_proj.visit_mut(&join(prefix, "time_proj"), f)?;
        self.time_embedding.visit_mut(&join(prefix, "time_embedding"), f)?;
        self.class_embedding.visit_mut(&join(prefix, "class_embedding"), f)?;
        self.add_time_proj.visit_mut(&join(prefix, "add_time_proj"), f)?;
        self.add_embedding.visit_mut(&join(prefix, "add_embedding"), f)?;
        self.encoder_hid_proj.visit_mut(&join(prefix, "encoder_hid_proj"), f)
    }
}

fn required<T>(value: Option<T>) -> Result<T> {
    match value {
        Some(v) => Ok(v),
        None => candle_core::bail!("embedding option missing from a validated config"),
    }
}

/// Accepts a scalar, a single-element or a per-sample timestep tensor.
pub fn broadcast_timesteps(timestep: &Tensor, batch: usize) -> Result<Tensor> {
    let timesteps = match timestep.rank() {
        0 => timestep.unsqueeze(0)?,
        1 => timestep.clone(),
        _ => timestep.flatten_all()?,
    };
    match timesteps.dim(0)? {
        n if n == batch => Ok(timesteps),
        1 => timesteps.broadcast_as(batch)?.contiguous(),
        n => candle_core::bail!("got {n} timesteps for a batch of {batch}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_timestep_projection_layout() -> Result<()> {
        let proj = Timesteps::new(8, true, 0.0);
        let t = Tensor::new(&[0f32, 10.0], &Device::Cpu)?;
        let emb = proj.forward(&t)?;
        assert_eq!(emb.dims(), &[2, 8]);
        // flip_sin_to_cos puts cos first: cos(0) = 1, sin(0) = 0.
        let row: Vec<f32> = emb.get(0)?.to_vec1()?;
        assert_eq!(&row[..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&row[4..], &[0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_broadcast_timesteps() -> Result<()> {
        let dev = Device::Cpu;
        let scalar = Tensor::new(5f32, &dev)?;
        assert_eq!(broadcast_timesteps(&scalar, 3)?.to_vec1::<f32>()?, vec![5.0; 3]);
        let per_sample = Tensor::new(&[1f32, 2.0], &dev)?;
        assert_eq!(broadcast_timesteps(&per_sample, 2)?.dims(), &[2]);
        assert!(broadcast_timesteps(&per_sample, 3).is_err());
        Ok(())
    }
}
