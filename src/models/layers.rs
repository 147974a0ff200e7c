//! Weight-bearing layers backed by `Var` handles
//!
//! Every convolution and linear layer here can carry one low-rank adapter.
//! Parameters are `Var`s so that two models can share the same storage by
//! cloning the handle.

use candle_core::{DType, Device, Module, Result, Shape, Tensor, Var};
use candle_nn::Conv2dConfig;
use log::debug;
use serde::{Deserialize, Serialize};

use super::params::{Layer, LayerMut, ParamTree};

/// Segment that marks adapter parameters in a dotted path.
pub const ADAPTER_MARKER: &str = "lora_layer";

/// Creates parameters on a fixed device and dtype.
#[derive(Debug, Clone)]
pub struct ParamFactory {
    device: Device,
    dtype: DType,
}

impl ParamFactory {
    pub fn new(device: &Device, dtype: DType) -> Self {
        Self {
            device: device.clone(),
            dtype,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn kaiming<S: Into<Shape>>(&self, shape: S) -> Result<Var> {
        candle_nn::init::DEFAULT_KAIMING_NORMAL.var(shape, self.dtype, &self.device)
    }

    pub fn zeros<S: Into<Shape>>(&self, shape: S) -> Result<Var> {
        Var::zeros(shape, self.dtype, &self.device)
    }

    pub fn ones<S: Into<Shape>>(&self, shape: S) -> Result<Var> {
        Var::ones(shape, self.dtype, &self.device)
    }

    pub fn normal<S: Into<Shape>>(&self, shape: S, std: f64) -> Result<Var> {
        let tensor = Tensor::randn(0f32, std as f32, shape, &self.device)?.to_dtype(self.dtype)?;
        Var::from_tensor(&tensor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    #[serde(alias = "swish")]
    Silu,
    Gelu,
    Relu,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Silu => candle_nn::ops::silu(xs),
            Activation::Gelu => xs.gelu_erf(),
            Activation::Relu => xs.relu(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AdapterKind {
    Linear,
    Conv2d {
        padding: usize,
        stride: usize,
        dilation: usize,
    },
}

/// Low-rank correction `up(down(x))` for one layer.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    down: Var,
    up: Var,
    rank: usize,
    kind: AdapterKind,
}

impl LoraAdapter {
    pub fn linear(
        in_features: usize,
        out_features: usize,
        rank: usize,
        pf: &ParamFactory,
    ) -> Result<Self> {
        if rank == 0 {
            candle_core::bail!("adapter rank must be positive")
        }
        Ok(Self {
            down: pf.normal((rank, in_features), 1.0 / rank as f64)?,
            up: pf.zeros((out_features, rank))?,
            rank,
            kind: AdapterKind::Linear,
        })
    }

    pub fn conv2d(
        in_channels: usize,
        out_channels: usize,
        rank: usize,
        kernel_size: (usize, usize),
        config: &Conv2dConfig,
        pf: &ParamFactory,
    ) -> Result<Self> {
        if rank == 0 {
            candle_core::bail!("adapter rank must be positive")
        }
        let (kh, kw) = kernel_size;
        Ok(Self {
            down: pf.normal((rank, in_channels, kh, kw), 1.0 / rank as f64)?,
            up: pf.zeros((out_channels, rank, 1, 1))?,
            rank,
            kind: AdapterKind::Conv2d {
                padding: config.padding,
                stride: config.stride,
                dilation: config.dilation,
            },
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn down(&self) -> &Var {
        &self.down
    }

    pub fn up(&self) -> &Var {
        &self.up
    }

    /// Adds the adapter output to `base`, computed in the adapter's dtype.
    fn apply(&self, xs: &Tensor, base: Tensor) -> Result<Tensor> {
        let orig_dtype = xs.dtype();
        let xs = xs.to_dtype(self.down.dtype())?;
        let delta = match self.kind {
            AdapterKind::Linear => {
                let hidden = candle_nn::Linear::new(self.down.as_tensor().clone(), None).forward(&xs)?;
                candle_nn::Linear::new(self.up.as_tensor().clone(), None).forward(&hidden)?
            }
            AdapterKind::Conv2d {
                padding,
                stride,
                dilation,
            } => {
                let hidden = xs.conv2d(self.down.as_tensor(), padding, stride, dilation, 1)?;
                hidden.conv2d(self.up.as_tensor(), 0, 1, 1, 1)?
            }
        };
        base + delta.to_dtype(orig_dtype)?
    }
}

fn push_adapter_params<'a>(out: &mut Vec<(&'static str, &'a Var)>, adapter: &'a Option<LoraAdapter>) {
    if let Some(a) = adapter {
        out.push(("lora_layer.down.weight", &a.down));
        out.push(("lora_layer.up.weight", &a.up));
    }
}

fn push_adapter_params_mut<'a>(
    out: &mut Vec<(&'static str, &'a mut Var)>,
    adapter: &'a mut Option<LoraAdapter>,
) {
    if let Some(a) = adapter {
        out.push(("lora_layer.down.weight", &mut a.down));
        out.push(("lora_layer.up.weight", &mut a.up));
    }
}

/// 2D convolution with an optional adapter slot.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Var,
    bias: Option<Var>,
    config: Conv2dConfig,
    adapter: Option<LoraAdapter>,
    adapter_removable: bool,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        bias: bool,
        pf: &ParamFactory,
    ) -> Result<Self> {
        let weight = pf.kaiming((
            out_channels,
            in_channels / config.groups,
            kernel_size,
            kernel_size,
        ))?;
        let bias = if bias { Some(pf.zeros(out_channels)?) } else { None };
        Ok(Self {
            weight,
            bias,
            config,
            adapter: None,
            adapter_removable: true,
        })
    }

    /// Zero-initialised convolution, the ControlNet "zero conv".
    pub fn zeroed(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        pf: &ParamFactory,
    ) -> Result<Self> {
        Ok(Self {
            weight: pf.zeros((
                out_channels,
                in_channels / config.groups,
                kernel_size,
                kernel_size,
            ))?,
            bias: Some(pf.zeros(out_channels)?),
            config,
            adapter: None,
            adapter_removable: true,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1] * self.config.groups
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        let dims = self.weight.dims();
        (dims[2], dims[3])
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    pub fn adapter_removable(&self) -> bool {
        self.adapter_removable
    }

    pub fn set_adapter_removable(&mut self, removable: bool) {
        self.adapter_removable = removable;
    }

    /// `None` clears the adapter, which is ignored on non-removable layers.
    pub fn set_adapter(&mut self, adapter: Option<LoraAdapter>) {
        match adapter {
            Some(adapter) => self.adapter = Some(adapter),
            None => self.clear_adapter(),
        }
    }

    pub fn clear_adapter(&mut self) {
        if !self.adapter_removable {
            debug!("ignoring adapter removal on a non-removable conv layer");
            return;
        }
        self.adapter = None;
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, &Var)> {
        let mut out = vec![("weight", &self.weight)];
        if let Some(b) = &self.bias {
            out.push(("bias", b));
        }
        push_adapter_params(&mut out, &self.adapter);
        out
    }

    pub(crate) fn params_mut(&mut self) -> Vec<(&'static str, &mut Var)> {
        let mut out = vec![("weight", &mut self.weight)];
        if let Some(b) = &mut self.bias {
            out.push(("bias", b));
        }
        push_adapter_params_mut(&mut out, &mut self.adapter);
        out
    }
}

impl Module for Conv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.conv2d(
            self.weight.as_tensor(),
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        let ys = match &self.bias {
            Some(bias) => {
                let bias = bias.as_tensor().reshape((1, bias.dims()[0], 1, 1))?;
                ys.broadcast_add(&bias)?
            }
            None => ys,
        };
        match &self.adapter {
            Some(adapter) => adapter.apply(xs, ys),
            None => Ok(ys),
        }
    }
}

impl ParamTree for Conv2d {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        f(prefix, Layer::Conv2d(self))
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        f(prefix, LayerMut::Conv2d(self))
    }
}

/// Affine layer with an optional adapter slot.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Var,
    bias: Option<Var>,
    adapter: Option<LoraAdapter>,
    adapter_removable: bool,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, bias: bool, pf: &ParamFactory) -> Result<Self> {
        let weight = pf.kaiming((out_features, in_features))?;
        let bias = if bias { Some(pf.zeros(out_features)?) } else { None };
        Ok(Self {
            weight,
            bias,
            adapter: None,
            adapter_removable: true,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    pub fn adapter_removable(&self) -> bool {
        self.adapter_removable
    }

    pub fn set_adapter_removable(&mut self, removable: bool) {
        self.adapter_removable = removable;
    }

    /// `None` clears the adapter, which is ignored on non-removable layers.
    pub fn set_adapter(&mut self, adapter: Option<LoraAdapter>) {
        match adapter {
            Some(adapter) => self.adapter = Some(adapter),
            None => self.clear_adapter(),
        }
    }

    pub fn clear_adapter(&mut self) {
        if !self.adapter_removable {
            debug!("ignoring adapter removal on a non-removable linear layer");
            return;
        }
        self.adapter = None;
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, &Var)> {
        let mut out = vec![("weight", &self.weight)];
        if let Some(b) = &self.bias {
            out.push(("bias", b));
        }
        push_adapter_params(&mut out, &self.adapter);
        out
    }

    pub(crate) fn params_mut(&mut self) -> Vec<(&'static str, &mut Var)> {
        let mut out = vec![("weight", &mut self.weight)];
        if let Some(b) = &mut self.bias {
            out.push(("bias", b));
        }
        push_adapter_params_mut(&mut out, &mut self.adapter);
        out
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let base = candle_nn::Linear::new(
            self.weight.as_tensor().clone(),
            self.bias.as_ref().map(|b| b.as_tensor().clone()),
        );
        let ys = base.forward(xs)?;
        match &self.adapter {
            Some(adapter) => adapter.apply(xs, ys),
            None => Ok(ys),
        }
    }
}

impl ParamTree for Linear {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        f(prefix, Layer::Linear(self))
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        f(prefix, LayerMut::Linear(self))
    }
}

#[derive(Debug, Clone, Copy)]
enum NormKind {
    Group(usize),
    Layer,
}

/// Group or layer normalisation with affine parameters.
#[derive(Debug, Clone)]
pub struct Norm {
    weight: Var,
    bias: Var,
    kind: NormKind,
    eps: f64,
}

impl Norm {
    pub fn group(num_groups: usize, num_channels: usize, eps: f64, pf: &ParamFactory) -> Result<Self> {
        if num_groups == 0 || num_channels % num_groups != 0 {
            candle_core::bail!("{num_channels} channels cannot be split into {num_groups} groups")
        }
        Ok(Self {
            weight: pf.ones(num_channels)?,
            bias: pf.zeros(num_channels)?,
            kind: NormKind::Group(num_groups),
            eps,
        })
    }

    pub fn layer(dim: usize, eps: f64, pf: &ParamFactory) -> Result<Self> {
        Ok(Self {
            weight: pf.ones(dim)?,
            bias: pf.zeros(dim)?,
            kind: NormKind::Layer,
            eps,
        })
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, &Var)> {
        vec![("weight", &self.weight), ("bias", &self.bias)]
    }

    pub(crate) fn params_mut(&mut self) -> Vec<(&'static str, &mut Var)> {
        vec![("weight", &mut self.weight), ("bias", &mut self.bias)]
    }
}

impl Module for Norm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let weight = self.weight.as_tensor().clone();
        let bias = self.bias.as_tensor().clone();
        match self.kind {
            NormKind::Group(groups) => {
                let channels = weight.dims()[0];
                candle_nn::GroupNorm::new(weight, bias, channels, groups, self.eps)?.forward(xs)
            }
            NormKind::Layer => candle_nn::LayerNorm::new(weight, bias, self.eps).forward(xs),
        }
    }
}

impl ParamTree for Norm {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        f(prefix, Layer::Norm(self))
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        f(prefix, LayerMut::Norm(self))
    }
}

/// Lookup table, used for learned class embeddings.
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Var,
}

impl Embedding {
    pub fn new(num_embeddings: usize, dim: usize, pf: &ParamFactory) -> Result<Self> {
        Ok(Self {
            weight: pf.normal((num_embeddings, dim), 1.0)?,
        })
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, &Var)> {
        vec![("weight", &self.weight)]
    }

    pub(crate) fn params_mut(&mut self) -> Vec<(&'static str, &mut Var)> {
        vec![("weight", &mut self.weight)]
    }
}

impl Module for Embedding {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let dim = self.weight.dims()[1];
        candle_nn::Embedding::new(self.weight.as_tensor().clone(), dim).forward(ids)
    }
}

impl ParamTree for Embedding {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        f(prefix, Layer::Embedding(self))
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        f(prefix, LayerMut::Embedding(self))
    }
}

/// Shorthand for a conv config with the given padding and stride.
pub fn conv_config(padding: usize, stride: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ParamFactory {
        ParamFactory::new(&Device::Cpu, DType::F32)
    }

    #[test]
    fn test_fresh_linear_adapter_is_identity() -> Result<()> {
        let pf = factory();
        let mut layer = Linear::new(8, 6, true, &pf)?;
        let xs = Tensor::randn(0f32, 1f32, (2, 3, 8), &Device::Cpu)?;
        let plain = layer.forward(&xs)?;

        layer.set_adapter(Some(LoraAdapter::linear(8, 6, 4, &pf)?));
        let adapted = layer.forward(&xs)?;
        let diff = (plain - adapted)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        let adapter = layer.adapter().unwrap();
        assert_eq!(adapter.down().dims(), &[4, 8]);
        assert_eq!(adapter.up().dims(), &[6, 4]);
        assert_eq!(adapter.scale(), 1.0);
        Ok(())
    }

    #[test]
    fn test_conv_adapter_matches_wrapped_geometry() -> Result<()> {
        let pf = factory();
        let mut conv = Conv2d::new(4, 8, 3, conv_config(1, 2), true, &pf)?;
        let adapter = LoraAdapter::conv2d(
            conv.in_channels(),
            conv.out_channels(),
            2,
            conv.kernel_size(),
            conv.config(),
            &pf,
        )?;
        conv.set_adapter(Some(adapter));
        let adapter = conv.adapter().unwrap();
        assert_eq!(adapter.down().dims(), &[2, 4, 3, 3]);
        assert_eq!(adapter.up().dims(), &[8, 2, 1, 1]);

        // Non-zero up projection must change the output with the same geometry.
        let xs = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &Device::Cpu)?;
        let before = conv.forward(&xs)?;
        adapter.up().set(&Tensor::ones((8, 2, 1, 1), DType::F32, &Device::Cpu)?)?;
        let after = conv.forward(&xs)?;
        assert_eq!(before.dims(), &[1, 8, 4, 4]);
        assert_eq!(after.dims(), before.dims());
        let diff = (after - before)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn test_clear_adapter_respects_removable_flag() -> Result<()> {
        let pf = factory();
        let mut layer = Linear::new(4, 4, false, &pf)?;
        layer.set_adapter(Some(LoraAdapter::linear(4, 4, 2, &pf)?));
        layer.set_adapter_removable(false);
        layer.set_adapter(None);
        assert!(layer.adapter().is_some());

        layer.set_adapter_removable(true);
        layer.clear_adapter();
        assert!(layer.adapter().is_none());
        Ok(())
    }

    #[test]
    fn test_zero_rank_adapter_is_rejected() {
        assert!(LoraAdapter::linear(4, 4, 0, &factory()).is_err());
        assert!(LoraAdapter::linear(4, 4, 1, &factory()).is_ok());
    }

    #[test]
    fn test_activation_names_from_config() -> crate::Result<()> {
        let act: Activation = serde_json::from_str("\"relu\"")?;
        assert_eq!(act, Activation::Relu);
        let swish: Activation = serde_json::from_str("\"swish\"")?;
        assert_eq!(swish, Activation::Silu);

        let xs = Tensor::new(&[-1f32, 0.5], &Device::Cpu)?;
        assert_eq!(act.apply(&xs)?.to_vec1::<f32>()?, vec![0.0, 0.5]);
        Ok(())
    }

    #[test]
    fn test_group_norm_rejects_bad_groups() {
        assert!(Norm::group(32, 48, 1e-5, &factory()).is_err());
        assert!(Norm::group(32, 64, 1e-5, &factory()).is_ok());
    }
}
