//! Dotted-path parameter tree shared by every model in the crate
//!
//! Models expose their leaf layers through [`ParamTree`]; paths follow the
//! diffusers naming, e.g. `down_blocks.0.attentions.0.proj_in.weight`.
//! Saving, loading, tying and adapter installation are all walks over this
//! tree.

use std::collections::HashSet;

use candle_core::{Tensor, Var};
use indexmap::IndexMap;
use log::warn;

use super::layers::{Conv2d, Embedding, Linear, Norm, ADAPTER_MARKER};
use crate::error::{ControlLoraError, Result};

/// Ordered mapping from dotted parameter path to tensor.
pub type StateDict = IndexMap<String, Tensor>;

#[derive(Clone, Copy)]
pub enum Layer<'a> {
    Conv2d(&'a Conv2d),
    Linear(&'a Linear),
    Norm(&'a Norm),
    Embedding(&'a Embedding),
}

impl<'a> Layer<'a> {
    pub fn params(self) -> Vec<(&'static str, &'a Var)> {
        match self {
            Layer::Conv2d(l) => l.params(),
            Layer::Linear(l) => l.params(),
            Layer::Norm(l) => l.params(),
            Layer::Embedding(l) => l.params(),
        }
    }
}

pub enum LayerMut<'a> {
    Conv2d(&'a mut Conv2d),
    Linear(&'a mut Linear),
    Norm(&'a mut Norm),
    Embedding(&'a mut Embedding),
}

impl<'a> LayerMut<'a> {
    pub fn params_mut(self) -> Vec<(&'static str, &'a mut Var)> {
        match self {
            LayerMut::Conv2d(l) => l.params_mut(),
            LayerMut::Linear(l) => l.params_mut(),
            LayerMut::Norm(l) => l.params_mut(),
            LayerMut::Embedding(l) => l.params_mut(),
        }
    }
}

/// A module that can enumerate its leaf layers under a path prefix.
pub trait ParamTree {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>));

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()>;
}

impl<T: ParamTree> ParamTree for Vec<T> {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        for (i, module) in self.iter().enumerate() {
            module.visit(&join(prefix, &i.to_string()), f);
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()> {
        for (i, module) in self.iter_mut().enumerate() {
            module.visit_mut(&join(prefix, &i.to_string()), f)?;
        }
        Ok(())
    }
}

impl<T: ParamTree> ParamTree for Option<T> {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        if let Some(module) = self {
            module.visit(prefix, f)
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()> {
        match self {
            Some(module) => module.visit_mut(prefix, f),
            None => Ok(()),
        }
    }
}

pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// First segment of a dotted path.
pub fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

pub fn is_adapter_path(path: &str) -> bool {
    path.split('.').any(|segment| segment == ADAPTER_MARKER)
}

/// Every parameter handle in visiting order.
pub fn named_parameters<T: ParamTree + ?Sized>(tree: &T) -> IndexMap<String, Var> {
    let mut out = IndexMap::new();
    tree.visit("", &mut |path, layer| {
        for (name, var) in layer.params() {
            out.insert(join(path, name), var.clone());
        }
    });
    out
}

pub fn state_dict<T: ParamTree + ?Sized>(tree: &T) -> StateDict {
    named_parameters(tree)
        .into_iter()
        .map(|(path, var)| (path, var.as_tensor().clone()))
        .collect()
}

pub fn for_each_param_mut<T, F>(tree: &mut T, mut f: F) -> Result<()>
where
    T: ParamTree + ?Sized,
    F: FnMut(&str, &mut Var) -> Result<()>,
{
    tree.visit_mut("", &mut |path, layer| {
        for (name, var) in layer.params_mut() {
            f(&join(path, name), var)?;
        }
        Ok(())
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// Copies tensors into the matching parameters in place.
///
/// Tied parameters keep their shared storage. With `strict`, any missing or
/// unexpected key is an error; shape differences are always an error.
pub fn load_state_dict<T: ParamTree + ?Sized>(
    tree: &mut T,
    state: &StateDict,
    strict: bool,
) -> Result<LoadReport> {
    let mut seen = HashSet::new();
    let mut missing_keys = Vec::new();
    for_each_param_mut(tree, |path, var| {
        let Some(src) = state.get(path) else {
            missing_keys.push(path.to_string());
            return Ok(());
        };
        seen.insert(path.to_string());
        assign(path, var, src)
    })?;

    let unexpected_keys: Vec<String> = state
        .keys()
        .filter(|k| !seen.contains(k.as_str()))
        .cloned()
        .collect();
    let report = LoadReport {
        missing_keys,
        unexpected_keys,
    };
    if !report.is_clean() {
        if strict {
            return Err(ControlLoraError::StateDict {
                missing: report.missing_keys,
                unexpected: report.unexpected_keys,
            });
        }
        warn!(
            "non-strict load: {} missing, {} unexpected keys",
            report.missing_keys.len(),
            report.unexpected_keys.len()
        );
    }
    Ok(report)
}

fn assign(path: &str, var: &mut Var, src: &Tensor) -> Result<()> {
    // Back-filled entries are the parameter itself.
    if var.as_tensor().id() == src.id() {
        return Ok(());
    }
    if var.shape() != src.shape() {
        return Err(ControlLoraError::ShapeMismatch {
            path: path.to_string(),
            expected: var.shape().clone(),
            actual: src.shape().clone(),
        });
    }
    let src = src.to_device(var.device())?.to_dtype(var.dtype())?;
    var.set(&src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::layers::{conv_config, ParamFactory};
    use candle_core::{DType, Device};

    struct Toy {
        conv_in: Conv2d,
        blocks: Vec<Linear>,
        head: Option<Linear>,
    }

    impl ParamTree for Toy {
        fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
            self.conv_in.visit(&join(prefix, "conv_in"), f);
            self.blocks.visit(&join(prefix, "blocks"), f);
            self.head.visit(&join(prefix, "head"), f);
        }

        fn visit_mut(
            &mut self,
            prefix: &str,
            f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
        ) -> Result<()> {
            self.conv_in.visit_mut(&join(prefix, "conv_in"), f)?;
            self.blocks.visit_mut(&join(prefix, "blocks"), f)?;
            self.head.visit_mut(&join(prefix, "head"), f)
        }
    }

    fn toy() -> Result<Toy> {
        let pf = ParamFactory::new(&Device::Cpu, DType::F32);
        Ok(Toy {
            conv_in: Conv2d::new(3, 4, 3, conv_config(1, 1), true, &pf)?,
            blocks: vec![Linear::new(4, 4, false, &pf)?, Linear::new(4, 2, true, &pf)?],
            head: None,
        })
    }

    #[test]
    fn test_paths_follow_visit_order() -> Result<()> {
        let keys: Vec<String> = state_dict(&toy()?).into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "conv_in.weight",
                "conv_in.bias",
                "blocks.0.weight",
                "blocks.1.weight",
                "blocks.1.bias",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("", "conv_in"), "conv_in");
        assert_eq!(join("down_blocks.0", "resnets"), "down_blocks.0.resnets");
        assert_eq!(top_level("mid_block.resnets.0.conv1.weight"), "mid_block");
        assert!(is_adapter_path("conv_in.lora_layer.up.weight"));
        assert!(!is_adapter_path("conv_in.lora_layer_x.weight"));
    }

    #[test]
    fn test_load_copies_in_place_and_reports() -> Result<()> {
        let mut model = toy()?;
        let handle = named_parameters(&model)["blocks.0.weight"].clone();

        let mut state = StateDict::new();
        state.insert(
            "blocks.0.weight".to_string(),
            Tensor::ones((4, 4), DType::F32, &Device::Cpu)?,
        );
        state.insert(
            "blocks.7.weight".to_string(),
            Tensor::ones((4, 4), DType::F32, &Device::Cpu)?,
        );

        let report = load_state_dict(&mut model, &state, false)?;
        assert_eq!(report.unexpected_keys, vec!["blocks.7.weight".to_string()]);
        assert_eq!(report.missing_keys.len(), 4);
        // Same handle, new values.
        assert_eq!(handle.as_tensor().sum_all()?.to_scalar::<f32>()?, 16.0);

        assert!(matches!(
            load_state_dict(&mut model, &state, true),
            Err(ControlLoraError::StateDict { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_load_rejects_shape_mismatch() -> Result<()> {
        let mut model = toy()?;
        let mut state = state_dict(&model);
        state.insert(
            "blocks.1.bias".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu)?,
        );
        assert!(matches!(
            load_state_dict(&mut model, &state, true),
            Err(ControlLoraError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
