//! safetensors checkpoints with string metadata

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use log::info;
use safetensors::{serialize_to_file, Dtype as SafeDtype, SafeTensors, View};

use crate::error::{ControlLoraError, Result};
use crate::models::params::StateDict;

/// Metadata key holding the model configuration as JSON.
pub const CONFIG_METADATA_KEY: &str = "controllora_config";

/// Host copy of a tensor in safetensors layout.
struct TensorBytes {
    dtype: SafeDtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorBytes {
    fn new(name: &str, tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?.to_device(&Device::Cpu)?;
        let (dtype, data) = match tensor.dtype() {
            DType::F32 => (SafeDtype::F32, bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec()),
            DType::F64 => (SafeDtype::F64, bytemuck::cast_slice(&flat.to_vec1::<f64>()?).to_vec()),
            DType::F16 => (
                SafeDtype::F16,
                bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
            ),
            DType::BF16 => (
                SafeDtype::BF16,
                bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
            ),
            other => {
                return Err(ControlLoraError::Checkpoint(format!(
                    "{name}: cannot store {other:?} tensors"
                )))
            }
        };
        Ok(Self {
            dtype,
            shape: tensor.dims().to_vec(),
            data,
        })
    }
}

impl View for &TensorBytes {
    fn dtype(&self) -> SafeDtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Writes `state` to `path`, together with `metadata`.
pub fn save(state: &StateDict, metadata: HashMap<String, String>, path: &Path) -> Result<()> {
    let views = state
        .iter()
        .map(|(name, tensor)| Ok((name.as_str(), TensorBytes::new(name, tensor)?)))
        .collect::<Result<Vec<_>>>()?;

    let mut metadata = metadata;
    metadata.entry("format".to_string()).or_insert_with(|| "pt".to_string());

    serialize_to_file(
        views.iter().map(|(name, bytes)| (*name, bytes)),
        &Some(metadata),
        path,
    )?;
    info!("Saved {} tensors to {}", state.len(), path.display());
    Ok(())
}

/// Reads every tensor in `path` onto `device`, with the file's metadata.
///
/// Keys come back sorted; safetensors files carry no insertion order.
pub fn load(path: &Path, device: &Device) -> Result<(StateDict, HashMap<String, String>)> {
    let data = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&data)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let mut state: StateDict = candle_core::safetensors::load_buffer(&data, device)?
        .into_iter()
        .collect();
    state.sort_keys();
    info!("Loaded {} tensors from {}", state.len(), path.display());
    Ok((state, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_keeps_values_dtypes_and_metadata() -> Result<()> {
        let dev = Device::Cpu;
        let mut state = StateDict::new();
        state.insert("b.weight".to_string(), Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &dev)?);
        state.insert(
            "a.lora_layer.up.weight".to_string(),
            Tensor::new(&[0.5f32, -1.5], &dev)?.to_dtype(DType::BF16)?,
        );

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt.safetensors");
        let mut metadata = HashMap::new();
        metadata.insert(CONFIG_METADATA_KEY.to_string(), "{}".to_string());
        save(&state, metadata, &path)?;

        let (loaded, metadata) = load(&path, &dev)?;
        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            vec!["a.lora_layer.up.weight", "b.weight"]
        );
        assert_eq!(loaded["a.lora_layer.up.weight"].dtype(), DType::BF16);
        assert_eq!(
            loaded["b.weight"].to_vec2::<f32>()?,
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        assert_eq!(metadata[CONFIG_METADATA_KEY], "{}");
        assert_eq!(metadata["format"], "pt");
        Ok(())
    }

    #[test]
    fn test_integer_tensors_are_rejected() -> Result<()> {
        let mut state = StateDict::new();
        state.insert("ids".to_string(), Tensor::new(&[1u32, 2], &Device::Cpu)?);
        let dir = tempfile::tempdir()?;
        let err = save(&state, HashMap::new(), &dir.path().join("x.safetensors"));
        assert!(matches!(err, Err(ControlLoraError::Checkpoint(_))));
        Ok(())
    }
}
