//! Model implementations for the ControlNet and its base UNet
//!
//! Layers are built on `Var` parameters addressed by diffusers-style dotted
//! paths, see [`params`].

pub mod attention;
pub mod blocks;
pub mod config;
pub mod controlnet;
pub mod embeddings;
pub mod layers;
pub mod params;
pub mod resnet;
pub mod unet;
pub mod vae;

// Re-export key types
pub use controlnet::{ControlNetConfig, ControlNetInput, ControlNetModel, ControlNetOutput};
pub use embeddings::AddedConditions;
pub use layers::{Conv2d, Linear, LoraAdapter, ParamFactory, ADAPTER_MARKER};
pub use params::{LoadReport, ParamTree, StateDict};
pub use unet::{UNet2DConditionModel, UNetConfig, UNetInput};
pub use vae::{ConditioningVae, LatentEncoder};
