pub mod checkpoint;
pub mod config;
pub mod control_lora;
pub mod error;
pub mod models;

// Re-export common types
pub use config::{load_run_config, RunConfig};
pub use control_lora::{
    ControlLoraConfig, ControlLoraModel, FromUnetOptions, SharedSubmodules, SHARED_SUBMODULES,
};
pub use error::{ControlLoraError, Result};
pub use models::{
    ControlNetConfig, ControlNetInput, ControlNetModel, ControlNetOutput, LatentEncoder,
    UNet2DConditionModel, UNetConfig,
};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger at `info`, overridable through `RUST_LOG`.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
