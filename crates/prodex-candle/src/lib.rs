//! Candle-backed model loading, LoRA training, generation and GGUF export.

pub mod device;
pub mod error;
pub mod export;
pub mod generate;
pub mod lora;
pub mod model;
pub mod train;

pub use device::DeviceProfile;
pub use error::{ExportError, ModelError};
pub use export::{ExportReport, Quantization, export_gguf};
pub use generate::{DEFAULT_SMOKE_INPUT, GenerateOptions, smoke_test};
pub use lora::{LoraLinear, LoraSpec};
pub use model::{LoraLlama, MAX_SEQ_LEN, ModelAssets, ModelConfig};
pub use train::{TrainReport, train, train_on_sequences};
