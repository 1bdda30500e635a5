//! Lumo Engine
//!
//! On-device inference engine for a small vision-language transformer
//! running on mobile-class GPUs through OpenCL: a memory-mapped GGUF weight
//! container, a BPE tokenizer, a typed kernel-dispatch layer and the
//! transformer driver with KV-cached greedy decoding.

pub mod device;
pub mod dispatch;
pub mod gguf;
pub mod memory;
pub mod model;
pub mod profiler;
pub mod tokenizer;

// Primary public API re-exports
pub use device::{DeviceCaps, Gpu};
pub use gguf::{GgmlType, GgufFile, TensorInfo};
pub use model::{GenerationStats, Model, ModelConfig};
pub use tokenizer::Vocabulary;
