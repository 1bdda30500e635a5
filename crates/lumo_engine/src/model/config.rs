//! Frozen architecture constants for the Moondream2-class model.

/// Architecture description: a SigLIP-style vision encoder feeding a
/// Phi-1.5-style causal decoder.
#[derive(Clone, Copy, Debug)]
pub struct ModelConfig {
    // Vision encoder
    pub image_size: usize,
    pub patch_size: usize,
    pub vision_layers: usize,
    pub vision_dim: usize,
    pub vision_heads: usize,
    pub num_patches: usize,

    // Projection into the language model
    pub proj_dim: usize,

    // Language model
    pub vocab_size: usize,
    pub llm_layers: usize,
    pub llm_dim: usize,
    pub llm_heads: usize,
    pub head_dim: usize,
    pub llm_intermediate: usize,
    pub max_seq_len: usize,
}

impl ModelConfig {
    pub fn moondream2() -> Self {
        let image_size = 378;
        let patch_size = 14;
        let llm_dim = 2048;
        let llm_heads = 32;
        Self {
            image_size,
            patch_size,
            vision_layers: 27,
            vision_dim: 1152,
            vision_heads: 16,
            num_patches: (image_size / patch_size) * (image_size / patch_size),
            proj_dim: 2048,
            vocab_size: 51200,
            llm_layers: 24,
            llm_dim,
            llm_heads,
            head_dim: llm_dim / llm_heads,
            llm_intermediate: 8192,
            max_seq_len: 2048,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::moondream2()
    }
}
