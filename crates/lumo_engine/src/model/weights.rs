//! Weight binding: dual-convention container lookup, GPU upload, and RoPE
//! table materialization.
//!
//! The same logical model ships under at least two tensor-naming schemes, so
//! every slot is resolved through a small candidate table instead of a single
//! hard-coded name. Missing per-layer tensors degrade the layer (the forward
//! pass skips the slot); a missing embedding table or LM head is fatal.

use anyhow::{Context as _, Result};
use half::f16;
use ocl::Buffer;

use crate::device::Gpu;
use crate::gguf::{GgmlType, GgufFile, TensorInfo};
use crate::memory::{self, WeightImage};
use crate::model::ModelConfig;

/// RoPE base frequency.
const ROPE_THETA: f64 = 10000.0;

/// Candidate suffixes per logical slot, tried in order. The first is the
/// Phi/HF spelling, then the generic HF spelling, then the GGUF spelling.
pub const Q_PROJ: &[&str] = &["self_attn.q_proj.weight", "attn.q_proj.weight", "attn_q.weight"];
pub const K_PROJ: &[&str] = &["self_attn.k_proj.weight", "attn.k_proj.weight", "attn_k.weight"];
pub const V_PROJ: &[&str] = &["self_attn.v_proj.weight", "attn.v_proj.weight", "attn_v.weight"];
pub const O_PROJ: &[&str] = &["self_attn.dense.weight", "self_attn.o_proj.weight", "attn_output.weight"];
// Phi packs gate and up into a single fc1; the split spellings follow.
pub const GATE_PROJ: &[&str] = &["mlp.fc1.weight", "mlp.gate_proj.weight", "ffn_gate.weight"];
pub const UP_PROJ: &[&str] = &["mlp.fc1.weight", "mlp.up_proj.weight", "ffn_up.weight"];
pub const DOWN_PROJ: &[&str] = &["mlp.fc2.weight", "mlp.down_proj.weight", "ffn_down.weight"];
pub const INPUT_NORM: &[&str] = &["input_layernorm.weight", "attn_norm.weight"];
pub const POST_NORM: &[&str] = &["post_attention_layernorm.weight", "ffn_norm.weight"];

pub const TOKEN_EMBED: &[&str] = &["embed_tokens.weight", "token_embd.weight"];
pub const FINAL_NORM: &[&str] = &["norm.weight", "output_norm.weight"];
pub const LM_HEAD: &[&str] = &["lm_head.weight", "output.weight"];

const GLOBAL_PREFIXES: [&str; 3] = ["", "model.", "transformer."];

/// Candidate full names for a top-level weight, in lookup order.
pub fn global_candidates(names: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(names.len() * GLOBAL_PREFIXES.len());
    for name in names {
        for prefix in GLOBAL_PREFIXES {
            out.push(format!("{prefix}{name}"));
        }
    }
    out
}

/// Candidate full names for a per-layer weight, in lookup order.
pub fn layer_candidates(layer: usize, suffixes: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(suffixes.len() * 3);
    for s in suffixes {
        out.push(format!("model.layers.{layer}.{s}"));
        out.push(format!("blk.{layer}.{s}"));
        out.push(format!("transformer.h.{layer}.{s}"));
    }
    out
}

pub fn find_global<'a>(gguf: &'a GgufFile, names: &[&str]) -> Option<&'a TensorInfo> {
    global_candidates(names).iter().find_map(|n| gguf.find_tensor(n))
}

pub fn find_layer<'a>(gguf: &'a GgufFile, layer: usize, suffixes: &[&str]) -> Option<&'a TensorInfo> {
    layer_candidates(layer, suffixes).iter().find_map(|n| gguf.find_tensor(n))
}

/// A projection weight on the device. The fast path is the texel-packed
/// image; tensors with an element type the image path cannot hold stay as
/// raw buffers and dispatch through the buffer-operand matmul.
pub enum ProjWeight {
    Image(WeightImage),
    Raw(Buffer<u8>),
}

/// One decoder layer's bindings. A layer is complete iff all nine slots
/// resolved; incomplete layers run degraded.
#[derive(Default)]
pub struct LayerWeights {
    pub q_proj: Option<ProjWeight>,
    pub k_proj: Option<ProjWeight>,
    pub v_proj: Option<ProjWeight>,
    pub o_proj: Option<ProjWeight>,
    pub gate_proj: Option<ProjWeight>,
    pub up_proj: Option<ProjWeight>,
    pub down_proj: Option<ProjWeight>,
    pub input_norm: Option<Buffer<u8>>,
    pub post_norm: Option<Buffer<u8>>,
}

impl LayerWeights {
    pub fn is_complete(&self) -> bool {
        self.q_proj.is_some()
            && self.k_proj.is_some()
            && self.v_proj.is_some()
            && self.o_proj.is_some()
            && self.gate_proj.is_some()
            && self.up_proj.is_some()
            && self.down_proj.is_some()
            && self.input_norm.is_some()
            && self.post_norm.is_some()
    }

    pub fn mlp_complete(&self) -> bool {
        self.gate_proj.is_some() && self.up_proj.is_some() && self.down_proj.is_some()
    }
}

pub struct ModelWeights {
    pub token_embed: Buffer<u8>,
    pub final_norm: Option<Buffer<u8>>,
    pub lm_head: ProjWeight,
    pub layers: Vec<LayerWeights>,
    pub cos_table: Buffer<u16>,
    pub sin_table: Buffer<u16>,
}

/// Reinterpret little-endian tensor bytes as half-float bit patterns.
fn bytes_to_u16(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
}

fn upload_raw(gpu: &Gpu, gguf: &GgufFile, tensor: &TensorInfo) -> Result<Buffer<u8>> {
    memory::create_buffer_with(gpu, ocl::flags::MEM_READ_ONLY, gguf.tensor_data(tensor))
}

/// Upload a 2-D half-float tensor as a weight image; anything else falls back
/// to a raw device buffer.
fn upload_projection(gpu: &Gpu, gguf: &GgufFile, tensor: &TensorInfo) -> Result<ProjWeight> {
    if tensor.dtype != GgmlType::F16 {
        tracing::warn!(
            name = %tensor.name,
            dtype = tensor.dtype.name(),
            "projection weight is not F16, storing as buffer"
        );
        return Ok(ProjWeight::Raw(upload_raw(gpu, gguf, tensor)?));
    }

    let (rows, cols) = if tensor.n_dims == 1 {
        (1, tensor.dims[0] as usize)
    } else {
        (tensor.dims[1] as usize, tensor.dims[0] as usize)
    };
    let halves = bytes_to_u16(gguf.tensor_data(tensor));
    Ok(ProjWeight::Image(memory::create_weight_image(gpu, rows, cols, &halves)?))
}

fn bind_projection(
    gpu: &Gpu,
    gguf: &GgufFile,
    layer: usize,
    suffixes: &[&str],
) -> Result<Option<ProjWeight>> {
    match find_layer(gguf, layer, suffixes) {
        Some(t) => Ok(Some(upload_projection(gpu, gguf, t)?)),
        None => {
            tracing::warn!(layer, slot = suffixes[0], "layer weight not found, slot left unbound");
            Ok(None)
        }
    }
}

fn bind_norm(gpu: &Gpu, gguf: &GgufFile, layer: usize, suffixes: &[&str]) -> Result<Option<Buffer<u8>>> {
    match find_layer(gguf, layer, suffixes) {
        Some(t) => Ok(Some(upload_raw(gpu, gguf, t)?)),
        None => {
            tracing::warn!(layer, slot = suffixes[0], "norm weight not found, slot left unbound");
            Ok(None)
        }
    }
}

/// Materialize the cosine and sine tables: angle(p, i) = p * theta^(-2i/D)
/// for p in [0, max_len) and i in [0, D/2), stored as half floats. Overflow
/// saturates to infinity, underflow flushes to zero.
pub fn build_rope_tables(head_dim: usize, max_len: usize) -> (Vec<u16>, Vec<u16>) {
    let half_dim = head_dim / 2;
    let mut cos_table = Vec::with_capacity(max_len * half_dim);
    let mut sin_table = Vec::with_capacity(max_len * half_dim);
    for pos in 0..max_len {
        for i in 0..half_dim {
            let freq = 1.0 / ROPE_THETA.powf(2.0 * i as f64 / head_dim as f64);
            let angle = pos as f64 * freq;
            cos_table.push(f16_flush_subnormal(angle.cos() as f32));
            sin_table.push(f16_flush_subnormal(angle.sin() as f32));
        }
    }
    (cos_table, sin_table)
}

/// fp32 -> fp16 bits. `f16::from_f32` already saturates overflow to
/// infinity; subnormal results flush to signed zero.
fn f16_flush_subnormal(v: f32) -> u16 {
    let bits = f16::from_f32(v).to_bits();
    if bits & 0x7C00 == 0 {
        bits & 0x8000
    } else {
        bits
    }
}

impl ModelWeights {
    /// Resolve and upload every weight the decoder needs.
    pub fn upload(gpu: &Gpu, gguf: &GgufFile, cfg: &ModelConfig) -> Result<Self> {
        tracing::info!("uploading weights to GPU");

        let embed = find_global(gguf, TOKEN_EMBED).context("token embedding weight not found")?;
        let token_embed = upload_raw(gpu, gguf, embed)?;
        tracing::info!(
            rows = embed.dims[1],
            cols = embed.dims[0],
            mb = format!("{:.1}", embed.byte_size as f64 / (1024.0 * 1024.0)),
            "token embedding"
        );

        let final_norm = match find_global(gguf, FINAL_NORM) {
            Some(t) => Some(upload_raw(gpu, gguf, t)?),
            None => {
                tracing::warn!("final norm weight not found");
                None
            }
        };

        let lm_head_tensor = find_global(gguf, LM_HEAD).context("LM head weight not found")?;
        let lm_head = upload_projection(gpu, gguf, lm_head_tensor)?;

        let mut layers = Vec::with_capacity(cfg.llm_layers);
        let mut complete = 0usize;
        for i in 0..cfg.llm_layers {
            let layer = LayerWeights {
                q_proj: bind_projection(gpu, gguf, i, Q_PROJ)?,
                k_proj: bind_projection(gpu, gguf, i, K_PROJ)?,
                v_proj: bind_projection(gpu, gguf, i, V_PROJ)?,
                o_proj: bind_projection(gpu, gguf, i, O_PROJ)?,
                gate_proj: bind_projection(gpu, gguf, i, GATE_PROJ)?,
                up_proj: bind_projection(gpu, gguf, i, UP_PROJ)?,
                down_proj: bind_projection(gpu, gguf, i, DOWN_PROJ)?,
                input_norm: bind_norm(gpu, gguf, i, INPUT_NORM)?,
                post_norm: bind_norm(gpu, gguf, i, POST_NORM)?,
            };
            if layer.is_complete() {
                complete += 1;
            }
            layers.push(layer);
        }
        tracing::info!(complete, total = cfg.llm_layers, "bound transformer layers");

        let (cos, sin) = build_rope_tables(cfg.head_dim, cfg.max_seq_len);
        let cos_table = memory::create_buffer_with(gpu, ocl::flags::MEM_READ_ONLY, &cos)?;
        let sin_table = memory::create_buffer_with(gpu, ocl::flags::MEM_READ_ONLY, &sin)?;
        tracing::info!(
            positions = cfg.max_seq_len,
            pairs = cfg.head_dim / 2,
            kb = format!("{:.1}", (cos.len() + sin.len()) as f64 * 2.0 / 1024.0),
            "RoPE tables"
        );

        Ok(Self { token_embed, final_norm, lm_head, layers, cos_table, sin_table })
    }
}
