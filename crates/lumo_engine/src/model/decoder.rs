//! Model driver: kernel program builds, the transformer forward pass, and
//! the greedy prefill + decode generation loop.

use std::io::Write as _;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use half::f16;
use ocl::{Buffer, Program};

use crate::device::Gpu;
use crate::dispatch;
use crate::gguf::GgufFile;
use crate::memory;
use crate::model::kv_cache::KvCache;
use crate::model::weights::{ModelWeights, ProjWeight};
use crate::model::ModelConfig;
use crate::tokenizer::Vocabulary;

const RMS_NORM_EPS: f32 = 1e-5;

/// Prompt encodings are capped here regardless of context length.
const MAX_PROMPT_TOKENS: usize = 2048;

/// One compiled program per operator family.
pub struct Programs {
    pub gemm: Program,
    pub attention: Program,
    pub norm: Program,
    pub activation: Program,
    pub rope: Program,
    pub embedding: Program,
    pub vision: Program,
}

impl Programs {
    fn build(gpu: &Gpu, kernel_dir: &Path) -> Result<Self> {
        let load = |file: &str| gpu.build_program_from_file(kernel_dir.join(file), "");
        Ok(Self {
            gemm: load("gemm.cl")?,
            attention: load("attention.cl")?,
            norm: load("layernorm.cl")?,
            activation: load("activations.cl")?,
            rope: load("rope.cl")?,
            embedding: load("embedding.cl")?,
            vision: load("vision.cl")?,
        })
    }
}

/// End-to-end timing for one generation call.
#[derive(Clone, Copy, Debug)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated: usize,
    pub prefill_ms: f64,
    pub decode_ms: f64,
}

impl GenerationStats {
    pub fn decode_tokens_per_sec(&self) -> f64 {
        if self.generated == 0 || self.decode_ms <= 0.0 {
            0.0
        } else {
            self.generated as f64 / (self.decode_ms / 1000.0)
        }
    }
}

/// The assembled model: container, compiled programs, device weights,
/// KV-cache and scratch. Borrows the device for every call; owns the rest.
pub struct Model {
    pub config: ModelConfig,
    container: GgufFile,
    programs: Programs,
    weights: ModelWeights,
    kv_cache: KvCache,
    scratch_a: Buffer<u16>,
    scratch_b: Buffer<u16>,
    scratch_q: Buffer<u16>,
    scratch_k: Buffer<u16>,
    scratch_v: Buffer<u16>,
    scratch_attn: Buffer<u16>,
    scratch_gate: Buffer<u16>,
    scratch_up: Buffer<u16>,
}

impl Model {
    /// Open the container, build all kernel programs, upload weights,
    /// materialize RoPE tables and allocate scratch plus the KV-cache.
    pub fn load(gpu: &Gpu, model_path: impl AsRef<Path>, kernel_dir: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let kernel_dir = kernel_dir.as_ref();

        tracing::info!(path = ?model_path, "loading model container");
        let container = GgufFile::open(model_path)?;
        container.log_tensor_table();

        tracing::info!(dir = ?kernel_dir, "building kernel programs");
        let programs = Programs::build(gpu, kernel_dir)?;

        let config = ModelConfig::moondream2();
        tracing::info!(
            vision_layers = config.vision_layers,
            vision_dim = config.vision_dim,
            llm_layers = config.llm_layers,
            llm_dim = config.llm_dim,
            llm_heads = config.llm_heads,
            vocab = config.vocab_size,
            max_seq = config.max_seq_len,
            "model configuration"
        );

        let weights = ModelWeights::upload(gpu, &container, &config)?;
        let kv_cache = KvCache::new(gpu, config.max_seq_len, config.llm_heads, config.head_dim)?;

        let act_len = config.max_seq_len * config.llm_dim;
        let mlp_len = config.max_seq_len * config.llm_intermediate;
        let rw = ocl::flags::MEM_READ_WRITE;
        let model = Self {
            scratch_a: memory::create_buffer(gpu, act_len, rw)?,
            scratch_b: memory::create_buffer(gpu, act_len, rw)?,
            scratch_q: memory::create_buffer(gpu, act_len, rw)?,
            scratch_k: memory::create_buffer(gpu, act_len, rw)?,
            scratch_v: memory::create_buffer(gpu, act_len, rw)?,
            scratch_attn: memory::create_buffer(gpu, act_len, rw)?,
            scratch_gate: memory::create_buffer(gpu, mlp_len, rw)?,
            scratch_up: memory::create_buffer(gpu, mlp_len, rw)?,
            config,
            container,
            programs,
            weights,
            kv_cache,
        };
        tracing::info!("model ready for inference");
        Ok(model)
    }

    pub fn container(&self) -> &GgufFile {
        &self.container
    }

    pub fn cache_len(&self) -> usize {
        self.kv_cache.length
    }

    /// Clear cached positions without touching storage. Legal between
    /// requests only.
    pub fn reset_cache(&mut self) {
        self.kv_cache.reset();
    }

    /// Run one projection. Decode uses the matrix-vector path, prefill the
    /// image GEMM; raw (non-image) weights go through the tiled buffer GEMM.
    /// An unbound slot passes the input through unchanged, which is only
    /// meaningful for the square Q/K/V/O projections.
    fn project(
        &self,
        gpu: &Gpu,
        weight: &Option<ProjWeight>,
        input: &Buffer<u16>,
        output: &Buffer<u16>,
        s: usize,
        n: usize,
        k: usize,
        decode: bool,
    ) -> Result<()> {
        match weight {
            Some(ProjWeight::Image(img)) if decode => {
                dispatch::gemv(gpu, &self.programs.gemm, input, img, output, n, k)?;
            }
            Some(ProjWeight::Image(img)) => {
                dispatch::gemm_image(gpu, &self.programs.gemm, input, img, output, s, n, k)?;
            }
            Some(ProjWeight::Raw(buf)) => {
                dispatch::gemm_tiled(gpu, &self.programs.gemm, input, buf, output, s, n, k)?;
            }
            None => {
                input.copy(output, None, Some(s * k)).enq()?;
            }
        }
        Ok(())
    }

    fn norm_into(
        &self,
        gpu: &Gpu,
        weight: &Option<Buffer<u8>>,
        input: &Buffer<u16>,
        output: &Buffer<u16>,
        rows: usize,
    ) -> Result<()> {
        match weight {
            Some(w) => {
                dispatch::rms_norm(
                    gpu,
                    &self.programs.norm,
                    input,
                    output,
                    w,
                    rows,
                    self.config.llm_dim,
                    RMS_NORM_EPS,
                )?;
            }
            None => {
                input.copy(output, None, Some(rows * self.config.llm_dim)).enq()?;
            }
        }
        Ok(())
    }

    /// Full decoder forward pass over `tokens`. Prefill when S > 1, decode
    /// when S == 1. Appends S positions to the KV-cache and returns the
    /// logits of the last position as a `vocab_size` half-float buffer.
    pub fn forward(&mut self, gpu: &Gpu, tokens: &[i32]) -> Result<Buffer<u16>> {
        let s = tokens.len();
        if s == 0 {
            bail!("forward called with no tokens");
        }
        if self.kv_cache.length + s > self.kv_cache.capacity {
            bail!(
                "context overflow: {} cached + {} new exceeds max context {}",
                self.kv_cache.length,
                s,
                self.kv_cache.capacity
            );
        }

        let cfg = self.config;
        let decode = s == 1;
        let pos_offset = self.kv_cache.length;
        tracing::debug!(seq_len = s, pos_offset, decode, "forward");

        // Token ids live in a transient device buffer for the lookup.
        let d_tokens = memory::create_buffer_with(gpu, ocl::flags::MEM_READ_ONLY, tokens)?;
        dispatch::embedding_lookup(
            gpu,
            &self.programs.embedding,
            &self.weights.token_embed,
            &d_tokens,
            &self.scratch_a,
            s,
            cfg.llm_dim,
        )?;

        for layer_idx in 0..cfg.llm_layers {
            let layer = &self.weights.layers[layer_idx];

            // Attention block.
            self.norm_into(gpu, &layer.input_norm, &self.scratch_a, &self.scratch_b, s)?;

            self.project(gpu, &layer.q_proj, &self.scratch_b, &self.scratch_q, s, cfg.llm_dim, cfg.llm_dim, decode)?;
            self.project(gpu, &layer.k_proj, &self.scratch_b, &self.scratch_k, s, cfg.llm_dim, cfg.llm_dim, decode)?;
            self.project(gpu, &layer.v_proj, &self.scratch_b, &self.scratch_v, s, cfg.llm_dim, cfg.llm_dim, decode)?;

            dispatch::rope_apply(
                gpu,
                &self.programs.rope,
                &self.scratch_q,
                &self.weights.cos_table,
                &self.weights.sin_table,
                s,
                cfg.llm_heads,
                cfg.head_dim,
                pos_offset,
            )?;
            dispatch::rope_apply(
                gpu,
                &self.programs.rope,
                &self.scratch_k,
                &self.weights.cos_table,
                &self.weights.sin_table,
                s,
                cfg.llm_heads,
                cfg.head_dim,
                pos_offset,
            )?;

            self.kv_cache.append(&self.scratch_k, &self.scratch_v, s)?;
            let cache_len = self.kv_cache.length;

            if decode {
                dispatch::attention_decode(
                    gpu,
                    &self.programs.attention,
                    &self.scratch_q,
                    &self.kv_cache.k,
                    &self.kv_cache.v,
                    &self.scratch_attn,
                    cache_len,
                    cfg.llm_heads,
                    cfg.head_dim,
                )?;
            } else {
                dispatch::attention_prefill(
                    gpu,
                    &self.programs.attention,
                    &self.scratch_q,
                    &self.kv_cache.k,
                    &self.kv_cache.v,
                    &self.scratch_attn,
                    cache_len,
                    cfg.llm_heads,
                    cfg.head_dim,
                )?;
            }

            let layer = &self.weights.layers[layer_idx];
            self.project(gpu, &layer.o_proj, &self.scratch_attn, &self.scratch_b, s, cfg.llm_dim, cfg.llm_dim, decode)?;
            dispatch::vector_add(
                gpu,
                &self.programs.activation,
                &self.scratch_a,
                &self.scratch_b,
                &self.scratch_a,
                s * cfg.llm_dim,
            )?;

            // MLP block. An incomplete gate/up/down triple skips the block
            // entirely, passing the residual through unchanged.
            if layer.mlp_complete() {
                self.norm_into(gpu, &layer.post_norm, &self.scratch_a, &self.scratch_b, s)?;
                self.project(gpu, &layer.gate_proj, &self.scratch_b, &self.scratch_gate, s, cfg.llm_intermediate, cfg.llm_dim, decode)?;
                self.project(gpu, &layer.up_proj, &self.scratch_b, &self.scratch_up, s, cfg.llm_intermediate, cfg.llm_dim, decode)?;
                dispatch::silu_gate_multiply(
                    gpu,
                    &self.programs.activation,
                    &self.scratch_gate,
                    &self.scratch_up,
                    &self.scratch_gate,
                    s * cfg.llm_intermediate,
                )?;
                self.project(gpu, &layer.down_proj, &self.scratch_gate, &self.scratch_b, s, cfg.llm_dim, cfg.llm_intermediate, decode)?;
                dispatch::vector_add(
                    gpu,
                    &self.programs.activation,
                    &self.scratch_a,
                    &self.scratch_b,
                    &self.scratch_a,
                    s * cfg.llm_dim,
                )?;
            }
        }

        self.norm_into(gpu, &self.weights.final_norm, &self.scratch_a, &self.scratch_b, s)?;

        // Logits only for the last position.
        let last_hidden = self
            .scratch_b
            .create_sub_buffer(None, (s - 1) * cfg.llm_dim, cfg.llm_dim)
            .context("failed to create last-position view")?;
        let logits = memory::create_buffer::<u16>(gpu, cfg.vocab_size, ocl::flags::MEM_READ_WRITE)?;

        match &self.weights.lm_head {
            ProjWeight::Image(img) => {
                dispatch::gemv(gpu, &self.programs.gemm, &last_hidden, img, &logits, cfg.vocab_size, cfg.llm_dim)?;
            }
            ProjWeight::Raw(buf) => {
                dispatch::gemm_tiled(gpu, &self.programs.gemm, &last_hidden, buf, &logits, 1, cfg.vocab_size, cfg.llm_dim)?;
            }
        }

        gpu.finish()?;
        Ok(logits)
    }

    /// Tokenize, prefill, then greedily decode until EOS or the budget runs
    /// out, streaming tokens to stdout.
    pub fn generate(
        &mut self,
        gpu: &Gpu,
        prompt: &str,
        max_new_tokens: usize,
        vocab_path: Option<&Path>,
    ) -> Result<GenerationStats> {
        let vocab = match vocab_path {
            Some(path) => Vocabulary::from_text_file(path)
                .map_err(|e| tracing::warn!(error = %e, "failed to load vocab file"))
                .ok(),
            None => Vocabulary::from_container(&self.container)
                .map_err(|e| tracing::warn!(error = %e, "no tokenizer in container"))
                .ok(),
        };

        let prompt_ids: Vec<i32> = match &vocab {
            Some(v) => v.encode(prompt, MAX_PROMPT_TOKENS).iter().map(|&id| id as i32).collect(),
            None => {
                tracing::warn!("no tokenizer available, falling back to per-byte encoding");
                prompt.bytes().take(MAX_PROMPT_TOKENS).map(i32::from).collect()
            }
        };
        if prompt_ids.is_empty() {
            bail!("empty prompt");
        }
        tracing::info!(tokens = prompt_ids.len(), "prompt encoded");

        self.reset_cache();

        let start = Instant::now();
        let logits = self.forward(gpu, &prompt_ids).context("prefill forward pass failed")?;
        let mut next = argmax(&logits)? as i32;
        let prefill_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut generated = 0usize;
        for _ in 0..max_new_tokens {
            if let Some(v) = &vocab {
                if next as u32 == v.eos_id {
                    break;
                }
            }

            match &vocab {
                Some(v) => print!("{}", v.decode(next as u32)),
                // Raw-byte mode: printable ASCII straight through.
                None if (32..127).contains(&next) => print!("{}", next as u8 as char),
                None => print!("[{next}]"),
            }
            std::io::stdout().flush().ok();
            generated += 1;

            let logits = self
                .forward(gpu, &[next])
                .with_context(|| format!("decode forward pass failed at token {generated}"))?;
            next = argmax(&logits)? as i32;
        }
        println!();

        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        let stats = GenerationStats {
            prompt_tokens: prompt_ids.len(),
            generated,
            prefill_ms,
            decode_ms: total_ms - prefill_ms,
        };
        tracing::info!(
            prompt_tokens = stats.prompt_tokens,
            generated = stats.generated,
            prefill_ms = format!("{:.1}", stats.prefill_ms),
            decode_ms = format!("{:.1}", stats.decode_ms),
            tok_per_s = format!("{:.1}", stats.decode_tokens_per_sec()),
            "generation complete"
        );
        Ok(stats)
    }
}

/// Blocking read of the logits followed by a host-side linear argmax.
pub fn argmax(logits: &Buffer<u16>) -> Result<usize> {
    let mut host = vec![0u16; logits.len()];
    logits.read(&mut host).enq()?;
    Ok(argmax_f16(&host))
}

/// Index of the maximum half-float, earliest on ties.
pub fn argmax_f16(values: &[u16]) -> usize {
    let mut best_id = 0usize;
    let mut best_val = -1e30f32;
    for (i, &bits) in values.iter().enumerate() {
        let val = f16_decode_clamped(bits);
        if val > best_val {
            best_val = val;
            best_id = i;
        }
    }
    best_id
}

/// Half-float decode for comparison purposes: subnormals flush to zero and
/// the whole exponent-31 range maps to +/-1e30 so infinities stay ordered
/// without producing fp32 infinities.
pub fn f16_decode_clamped(bits: u16) -> f32 {
    let exp = (bits >> 10) & 0x1F;
    match exp {
        0 => 0.0,
        31 => {
            if bits & 0x8000 != 0 {
                -1e30
            } else {
                1e30
            }
        }
        _ => f16::from_bits(bits).to_f32(),
    }
}
