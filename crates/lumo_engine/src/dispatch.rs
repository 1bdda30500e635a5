//! Operator dispatch: one thin wrapper per kernel that binds arguments,
//! computes the work sizes, enqueues on the in-order queue and hands back the
//! completion event.
//!
//! Successive dispatches are producer-consumer-safe without explicit events
//! because the queue is in-order; callers that want timings feed the returned
//! events to the profiler, everyone else drops them.

use anyhow::Result;
use ocl::{Buffer, Event, Kernel, OclPrm, Program};

use crate::device::Gpu;
use crate::memory::WeightImage;

/// Work-group width shared by the 1-D reduction kernels.
const WG_SIZE: usize = 256;

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

fn enqueue(kernel: Kernel) -> Result<Event> {
    let mut event = Event::empty();
    unsafe {
        kernel.cmd().enew(&mut event).enq()?;
    }
    Ok(event)
}

// --- GEMM / GEMV ---

/// C[M,N] = A[M,K] x B[N,K], one scalar per work-item.
pub fn gemm_naive<B: OclPrm>(
    gpu: &Gpu,
    program: &Program,
    a: &Buffer<u16>,
    b: &Buffer<B>,
    c: &Buffer<u16>,
    m: usize,
    n: usize,
    k: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("gemm_naive")
        .queue(gpu.queue.clone())
        .global_work_size([round_up(m, 16), round_up(n, 16)])
        .local_work_size([16, 16])
        .arg(a)
        .arg(b)
        .arg(c)
        .arg(m as i32)
        .arg(n as i32)
        .arg(k as i32)
        .build()?;
    enqueue(kernel)
}

/// Local-memory tiled variant of [`gemm_naive`].
pub fn gemm_tiled<B: OclPrm>(
    gpu: &Gpu,
    program: &Program,
    a: &Buffer<u16>,
    b: &Buffer<B>,
    c: &Buffer<u16>,
    m: usize,
    n: usize,
    k: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("gemm_tiled")
        .queue(gpu.queue.clone())
        .global_work_size([round_up(m, 8), round_up(n, 8)])
        .local_work_size([8, 8])
        .arg(a)
        .arg(b)
        .arg(c)
        .arg(m as i32)
        .arg(n as i32)
        .arg(k as i32)
        .build()?;
    enqueue(kernel)
}

/// C[M,N] = A[M,K] x B where B is a texel-packed weight image. Each
/// work-item produces four adjacent output columns.
pub fn gemm_image(
    gpu: &Gpu,
    program: &Program,
    a: &Buffer<u16>,
    b: &WeightImage,
    c: &Buffer<u16>,
    m: usize,
    n: usize,
    k: usize,
) -> Result<Event> {
    let n_div4 = n.div_ceil(4);
    let kernel = Kernel::builder()
        .program(program)
        .name("gemm_image")
        .queue(gpu.queue.clone())
        .global_work_size([round_up(m, 16), round_up(n_div4, 4)])
        .local_work_size([16, 4])
        .arg(a)
        .arg(&b.image)
        .arg(c)
        .arg(m as i32)
        .arg(n as i32)
        .arg(k as i32)
        .build()?;
    enqueue(kernel)
}

/// y[N] = x[K] x W for the decode path: one work-group per four outputs.
pub fn gemv(
    gpu: &Gpu,
    program: &Program,
    x: &Buffer<u16>,
    w: &WeightImage,
    y: &Buffer<u16>,
    n: usize,
    k: usize,
) -> Result<Event> {
    let num_groups = n.div_ceil(4);
    let kernel = Kernel::builder()
        .program(program)
        .name("gemv")
        .queue(gpu.queue.clone())
        .global_work_size(num_groups * WG_SIZE)
        .local_work_size(WG_SIZE)
        .arg(x)
        .arg(&w.image)
        .arg(y)
        .arg(n as i32)
        .arg(k as i32)
        .build()?;
    enqueue(kernel)
}

// --- Normalization ---

/// Row-wise RMS normalization, one work-group per row. The mean of squares
/// accumulates in fp32 on the device.
pub fn rms_norm<W: OclPrm>(
    gpu: &Gpu,
    program: &Program,
    input: &Buffer<u16>,
    output: &Buffer<u16>,
    weight: &Buffer<W>,
    num_rows: usize,
    hidden_size: usize,
    eps: f32,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("rms_norm")
        .queue(gpu.queue.clone())
        .global_work_size(num_rows * WG_SIZE)
        .local_work_size(WG_SIZE)
        .arg(input)
        .arg(output)
        .arg(weight)
        .arg(hidden_size as i32)
        .arg(eps)
        .build()?;
    enqueue(kernel)
}

/// Row-wise softmax with per-row max subtraction.
pub fn softmax(
    gpu: &Gpu,
    program: &Program,
    input: &Buffer<u16>,
    output: &Buffer<u16>,
    seq_len: usize,
    num_elements: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("softmax")
        .queue(gpu.queue.clone())
        .global_work_size(seq_len * WG_SIZE)
        .local_work_size(WG_SIZE)
        .arg(input)
        .arg(output)
        .arg(seq_len as i32)
        .arg(num_elements as i32)
        .build()?;
    enqueue(kernel)
}

// --- Element-wise activations ---

fn elementwise(
    gpu: &Gpu,
    program: &Program,
    name: &str,
    args: &[&Buffer<u16>],
    n: usize,
) -> Result<Event> {
    let mut builder = Kernel::builder();
    builder
        .program(program)
        .name(name)
        .queue(gpu.queue.clone())
        .global_work_size(round_up(n.div_ceil(4), WG_SIZE))
        .local_work_size(WG_SIZE);
    for arg in args {
        builder.arg(*arg);
    }
    builder.arg(n as i32);
    enqueue(builder.build()?)
}

pub fn silu(gpu: &Gpu, program: &Program, input: &Buffer<u16>, output: &Buffer<u16>, n: usize) -> Result<Event> {
    elementwise(gpu, program, "silu", &[input, output], n)
}

pub fn gelu(gpu: &Gpu, program: &Program, input: &Buffer<u16>, output: &Buffer<u16>, n: usize) -> Result<Event> {
    elementwise(gpu, program, "gelu", &[input, output], n)
}

/// output = silu(gate) * up, fused.
pub fn silu_gate_multiply(
    gpu: &Gpu,
    program: &Program,
    gate: &Buffer<u16>,
    up: &Buffer<u16>,
    output: &Buffer<u16>,
    n: usize,
) -> Result<Event> {
    elementwise(gpu, program, "silu_gate_multiply", &[gate, up, output], n)
}

/// output = a + b. The residual path calls this with output aliasing `a`,
/// which the in-order queue makes well-defined.
pub fn vector_add(
    gpu: &Gpu,
    program: &Program,
    a: &Buffer<u16>,
    b: &Buffer<u16>,
    output: &Buffer<u16>,
    n: usize,
) -> Result<Event> {
    elementwise(gpu, program, "vector_add", &[a, b, output], n)
}

// --- Attention ---

/// Causal multi-head attention over the freshly filled cache; one work-group
/// per (position, head) pair.
pub fn attention_prefill(
    gpu: &Gpu,
    program: &Program,
    q: &Buffer<u16>,
    k: &Buffer<u16>,
    v: &Buffer<u16>,
    output: &Buffer<u16>,
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("attention_prefill")
        .queue(gpu.queue.clone())
        .global_work_size(seq_len * num_heads * WG_SIZE)
        .local_work_size(WG_SIZE)
        .arg(q)
        .arg(k)
        .arg(v)
        .arg(output)
        .arg(seq_len as i32)
        .arg(num_heads as i32)
        .arg(head_dim as i32)
        .build()?;
    enqueue(kernel)
}

/// Single-query attention against the populated cache; one work-group per head.
pub fn attention_decode(
    gpu: &Gpu,
    program: &Program,
    q: &Buffer<u16>,
    k_cache: &Buffer<u16>,
    v_cache: &Buffer<u16>,
    output: &Buffer<u16>,
    cache_len: usize,
    num_heads: usize,
    head_dim: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("attention_decode")
        .queue(gpu.queue.clone())
        .global_work_size(num_heads * WG_SIZE)
        .local_work_size(WG_SIZE)
        .arg(q)
        .arg(k_cache)
        .arg(v_cache)
        .arg(output)
        .arg(cache_len as i32)
        .arg(num_heads as i32)
        .arg(head_dim as i32)
        .build()?;
    enqueue(kernel)
}

// --- Rotary positional encoding ---

/// Rotate the (even, odd) lane pairs of Q or K in place, starting at cache
/// position `offset`. 3-D dispatch, driver-chosen local size.
pub fn rope_apply(
    gpu: &Gpu,
    program: &Program,
    qk: &Buffer<u16>,
    cos_table: &Buffer<u16>,
    sin_table: &Buffer<u16>,
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
    offset: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("rope_apply")
        .queue(gpu.queue.clone())
        .global_work_size([seq_len, num_heads, head_dim / 2])
        .arg(qk)
        .arg(cos_table)
        .arg(sin_table)
        .arg(seq_len as i32)
        .arg(num_heads as i32)
        .arg(head_dim as i32)
        .arg(offset as i32)
        .build()?;
    enqueue(kernel)
}

// --- Embedding ---

/// output[s, :] = table[token_ids[s], :], four lanes per work-item.
pub fn embedding_lookup<T: OclPrm>(
    gpu: &Gpu,
    program: &Program,
    embed_table: &Buffer<T>,
    token_ids: &Buffer<i32>,
    output: &Buffer<u16>,
    seq_len: usize,
    embed_dim: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("embedding_lookup")
        .queue(gpu.queue.clone())
        .global_work_size([seq_len, embed_dim.div_ceil(4)])
        .arg(embed_table)
        .arg(token_ids)
        .arg(output)
        .arg(embed_dim as i32)
        .build()?;
    enqueue(kernel)
}

// --- Vision encoder ---

/// Bilinear resize + per-channel normalization of the input image.
#[allow(clippy::too_many_arguments)]
pub fn preprocess_image(
    gpu: &Gpu,
    program: &Program,
    input: &Buffer<f32>,
    output: &Buffer<u16>,
    target_h: usize,
    target_w: usize,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("preprocess_image")
        .queue(gpu.queue.clone())
        .global_work_size([target_w, target_h])
        .arg(input)
        .arg(output)
        .arg(target_h as i32)
        .arg(target_w as i32)
        .arg(mean[0])
        .arg(mean[1])
        .arg(mean[2])
        .arg(std[0])
        .arg(std[1])
        .arg(std[2])
        .build()?;
    enqueue(kernel)
}

/// Unfold the image into patches and project each into the vision dimension.
#[allow(clippy::too_many_arguments)]
pub fn patch_embed(
    gpu: &Gpu,
    program: &Program,
    image: &Buffer<u16>,
    proj_weight: &Buffer<u16>,
    proj_bias: &Buffer<u16>,
    patches: &Buffer<u16>,
    channels: usize,
    height: usize,
    width: usize,
    patch: usize,
    embed_dim: usize,
) -> Result<Event> {
    let num_patches = (height / patch) * (width / patch);
    let kernel = Kernel::builder()
        .program(program)
        .name("patch_embed")
        .queue(gpu.queue.clone())
        .global_work_size([num_patches, embed_dim.div_ceil(4)])
        .arg(image)
        .arg(proj_weight)
        .arg(proj_bias)
        .arg(patches)
        .arg(channels as i32)
        .arg(height as i32)
        .arg(width as i32)
        .arg(patch as i32)
        .arg(patch as i32)
        .arg(embed_dim as i32)
        .build()?;
    enqueue(kernel)
}

pub fn vision_rmsnorm(
    gpu: &Gpu,
    program: &Program,
    input: &Buffer<u16>,
    output: &Buffer<u16>,
    weight: &Buffer<u16>,
    num_patches: usize,
    hidden_dim: usize,
    eps: f32,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("vision_rmsnorm")
        .queue(gpu.queue.clone())
        .global_work_size([num_patches, hidden_dim.div_ceil(4)])
        .arg(input)
        .arg(output)
        .arg(weight)
        .arg(num_patches as i32)
        .arg(hidden_dim as i32)
        .arg(eps)
        .build()?;
    enqueue(kernel)
}

/// Bidirectional (unmasked) attention over the patch sequence.
#[allow(clippy::too_many_arguments)]
pub fn vision_attention(
    gpu: &Gpu,
    program: &Program,
    input: &Buffer<u16>,
    qkv_weight: &Buffer<u16>,
    qkv_bias: &Buffer<u16>,
    out_weight: &Buffer<u16>,
    out_bias: &Buffer<u16>,
    output: &Buffer<u16>,
    num_patches: usize,
    hidden_dim: usize,
    num_heads: usize,
    scale: f32,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("vision_attention")
        .queue(gpu.queue.clone())
        .global_work_size([num_patches, hidden_dim.div_ceil(4)])
        .arg(input)
        .arg(qkv_weight)
        .arg(qkv_bias)
        .arg(out_weight)
        .arg(out_bias)
        .arg(output)
        .arg(num_patches as i32)
        .arg(hidden_dim as i32)
        .arg(num_heads as i32)
        .arg(scale)
        .build()?;
    enqueue(kernel)
}

#[allow(clippy::too_many_arguments)]
pub fn vision_mlp(
    gpu: &Gpu,
    program: &Program,
    input: &Buffer<u16>,
    gate_weight: &Buffer<u16>,
    up_weight: &Buffer<u16>,
    down_weight: &Buffer<u16>,
    output: &Buffer<u16>,
    num_patches: usize,
    hidden_dim: usize,
    intermediate: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("vision_mlp")
        .queue(gpu.queue.clone())
        .global_work_size([num_patches, hidden_dim.div_ceil(4)])
        .arg(input)
        .arg(gate_weight)
        .arg(up_weight)
        .arg(down_weight)
        .arg(output)
        .arg(num_patches as i32)
        .arg(hidden_dim as i32)
        .arg(intermediate as i32)
        .build()?;
    enqueue(kernel)
}

/// Project visual tokens from the vision dimension into the language-model
/// dimension.
#[allow(clippy::too_many_arguments)]
pub fn vision_proj(
    gpu: &Gpu,
    program: &Program,
    visual_tokens: &Buffer<u16>,
    proj_weight: &Buffer<u16>,
    proj_bias: &Buffer<u16>,
    output: &Buffer<u16>,
    num_patches: usize,
    vision_dim: usize,
    llm_dim: usize,
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name("vision_proj")
        .queue(gpu.queue.clone())
        .global_work_size([num_patches, llm_dim.div_ceil(4)])
        .arg(visual_tokens)
        .arg(proj_weight)
        .arg(proj_bias)
        .arg(output)
        .arg(num_patches as i32)
        .arg(vision_dim as i32)
        .arg(llm_dim as i32)
        .build()?;
    enqueue(kernel)
}
