//! Hardware-backed tests. Everything here needs a working OpenCL runtime, so
//! the suite is ignored by default; run with `cargo test -- --ignored` on a
//! machine with a GPU.

use std::path::PathBuf;

use half::f16;
use lumo_engine::device::Gpu;
use lumo_engine::memory::{self, ActivationPool};
use lumo_engine::model::KvCache;
use lumo_engine::{dispatch, Model};

fn kernel_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../kernels")
}

fn halves(values: &[f32]) -> Vec<u16> {
    values.iter().map(|v| f16::from_f32(*v).to_bits()).collect()
}

#[test]
#[ignore = "requires an OpenCL device"]
fn device_initializes_with_sane_caps() {
    let gpu = Gpu::new().unwrap();
    assert!(gpu.caps.max_workgroup_size > 0);
    assert!(gpu.caps.global_mem_size > 0);
    assert!(!gpu.caps.name.is_empty());
}

#[test]
#[ignore = "requires an OpenCL device"]
fn buffer_round_trips_through_device() {
    let gpu = Gpu::new().unwrap();
    let host: Vec<u16> = (0..1024).collect();
    let buf = memory::create_buffer_with(&gpu, ocl::flags::MEM_READ_WRITE, &host).unwrap();
    let mut back = vec![0u16; host.len()];
    buf.read(&mut back).enq().unwrap();
    assert_eq!(host, back);
}

#[test]
#[ignore = "requires an OpenCL device"]
fn activation_pool_ping_pongs() {
    let gpu = Gpu::new().unwrap();
    let mut pool = ActivationPool::new(&gpu, 256).unwrap();
    assert!(!std::ptr::eq(pool.current(), pool.next()));
    let first = pool.current() as *const _;
    let second = pool.next() as *const _;
    pool.swap();
    assert!(std::ptr::eq(pool.current(), second));
    pool.swap();
    assert!(std::ptr::eq(pool.current(), first));
}

#[test]
#[ignore = "requires an OpenCL device"]
fn vector_add_kernel_adds() {
    let gpu = Gpu::new().unwrap();
    let program = gpu
        .build_program_from_file(kernel_dir().join("activations.cl"), "")
        .unwrap();

    let n = 1000;
    let a_host = halves(&(0..n).map(|i| i as f32).collect::<Vec<_>>());
    let b_host = halves(&(0..n).map(|i| (i * 2) as f32).collect::<Vec<_>>());
    let a = memory::create_buffer_with(&gpu, ocl::flags::MEM_READ_ONLY, &a_host).unwrap();
    let b = memory::create_buffer_with(&gpu, ocl::flags::MEM_READ_ONLY, &b_host).unwrap();
    let out = memory::create_buffer::<u16>(&gpu, n, ocl::flags::MEM_READ_WRITE).unwrap();

    dispatch::vector_add(&gpu, &program, &a, &b, &out, n).unwrap();
    gpu.finish().unwrap();

    let mut result = vec![0u16; n];
    out.read(&mut result).enq().unwrap();
    for i in 0..n {
        let got = f16::from_bits(result[i]).to_f32();
        let want = (i * 3) as f32;
        assert!((got - want).abs() <= want.abs() * 0.01 + 0.01, "i={i} got={got} want={want}");
    }
}

#[test]
#[ignore = "requires an OpenCL device"]
fn rms_norm_kernel_normalizes_rows() {
    let gpu = Gpu::new().unwrap();
    let program = gpu
        .build_program_from_file(kernel_dir().join("layernorm.cl"), "")
        .unwrap();

    let hidden = 64;
    let input_host = halves(&vec![2.0f32; hidden]);
    let weight_host = halves(&vec![1.0f32; hidden]);
    let input = memory::create_buffer_with(&gpu, ocl::flags::MEM_READ_ONLY, &input_host).unwrap();
    let weight = memory::create_buffer_with(&gpu, ocl::flags::MEM_READ_ONLY, &weight_host).unwrap();
    let output = memory::create_buffer::<u16>(&gpu, hidden, ocl::flags::MEM_READ_WRITE).unwrap();

    dispatch::rms_norm(&gpu, &program, &input, &output, &weight, 1, hidden, 1e-5).unwrap();
    gpu.finish().unwrap();

    // A constant row normalizes to ones.
    let mut result = vec![0u16; hidden];
    output.read(&mut result).enq().unwrap();
    for (i, bits) in result.iter().enumerate() {
        let got = f16::from_bits(*bits).to_f32();
        assert!((got - 1.0).abs() < 0.01, "i={i} got={got}");
    }
}

#[test]
#[ignore = "requires an OpenCL device"]
fn kv_cache_append_is_monotone() {
    let gpu = Gpu::new().unwrap();
    let (heads, head_dim) = (2, 4);
    let mut cache = KvCache::new(&gpu, 8, heads, head_dim).unwrap();
    assert_eq!(cache.length, 0);

    let row = heads * head_dim;
    let staged = memory::create_buffer_with(
        &gpu,
        ocl::flags::MEM_READ_WRITE,
        &vec![f16::from_f32(1.0).to_bits(); 3 * row],
    )
    .unwrap();

    cache.append(&staged, &staged, 3).unwrap();
    assert_eq!(cache.length, 3);
    cache.append(&staged, &staged, 1).unwrap();
    assert_eq!(cache.length, 4);

    // Appending past capacity reports without mutating the length.
    assert!(cache.append(&staged, &staged, 5).is_err());
    assert_eq!(cache.length, 4);

    cache.reset();
    assert_eq!(cache.length, 0);
    assert_eq!(cache.capacity, 8);
}

/// End-to-end smoke over a real container: point LUMO_MODEL at a GGUF file
/// (and optionally LUMO_KERNELS at a kernel directory) before running.
#[test]
#[ignore = "requires an OpenCL device and a model file (LUMO_MODEL)"]
fn generate_smoke() {
    let model_path = std::env::var("LUMO_MODEL").expect("set LUMO_MODEL to a GGUF file");
    let kernels = std::env::var("LUMO_KERNELS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| kernel_dir());

    let gpu = Gpu::new().unwrap();
    let mut model = Model::load(&gpu, PathBuf::from(model_path), kernels).unwrap();

    let stats = model.generate(&gpu, "Hi", 4, None).unwrap();
    assert!(stats.prompt_tokens > 0);
    assert!(stats.generated <= 4);
    assert_eq!(model.cache_len(), stats.prompt_tokens + stats.generated);
    assert!(stats.prefill_ms > 0.0);
}
