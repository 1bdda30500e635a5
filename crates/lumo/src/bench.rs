//! GEMM benchmark sweep over the kernel variants used by the forward pass.

use std::path::Path;

use anyhow::Result;
use half::f16;
use lumo_engine::device::Gpu;
use lumo_engine::profiler::event_elapsed_ms;
use lumo_engine::{dispatch, memory};
use rand::Rng;

struct BenchShape {
    name: &'static str,
    m: usize,
    k: usize,
    n: usize,
}

const SHAPES: [BenchShape; 5] = [
    BenchShape { name: "small", m: 256, k: 256, n: 256 },
    BenchShape { name: "medium", m: 2048, k: 2048, n: 2048 },
    BenchShape { name: "decode_gemv", m: 1, k: 2048, n: 2048 },
    BenchShape { name: "llm_ffn", m: 1, k: 2048, n: 8192 },
    BenchShape { name: "prefill_32", m: 32, k: 2048, n: 2048 },
];

const WARMUP_ITERS: usize = 2;
const BENCH_ITERS: usize = 5;

fn random_halves(count: usize) -> Vec<u16> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| f16::from_f32(rng.gen_range(-1.0f32..1.0)).to_bits()).collect()
}

fn gflops(m: usize, k: usize, n: usize, time_ms: f64) -> f64 {
    (2.0 * m as f64 * k as f64 * n as f64) / (time_ms * 1e6)
}

pub fn run(gpu: &Gpu, kernel_dir: &Path) -> Result<()> {
    let program = gpu.build_program_from_file(kernel_dir.join("gemm.cl"), "")?;

    println!("{:<8} {:<14} {:>12} {:>10}", "variant", "shape", "time (ms)", "GFLOPS");

    for shape in &SHAPES {
        let (m, k, n) = (shape.m, shape.k, shape.n);
        let host_a = random_halves(m * k);
        let host_b = random_halves(n * k);

        let a = memory::create_buffer_with(gpu, ocl::flags::MEM_READ_ONLY, &host_a)?;
        let b = memory::create_buffer_with(gpu, ocl::flags::MEM_READ_ONLY, &host_b)?;
        let b_img = memory::create_weight_image(gpu, n, k, &host_b)?;
        let c = memory::create_buffer::<u16>(gpu, m * n, ocl::flags::MEM_READ_WRITE)?;

        let variants: Vec<(&str, Box<dyn Fn() -> Result<ocl::Event> + '_>)> = vec![
            ("naive", Box::new(|| dispatch::gemm_naive(gpu, &program, &a, &b, &c, m, n, k))),
            ("tiled", Box::new(|| dispatch::gemm_tiled(gpu, &program, &a, &b, &c, m, n, k))),
            ("image", Box::new(|| dispatch::gemm_image(gpu, &program, &a, &b_img, &c, m, n, k))),
            ("gemv", Box::new(|| dispatch::gemv(gpu, &program, &a, &b_img, &c, n, k))),
        ];

        for (name, launch) in &variants {
            // The matrix-vector path only makes sense for single-row inputs.
            if *name == "gemv" && m != 1 {
                continue;
            }

            for _ in 0..WARMUP_ITERS {
                launch()?;
            }
            gpu.finish()?;

            let mut total_ms = 0.0;
            for _ in 0..BENCH_ITERS {
                let event = launch()?;
                total_ms += event_elapsed_ms(&event)?;
            }
            let avg_ms = total_ms / BENCH_ITERS as f64;
            println!(
                "{:<8} {:<14} {:>12.3} {:>10.1}",
                name,
                shape.name,
                avg_ms,
                gflops(m, k, n, avg_ms)
            );
        }
    }

    Ok(())
}
