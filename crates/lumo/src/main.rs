use anyhow::{bail, Result};
use clap::Parser;
use lumo_engine::{Gpu, Model};

mod bench;
mod cli;

use cli::Cli;

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let gpu = Gpu::new()?;

    if cli.device_info {
        println!("{}", gpu.caps.summary());
        return Ok(());
    }

    if cli.benchmark {
        return bench::run(&gpu, &cli.kernels);
    }

    let Some(model_path) = cli.model.as_deref() else {
        bail!("--model is required (try --help)");
    };

    let mut model = Model::load(&gpu, model_path, &cli.kernels)?;

    let Some(prompt) = cli.prompt.as_deref() else {
        println!("Model loaded. Provide --prompt to generate.");
        return Ok(());
    };

    println!("Prompt: {prompt}");
    println!("Output:");
    let stats = model.generate(&gpu, prompt, cli.max_tokens, cli.vocab.as_deref())?;

    println!();
    println!("--- Stats ---");
    println!("  Prompt tokens:  {}", stats.prompt_tokens);
    println!("  Generated:      {} tokens", stats.generated);
    println!(
        "  Prefill:        {:.1} ms ({:.1} ms/token)",
        stats.prefill_ms,
        stats.prefill_ms / stats.prompt_tokens.max(1) as f64
    );
    println!(
        "  Decode:         {:.1} ms ({:.1} tok/s)",
        stats.decode_ms,
        stats.decode_tokens_per_sec()
    );
    println!("  Total:          {:.1} ms", stats.prefill_ms + stats.decode_ms);

    Ok(())
}
