use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about = "On-device vision-language model inference over OpenCL", long_about = None)]
pub struct Cli {
    /// Path to the GGUF model file
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Directory containing the OpenCL kernel sources
    #[arg(long, default_value = "kernels")]
    pub kernels: PathBuf,

    /// Plain-text vocabulary file (defaults to the container's metadata)
    #[arg(long)]
    pub vocab: Option<PathBuf>,

    /// Text prompt for the model
    #[arg(long)]
    pub prompt: Option<String>,

    /// Maximum number of new tokens to generate
    #[arg(long, default_value_t = 128)]
    pub max_tokens: usize,

    /// Print device capabilities and exit
    #[arg(long)]
    pub device_info: bool,

    /// Run the GEMM benchmark sweep and exit
    #[arg(long)]
    pub benchmark: bool,
}
