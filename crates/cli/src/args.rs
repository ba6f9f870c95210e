use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use qwen_vl_config::{AppConfig, ConfigOverride, ConfigOverrides};
use qwen_vl_core::runtime::{DeviceKind, Precision};

#[derive(Parser, Debug)]
#[command(author, version, about = "Qwen2-VL / Qwen2.5-VL inference CLI", long_about = None)]
pub struct Cli {
    /// Only log errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a response for a prompt with optional images or video frames.
    Generate(GenerateArgs),
    /// Print the parsed model configuration and a summary of the weight archives.
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ModelArgs {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Select which model entry to load from the configuration.
    #[arg(long, value_name = "ID", help_heading = "Application")]
    pub model: Option<String>,

    /// Load the model from a local snapshot directory.
    #[arg(long, value_name = "DIR", help_heading = "Application", conflicts_with = "repo")]
    pub model_path: Option<PathBuf>,

    /// Load the model from a Hugging Face repo id (owner/name).
    #[arg(long, value_name = "REPO", help_heading = "Application")]
    pub repo: Option<String>,

    /// Device backend to execute on (cpu/metal/cuda).
    #[arg(long, help_heading = "Inference")]
    pub device: Option<DeviceKind>,

    /// Numeric precision. Defaults to f32 on CPU and f16 on Metal/CUDA.
    #[arg(long, help_heading = "Inference")]
    pub dtype: Option<Precision>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Prompt text. Use `<image>` (or `<video>`) markers to place visual inputs.
    #[arg(long, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    /// Prompt file path (UTF-8).
    #[arg(long, value_name = "PATH", conflicts_with = "prompt")]
    pub prompt_file: Option<PathBuf>,

    /// System prompt for the chat template.
    #[arg(long)]
    pub system: Option<String>,

    /// Image files, in marker order.
    #[arg(long = "image", value_name = "PATH", conflicts_with = "frames")]
    pub images: Vec<PathBuf>,

    /// Video frames (one video), in temporal order.
    #[arg(long = "frame", value_name = "PATH")]
    pub frames: Vec<PathBuf>,

    /// Sampling rate of the supplied video frames.
    #[arg(long, default_value_t = 2.0)]
    pub fps: f32,

    /// Maximum number of tokens to generate.
    #[arg(long, help_heading = "Inference")]
    pub max_new_tokens: Option<usize>,

    /// Sample instead of greedy decoding.
    #[arg(long, help_heading = "Inference")]
    pub do_sample: Option<bool>,

    #[arg(long, help_heading = "Inference")]
    pub temperature: Option<f64>,

    #[arg(long, help_heading = "Inference")]
    pub top_p: Option<f64>,

    #[arg(long, help_heading = "Inference")]
    pub top_k: Option<usize>,

    #[arg(long, help_heading = "Inference")]
    pub repetition_penalty: Option<f32>,

    #[arg(long, help_heading = "Inference")]
    pub seed: Option<u64>,

    /// Lower bound on resized image area, in pixels.
    #[arg(long, help_heading = "Inference")]
    pub min_pixels: Option<usize>,

    /// Upper bound on resized image area, in pixels.
    #[arg(long, help_heading = "Inference")]
    pub max_pixels: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct InspectArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Number of tensors to list from the weight archives.
    #[arg(long, default_value_t = 8)]
    pub sample: usize,
}

impl ModelArgs {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            config_path: self.config.clone(),
            model_id: self.model.clone(),
            model_path: self.model_path.clone(),
            model_repo: self.repo.clone(),
            ..ConfigOverrides::default()
        };
        overrides.inference.device = self.device;
        overrides.inference.precision = self.dtype;
        overrides
    }
}

impl From<&GenerateArgs> for ConfigOverrides {
    fn from(args: &GenerateArgs) -> Self {
        let mut overrides = args.model.overrides();
        overrides.inference.system_prompt = args.system.clone();
        overrides.inference.max_new_tokens = args.max_new_tokens;
        overrides.inference.do_sample = args.do_sample;
        overrides.inference.temperature = args.temperature;
        overrides.inference.top_p = args.top_p;
        overrides.inference.top_k = args.top_k;
        overrides.inference.repetition_penalty = args.repetition_penalty;
        overrides.inference.seed = args.seed;
        overrides.inference.min_pixels = args.min_pixels;
        overrides.inference.max_pixels = args.max_pixels;
        overrides
    }
}

impl From<&InspectArgs> for ConfigOverrides {
    fn from(args: &InspectArgs) -> Self {
        args.model.overrides()
    }
}

impl ConfigOverride for &GenerateArgs {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}

impl ConfigOverride for &InspectArgs {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "qwen-vl",
            "generate",
            "--model-path",
            "/models/qwen",
            "--prompt",
            "Describe <image>",
            "--image",
            "a.png",
            "--max-new-tokens",
            "16",
            "--seed",
            "3",
            "--device",
            "cpu",
        ])
        .expect("valid arguments");
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let overrides = ConfigOverrides::from(&args);
        assert_eq!(overrides.model_path, Some(PathBuf::from("/models/qwen")));
        assert_eq!(overrides.inference.max_new_tokens, Some(16));
        assert_eq!(overrides.inference.seed, Some(3));
        assert_eq!(overrides.inference.device, Some(DeviceKind::Cpu));
        assert_eq!(args.images, vec![PathBuf::from("a.png")]);
    }

    #[test]
    fn images_and_frames_are_exclusive() {
        let result = Cli::try_parse_from([
            "qwen-vl", "generate", "--prompt", "x", "--image", "a.png", "--frame", "f0.png",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn quiet_is_global() {
        let cli = Cli::try_parse_from(["qwen-vl", "inspect", "--quiet", "--sample", "2"])
            .expect("valid arguments");
        assert!(cli.quiet);
        let Command::Inspect(args) = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(args.sample, 2);
    }
}
