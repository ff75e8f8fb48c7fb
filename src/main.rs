//! CLI entry point for DreamBooth LoRA training and inference

use clap::{Parser, Subcommand};
use dreambooth_lora::error::TrainError;
use dreambooth_lora::inference::{self, InferenceRequest};
use dreambooth_lora::train::{self, TrainArgs};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dreambooth-lora")]
#[command(version = "0.1.0")]
#[command(about = "DreamBooth LoRA fine-tuning and inference for SDXL", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one image from a prompt using trained LoRA weights
    ///
    /// Loads the SDXL base model from /app/models, merges
    /// pytorch_lora_weights.safetensors from the adapter directory into
    /// the UNet, and writes image_<seed>.png to the output directory.
    Inference {
        /// Prompt for the instance
        #[arg(long)]
        prompt: String,

        /// Number of inference steps
        #[arg(long = "num_inf_steps", default_value_t = 50)]
        num_inf_steps: usize,

        /// Path to lora model
        #[arg(long = "lora_model", default_value = "/inputs")]
        lora_model: PathBuf,

        /// Output path
        #[arg(long, default_value = "/outputs")]
        output: PathBuf,

        /// Seed for inference
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Fine-tune LoRA weights with the vendored diffusers trainer
    ///
    /// Stages the accelerate config, then runs
    /// `accelerate launch train_dreambooth_lora_sdxl.py` with a fixed
    /// hyperparameter set and prints the captured output when it exits.
    Train {
        /// Prompt for the instance
        #[arg(long, default_value = "")]
        prompt: String,

        /// Path to input directory with instance data
        #[arg(long, default_value = "/inputs")]
        input: PathBuf,

        /// Path to output directory to save trained model
        #[arg(long, default_value = "/outputs")]
        output: PathBuf,

        /// Number of training steps
        #[arg(long, default_value_t = 500)]
        steps: u32,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inference {
            prompt,
            num_inf_steps,
            lora_model,
            output,
            seed,
        } => {
            let request = InferenceRequest {
                prompt,
                num_inf_steps,
                lora_model,
                output,
                seed,
            };
            // Errors are logged and swallowed; the process still exits
            // cleanly. Callers watch the output directory, not the status.
            match inference::run(&request) {
                Ok(path) => info!(path = %path.display(), "Done"),
                Err(err) => error!(error = %err, "Error"),
            }
        }

        Commands::Train {
            prompt,
            input,
            output,
            steps,
        } => {
            let args = TrainArgs {
                prompt,
                input,
                output,
                steps,
            };
            if let Err(err) = train::run(&args) {
                match err {
                    TrainError::EmptyPrompt => {
                        println!("{err}");
                        std::process::exit(1);
                    }
                    other => {
                        error!(error = %other, "Training wrapper failed");
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}
