//! Training workflow
//!
//! Thin wrapper around the vendored diffusers DreamBooth LoRA trainer.
//! Stages the accelerate config into the HuggingFace cache, launches
//! `accelerate launch train_dreambooth_lora_sdxl.py` with a fixed
//! hyperparameter set, prints the child's captured output once it exits
//! and reports elapsed wall-clock time.
//!
//! The wrapper deliberately does not turn the child's exit status into its
//! own: existing callers read the printed output, so a non-zero status is
//! only logged as a warning.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::TrainError;
use crate::MODEL_DIR;

/// Accelerate config staged before every run, kept next to the binary.
pub const ACCELERATE_CONFIG: &str = "default_config.yaml";
/// Vendored diffusers training script location, relative to the working directory.
pub const TRAINER_DIR: &str = "diffusers/examples/dreambooth";
pub const TRAINER_SCRIPT: &str = "train_dreambooth_lora_sdxl.py";

/// One training invocation.
#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub prompt: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub steps: u32,
}

/// Run the training workflow end to end.
pub fn run(args: &TrainArgs) -> Result<(), TrainError> {
    let start = Instant::now();

    if !prompt_is_set(&args.prompt) {
        return Err(TrainError::EmptyPrompt);
    }

    stage_accelerate_config(Path::new(ACCELERATE_CONFIG), &accelerate_cache_dir()?)?;

    info!(
        script = TRAINER_SCRIPT,
        steps = args.steps,
        "Launching DreamBooth LoRA training"
    );
    let output = build_command(args).output().map_err(TrainError::Launch)?;

    // Full output is printed after the child exits, not streamed.
    println!("stdout: \n\n{}", String::from_utf8_lossy(&output.stdout));
    println!("stderr: \n\n{}", String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        warn!(status = %output.status, "training process exited with a non-zero status");
    }

    println!(
        "Time elapsed since start of script: {} seconds",
        start.elapsed().as_secs()
    );
    Ok(())
}

/// Only the empty string counts as unset; whitespace is a usable prompt
/// and gets passed through to the trainer as-is.
fn prompt_is_set(prompt: &str) -> bool {
    !prompt.is_empty()
}

/// Where accelerate reads its default config from.
pub fn accelerate_cache_dir() -> Result<PathBuf, TrainError> {
    dirs::home_dir()
        .map(|home| home.join(".cache/huggingface/accelerate"))
        .ok_or(TrainError::NoHomeDir)
}

/// Copy the pre-configured accelerate config into the cache, byte for byte.
pub fn stage_accelerate_config(source: &Path, cache_dir: &Path) -> Result<(), TrainError> {
    std::fs::create_dir_all(cache_dir).map_err(|e| TrainError::ConfigStaging {
        path: cache_dir.to_path_buf(),
        source: e,
    })?;
    let target = cache_dir.join(ACCELERATE_CONFIG);
    std::fs::copy(source, &target).map_err(|e| TrainError::ConfigStaging {
        path: source.to_path_buf(),
        source: e,
    })?;
    info!(target = %target.display(), "Accelerate config staged");
    Ok(())
}

/// Build the `accelerate launch` command, rooted in the vendored script
/// directory.
pub fn build_command(args: &TrainArgs) -> Command {
    let mut cmd = Command::new("accelerate");
    cmd.current_dir(TRAINER_DIR);
    cmd.args(launch_args(args));
    cmd
}

/// The fixed hyperparameter set plus the caller's overrides.
pub fn launch_args(args: &TrainArgs) -> Vec<OsString> {
    let mut argv: Vec<OsString> = vec![
        "launch".into(),
        TRAINER_SCRIPT.into(),
        format!("--pretrained_model_name_or_path={MODEL_DIR}").into(),
        "--instance_data_dir".into(),
        args.input.as_os_str().to_os_string(),
        "--output_dir".into(),
        args.output.as_os_str().to_os_string(),
        "--instance_prompt".into(),
        args.prompt.clone().into(),
    ];
    argv.extend(
        [
            "--resolution",
            "1024",
            "--gradient_checkpointing",
            "--gradient_accumulation_steps",
            "1",
            "--train_batch_size",
            "1",
            "--learning_rate",
            "1e-4",
            "--lr_scheduler",
            "constant",
            "--lr_warmup_steps",
            "0",
        ]
        .map(OsString::from),
    );
    argv.push("--max_train_steps".into());
    argv.push(args.steps.to_string().into());
    argv.extend(["--seed", "0", "--use_8bit_adam"].map(OsString::from));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(prompt: &str) -> TrainArgs {
        TrainArgs {
            prompt: prompt.to_string(),
            input: PathBuf::from("/inputs"),
            output: PathBuf::from("/outputs"),
            steps: 500,
        }
    }

    #[test]
    fn test_empty_prompt_rejected_before_any_work() {
        let err = run(&args("")).unwrap_err();
        assert!(matches!(err, TrainError::EmptyPrompt));
        assert_eq!(err.to_string(), "PROMPT is not set. Exiting.");
    }

    #[test]
    fn test_whitespace_prompt_counts_as_set() {
        assert!(!prompt_is_set(""));
        assert!(prompt_is_set("   "));
        assert!(prompt_is_set("a photo of sks dog"));

        // And it is forwarded to the trainer untouched
        let argv = launch_args(&args("   "));
        let pos = argv
            .iter()
            .position(|a| a == "--instance_prompt")
            .unwrap();
        assert_eq!(argv[pos + 1], "   ");
    }

    #[test]
    fn test_launch_args_carry_fixed_hyperparameters() {
        let argv = launch_args(&args("a photo of sks dog"));

        assert_eq!(argv[0], "launch");
        assert_eq!(argv[1], TRAINER_SCRIPT);
        assert!(argv.contains(&"--pretrained_model_name_or_path=/app/models".into()));
        assert!(argv.contains(&"--gradient_checkpointing".into()));
        assert!(argv.contains(&"--use_8bit_adam".into()));

        let expect_pair = |flag: &str, value: &str| {
            let pos = argv
                .iter()
                .position(|a| a == flag)
                .unwrap_or_else(|| panic!("missing {flag}"));
            assert_eq!(argv[pos + 1], value, "value for {flag}");
        };
        expect_pair("--instance_prompt", "a photo of sks dog");
        expect_pair("--instance_data_dir", "/inputs");
        expect_pair("--output_dir", "/outputs");
        expect_pair("--resolution", "1024");
        expect_pair("--train_batch_size", "1");
        expect_pair("--gradient_accumulation_steps", "1");
        expect_pair("--learning_rate", "1e-4");
        expect_pair("--lr_scheduler", "constant");
        expect_pair("--lr_warmup_steps", "0");
        expect_pair("--max_train_steps", "500");
        expect_pair("--seed", "0");
    }

    #[test]
    fn test_build_command_targets_vendored_trainer() {
        let cmd = build_command(&args("a photo of sks dog"));
        assert_eq!(cmd.get_program(), "accelerate");
        assert_eq!(cmd.get_current_dir(), Some(Path::new(TRAINER_DIR)));
    }

    #[test]
    fn test_stage_accelerate_config_copies_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("default_config.yaml");
        let contents = b"compute_environment: LOCAL_MACHINE\nnum_processes: 1\n";
        std::fs::write(&source, contents).unwrap();

        let cache_dir = dir.path().join("cache/huggingface/accelerate");
        stage_accelerate_config(&source, &cache_dir).unwrap();

        let staged = std::fs::read(cache_dir.join(ACCELERATE_CONFIG)).unwrap();
        assert_eq!(staged, contents);
    }

    #[test]
    fn test_stage_accelerate_config_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = stage_accelerate_config(
            &dir.path().join("no-such-config.yaml"),
            &dir.path().join("cache"),
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::ConfigStaging { .. }));
    }
}
