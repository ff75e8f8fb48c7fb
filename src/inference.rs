//! Inference workflow
//!
//! Loads the SDXL base model from the fixed model directory, merges the
//! trained LoRA adapter into the UNet, generates one image for the prompt
//! and writes it as `image_<seed>.png` in the output directory.

use candle_core::{DType, Device};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::InferenceError;
use crate::lora::LoraAdapter;
use crate::pipeline::SdxlPipeline;
use crate::MODEL_DIR;

/// File name the DreamBooth trainer gives the adapter weights.
pub const LORA_WEIGHTS_FILE: &str = "pytorch_lora_weights.safetensors";

/// One inference invocation.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub num_inf_steps: usize,
    pub lora_model: PathBuf,
    pub output: PathBuf,
    pub seed: u64,
}

impl InferenceRequest {
    /// Output file path, named deterministically from the seed.
    pub fn image_path(&self) -> PathBuf {
        self.output.join(format!("image_{}.png", self.seed))
    }
}

/// Run the inference workflow against the fixed base model directory.
pub fn run(request: &InferenceRequest) -> Result<PathBuf, InferenceError> {
    run_with_model_dir(request, Path::new(MODEL_DIR))
}

/// Run the inference workflow against an explicit base model directory.
pub fn run_with_model_dir(
    request: &InferenceRequest,
    model_dir: &Path,
) -> Result<PathBuf, InferenceError> {
    if !model_dir.is_dir() {
        return Err(InferenceError::ModelNotFound(
            model_dir.display().to_string(),
        ));
    }

    let lora_path = request.lora_model.join(LORA_WEIGHTS_FILE);
    if !lora_path.is_file() {
        return Err(InferenceError::AdapterLoad(format!(
            "adapter weights not found: {}",
            lora_path.display()
        )));
    }

    let device = Device::cuda_if_available(0)
        .map_err(|e| InferenceError::DeviceUnavailable(e.to_string()))?;
    let dtype = if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    };
    info!(device = ?device, dtype = ?dtype, "Device selected");

    let lora = LoraAdapter::load(&lora_path, &device)?;
    info!(weight_pairs = lora.weight_count(), "Adapter ready");

    let pipeline = SdxlPipeline::load(model_dir, Some(&lora), device, dtype)?;
    let png = pipeline.generate(&request.prompt, request.num_inf_steps, request.seed)?;

    std::fs::create_dir_all(&request.output).map_err(|e| InferenceError::ImageWrite {
        path: request.output.clone(),
        source: e,
    })?;
    let image_path = request.image_path();
    std::fs::write(&image_path, &png).map_err(|e| InferenceError::ImageWrite {
        path: image_path.clone(),
        source: e,
    })?;

    info!(path = %image_path.display(), "Image written");
    Ok(image_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(output: &Path, seed: u64) -> InferenceRequest {
        InferenceRequest {
            prompt: "a photo of sks dog".to_string(),
            num_inf_steps: 50,
            lora_model: PathBuf::from("/inputs"),
            output: output.to_path_buf(),
            seed,
        }
    }

    #[test]
    fn test_image_path_named_by_seed() {
        let req = request(Path::new("/outputs"), 42);
        assert_eq!(req.image_path(), PathBuf::from("/outputs/image_42.png"));

        let req = request(Path::new("/outputs"), 0);
        assert_eq!(req.image_path(), PathBuf::from("/outputs/image_0.png"));
    }

    #[test]
    fn test_missing_model_dir_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), 42);
        let missing = dir.path().join("no-such-model");
        let err = run_with_model_dir(&req, &missing).unwrap_err();
        assert!(matches!(err, InferenceError::ModelNotFound(_)));
    }

    #[test]
    fn test_missing_adapter_file_is_adapter_error() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("models");
        std::fs::create_dir_all(&model_dir).unwrap();

        let mut req = request(dir.path(), 42);
        req.lora_model = dir.path().join("adapter");
        std::fs::create_dir_all(&req.lora_model).unwrap();

        let err = run_with_model_dir(&req, &model_dir).unwrap_err();
        match err {
            InferenceError::AdapterLoad(msg) => {
                assert!(msg.contains(LORA_WEIGHTS_FILE));
            }
            other => panic!("expected AdapterLoad, got {other:?}"),
        }
    }
}
