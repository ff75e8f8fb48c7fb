//! Stable Diffusion XL generation pipeline
//!
//! Orchestrates the complete image generation workflow:
//! 1. Encode prompt with both CLIP text encoders
//! 2. Denoise latents with the UNet (classifier-free guidance)
//! 3. VAE decode to RGB
//! 4. Encode as PNG
//!
//! All components load from a local diffusers-layout model directory;
//! LoRA deltas are merged into the UNet weight map before the model is
//! built, so generation itself carries no adapter overhead.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    clip,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
};
use std::path::Path;
use tracing::{debug, info};

use crate::error::InferenceError;
use crate::lora::LoraAdapter;

/// SDXL native resolution; the DreamBooth trainer fine-tunes at 1024 too.
pub const WIDTH: usize = 1024;
pub const HEIGHT: usize = 1024;

const GUIDANCE_SCALE: f64 = 5.0;
const VAE_SCALE: f64 = 0.13025;

/// One CLIP text encoder with its tokenizer.
struct ClipEncoder {
    tokenizer: tokenizers::Tokenizer,
    model: clip::ClipTextTransformer,
    config: clip::Config,
}

impl ClipEncoder {
    fn load(
        model_dir: &Path,
        tokenizer_subdir: &str,
        encoder_subdir: &'static str,
        config: clip::Config,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, InferenceError> {
        let tokenizer = load_clip_tokenizer(&model_dir.join(tokenizer_subdir))?;

        let weights = component_weights(
            model_dir,
            encoder_subdir,
            &["model.fp16.safetensors", "model.safetensors"],
        )?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], dtype, device).map_err(|e| {
                InferenceError::ModelLoad {
                    component: encoder_subdir,
                    message: e.to_string(),
                }
            })?
        };
        let model = clip::ClipTextTransformer::new(vb, &config).map_err(|e| {
            InferenceError::ModelLoad {
                component: encoder_subdir,
                message: e.to_string(),
            }
        })?;

        info!(component = encoder_subdir, "Text encoder loaded");
        Ok(Self {
            tokenizer,
            model,
            config,
        })
    }

    /// Encode a prompt to hidden states of shape [1, 77, d_model].
    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor, InferenceError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

        let mut tokens = encoding.get_ids().to_vec();
        let max_len = self.config.max_position_embeddings;
        if tokens.len() > max_len {
            debug!(tokens = tokens.len(), max = max_len, "Prompt truncated");
            tokens.truncate(max_len);
        }

        let pad_token = self.config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *self
            .tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| {
                InferenceError::Tokenizer(format!("pad token {pad_token:?} not in vocab"))
            })?;
        tokens.resize(max_len, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Complete SDXL generation pipeline.
pub struct SdxlPipeline {
    clip: ClipEncoder,
    clip2: ClipEncoder,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
}

impl SdxlPipeline {
    /// Load all components from a diffusers-layout model directory,
    /// merging the adapter into the UNet weights if one is given.
    pub fn load(
        model_dir: &Path,
        lora: Option<&LoraAdapter>,
        device: Device,
        dtype: DType,
    ) -> Result<Self, InferenceError> {
        info!(model_dir = %model_dir.display(), "Initializing SDXL pipeline");

        let clip = ClipEncoder::load(
            model_dir,
            "tokenizer",
            "text_encoder",
            clip::Config::sdxl(),
            &device,
            dtype,
        )?;
        let clip2 = ClipEncoder::load(
            model_dir,
            "tokenizer_2",
            "text_encoder_2",
            clip::Config::sdxl2(),
            &device,
            dtype,
        )?;

        let unet = load_unet(model_dir, lora, &device, dtype)?;
        let vae = load_vae(model_dir, &device, dtype)?;

        info!("Pipeline initialized");
        Ok(Self {
            clip,
            clip2,
            unet,
            vae,
            device,
            dtype,
        })
    }

    /// Generate one image and return it as PNG bytes.
    ///
    /// The device RNG is seeded from `seed`, so identical prompt, step
    /// count and seed reproduce the same image on the same backend.
    pub fn generate(
        &self,
        prompt: &str,
        steps: usize,
        seed: u64,
    ) -> Result<Vec<u8>, InferenceError> {
        info!(
            prompt_preview = %prompt_preview(prompt),
            steps = steps,
            seed = seed,
            "Starting generation"
        );

        if let Err(e) = self.device.set_seed(seed) {
            debug!(error = %e, "Could not set device seed");
        }

        info!("Step 1/3: Encoding prompt");
        let text_embeddings = self.encode_prompt(prompt)?;
        debug!(shape = ?text_embeddings.dims(), "Text embeddings");

        info!("Step 2/3: Denoising ({} steps)", steps);
        let latents = self.denoise(&text_embeddings, steps)?;
        debug!(shape = ?latents.dims(), "Latents generated");

        info!("Step 3/3: Decoding latents to RGB");
        let rgb = self.decode_latents(&latents)?;
        let png = encode_png(&rgb, WIDTH as u32, HEIGHT as u32)?;

        info!(size_kb = png.len() / 1024, "Generation complete");
        Ok(png)
    }

    /// Encode the prompt (and the empty unconditional prompt) with both
    /// encoders and concatenate along the hidden dimension.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor, InferenceError> {
        let mut per_encoder = Vec::with_capacity(2);
        for encoder in [&self.clip, &self.clip2] {
            let cond = encoder.encode(prompt, &self.device)?;
            let uncond = encoder.encode("", &self.device)?;
            per_encoder.push(Tensor::cat(&[uncond, cond], 0)?);
        }
        let embeddings = Tensor::cat(&[&per_encoder[0], &per_encoder[1]], D::Minus1)?;
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    /// Classifier-free-guided Euler-ancestral denoising loop.
    fn denoise(&self, text_embeddings: &Tensor, steps: usize) -> Result<Tensor, InferenceError> {
        let mut scheduler = build_scheduler(steps)?;

        let latent_shape = (1, 4, HEIGHT / 8, WIDTH / 8);
        let mut latents = Tensor::randn(0f32, 1f32, latent_shape, &self.device)?
            .to_dtype(self.dtype)?;
        latents = (latents * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();
        for (i, &t) in timesteps.iter().enumerate() {
            let latent_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, t)?;

            let noise_pred = self.unet.forward(&latent_input, t as f64, text_embeddings)?;

            let chunks = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&chunks[0], &chunks[1]);
            let guided = (uncond + ((cond - uncond)? * GUIDANCE_SCALE)?)?;

            latents = scheduler.step(&guided, t, &latents)?;

            if (i + 1) % 5 == 0 || i + 1 == total {
                debug!(step = i + 1, total = total, "Denoising progress");
            }
        }

        Ok(latents)
    }

    /// VAE decode and convert to interleaved RGB bytes.
    fn decode_latents(&self, latents: &Tensor) -> Result<Vec<u8>, InferenceError> {
        let latents = (latents / VAE_SCALE)?;
        let image = self.vae.decode(&latents)?;

        let image = ((image / 2.0)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1f32)? * 255.0)?.to_dtype(DType::U8)?;

        let rgb = image
            .squeeze(0)?
            .permute((1, 2, 0))?
            .flatten_all()?
            .to_vec1::<u8>()?;
        Ok(rgb)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Euler-ancestral scheduler for the requested step count.
fn build_scheduler(steps: usize) -> Result<Box<dyn Scheduler>, InferenceError> {
    Ok(EulerAncestralDiscreteSchedulerConfig::default().build(steps)?)
}

/// Log-safe prompt preview, truncated on a char boundary.
fn prompt_preview(prompt: &str) -> String {
    prompt.chars().take(50).collect()
}

/// Encode RGB data as PNG.
fn encode_png(rgb_data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, InferenceError> {
    use image::{ImageBuffer, RgbImage};
    use std::io::Cursor;

    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb_data.to_vec()).ok_or_else(
        || InferenceError::ImageEncode("decoded image has unexpected dimensions".to_string()),
    )?;

    let mut png_data = Cursor::new(Vec::new());
    img.write_to(&mut png_data, image::ImageFormat::Png)
        .map_err(|e| InferenceError::ImageEncode(e.to_string()))?;

    Ok(png_data.into_inner())
}

/// Load the UNet, merging LoRA deltas into its weight map first.
fn load_unet(
    model_dir: &Path,
    lora: Option<&LoraAdapter>,
    device: &Device,
    dtype: DType,
) -> Result<UNet2DConditionModel, InferenceError> {
    let weights = component_weights(
        model_dir,
        "unet",
        &[
            "diffusion_pytorch_model.fp16.safetensors",
            "diffusion_pytorch_model.safetensors",
        ],
    )?;

    info!(path = %weights.display(), "Loading UNet weights");
    let mut tensors =
        candle_core::safetensors::load(&weights, device).map_err(|e| InferenceError::ModelLoad {
            component: "unet",
            message: e.to_string(),
        })?;
    for tensor in tensors.values_mut() {
        *tensor = tensor
            .to_dtype(dtype)
            .map_err(|e| InferenceError::ModelLoad {
                component: "unet",
                message: e.to_string(),
            })?;
    }

    if let Some(adapter) = lora {
        adapter.merge_into_unet(&mut tensors)?;
    }

    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    let unet = UNet2DConditionModel::new(vb, 4, 4, false, sdxl_unet_config()).map_err(|e| {
        InferenceError::ModelLoad {
            component: "unet",
            message: e.to_string(),
        }
    })?;

    info!("UNet loaded");
    Ok(unet)
}

fn load_vae(model_dir: &Path, device: &Device, dtype: DType) -> Result<AutoEncoderKL, InferenceError> {
    let weights = component_weights(
        model_dir,
        "vae",
        &[
            "diffusion_pytorch_model.fp16.safetensors",
            "diffusion_pytorch_model.safetensors",
        ],
    )?;

    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights], dtype, device).map_err(|e| {
            InferenceError::ModelLoad {
                component: "vae",
                message: e.to_string(),
            }
        })?
    };
    let config = vae_config(&model_dir.join("vae"));
    let vae = AutoEncoderKL::new(vb, 3, 3, config).map_err(|e| InferenceError::ModelLoad {
        component: "vae",
        message: e.to_string(),
    })?;

    info!("VAE loaded");
    Ok(vae)
}

/// Resolve a component's safetensors file, trying fp16 variants first.
fn component_weights(
    model_dir: &Path,
    component: &'static str,
    candidates: &[&str],
) -> Result<std::path::PathBuf, InferenceError> {
    let dir = model_dir.join(component);
    for name in candidates {
        let file = dir.join(name);
        if file.is_file() {
            return Ok(file);
        }
    }
    Err(InferenceError::ModelNotFound(format!(
        "no safetensors file for {component} in {}",
        dir.display()
    )))
}

/// Load a CLIP tokenizer from a diffusers tokenizer directory.
///
/// Tries `tokenizer.json` first, then the older `vocab.json` + `merges.txt`
/// BPE format with CLIP's start/end token post-processing.
fn load_clip_tokenizer(dir: &Path) -> Result<tokenizers::Tokenizer, InferenceError> {
    use tokenizers::models::bpe::BPE;
    use tokenizers::pre_tokenizers::byte_level::ByteLevel;
    use tokenizers::processors::template::TemplateProcessing;

    let tokenizer_json = dir.join("tokenizer.json");
    if tokenizer_json.is_file() {
        return tokenizers::Tokenizer::from_file(&tokenizer_json)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()));
    }

    let vocab_json = dir.join("vocab.json");
    let merges_txt = dir.join("merges.txt");
    if !vocab_json.is_file() || !merges_txt.is_file() {
        return Err(InferenceError::ModelNotFound(format!(
            "no tokenizer files in {}",
            dir.display()
        )));
    }

    let bpe = BPE::from_file(
        vocab_json
            .to_str()
            .ok_or_else(|| InferenceError::Tokenizer("invalid vocab path".into()))?,
        merges_txt
            .to_str()
            .ok_or_else(|| InferenceError::Tokenizer("invalid merges path".into()))?,
    )
    .unk_token("<|endoftext|>".to_string())
    .build()
    .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

    let mut tokenizer = tokenizers::Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(Some(ByteLevel::new(false, true, false)));

    // CLIP wraps every prompt in <|startoftext|> (49406) / <|endoftext|> (49407)
    let template = TemplateProcessing::builder()
        .try_single("<|startoftext|> $A <|endoftext|>")
        .map_err(|e| InferenceError::Tokenizer(e.to_string()))?
        .special_tokens(vec![("<|startoftext|>", 49406), ("<|endoftext|>", 49407)])
        .build()
        .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
    tokenizer.with_post_processor(Some(template));

    Ok(tokenizer)
}

/// SDXL base UNet configuration (diffusers stabilityai/stable-diffusion-xl-base-1.0).
fn sdxl_unet_config() -> UNet2DConditionModelConfig {
    UNet2DConditionModelConfig {
        blocks: vec![
            BlockConfig {
                out_channels: 320,
                use_cross_attn: None,
                attention_head_dim: 5,
            },
            BlockConfig {
                out_channels: 640,
                use_cross_attn: Some(2),
                attention_head_dim: 10,
            },
            BlockConfig {
                out_channels: 1280,
                use_cross_attn: Some(10),
                attention_head_dim: 20,
            },
        ],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.0,
        layers_per_block: 2,
        mid_block_scale_factor: 1.0,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: true,
    }
}

/// SDXL VAE configuration, honoring config.json overrides when present.
fn vae_config(vae_dir: &Path) -> AutoEncoderKLConfig {
    #[derive(serde::Deserialize)]
    struct VaeConfigJson {
        #[serde(default)]
        block_out_channels: Option<Vec<usize>>,
        #[serde(default)]
        layers_per_block: Option<usize>,
        #[serde(default)]
        latent_channels: Option<usize>,
        #[serde(default)]
        norm_num_groups: Option<usize>,
    }

    let defaults = AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 4,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    };

    let config_path = vae_dir.join("config.json");
    let Ok(config_str) = std::fs::read_to_string(&config_path) else {
        return defaults;
    };
    match serde_json::from_str::<VaeConfigJson>(&config_str) {
        Ok(json) => AutoEncoderKLConfig {
            block_out_channels: json
                .block_out_channels
                .unwrap_or(defaults.block_out_channels),
            layers_per_block: json.layers_per_block.unwrap_or(defaults.layers_per_block),
            latent_channels: json.latent_channels.unwrap_or(defaults.latent_channels),
            norm_num_groups: json.norm_num_groups.unwrap_or(defaults.norm_num_groups),
            use_quant_conv: true,
            use_post_quant_conv: true,
        },
        Err(e) => {
            debug!(error = %e, path = %config_path.display(), "Unparseable VAE config, using defaults");
            defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_weights_prefers_fp16_variant() {
        let dir = tempfile::tempdir().unwrap();
        let unet_dir = dir.path().join("unet");
        std::fs::create_dir_all(&unet_dir).unwrap();
        std::fs::write(unet_dir.join("diffusion_pytorch_model.safetensors"), b"x").unwrap();
        std::fs::write(unet_dir.join("diffusion_pytorch_model.fp16.safetensors"), b"x").unwrap();

        let resolved = component_weights(
            dir.path(),
            "unet",
            &[
                "diffusion_pytorch_model.fp16.safetensors",
                "diffusion_pytorch_model.safetensors",
            ],
        )
        .unwrap();
        assert!(resolved.ends_with("unet/diffusion_pytorch_model.fp16.safetensors"));
    }

    #[test]
    fn test_component_weights_missing_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = component_weights(dir.path(), "vae", &["diffusion_pytorch_model.safetensors"])
            .unwrap_err();
        assert!(matches!(err, InferenceError::ModelNotFound(_)));
    }

    #[test]
    fn test_vae_config_defaults_without_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = vae_config(dir.path());
        assert_eq!(config.block_out_channels, vec![128, 256, 512, 512]);
        assert_eq!(config.latent_channels, 4);
    }

    #[test]
    fn test_prompt_preview_respects_char_boundaries() {
        // 17 three-byte chars = 51 bytes; a byte-indexed cut at 50 would
        // land mid-character
        let prompt = "€".repeat(17);
        assert_eq!(prompt_preview(&prompt), prompt);

        let long = "a".repeat(80);
        assert_eq!(prompt_preview(&long).len(), 50);

        assert_eq!(prompt_preview("short"), "short");
    }

    #[test]
    fn test_scheduler_matches_requested_steps() {
        let scheduler = build_scheduler(8).unwrap();
        assert_eq!(scheduler.timesteps().len(), 8);
    }

    #[test]
    fn test_vae_config_honors_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"latent_channels": 8, "norm_num_groups": 16}"#,
        )
        .unwrap();
        let config = vae_config(dir.path());
        assert_eq!(config.latent_channels, 8);
        assert_eq!(config.norm_num_groups, 16);
        assert_eq!(config.layers_per_block, 2);
    }
}
