//! LoRA (Low-Rank Adaptation) weight loading and merging
//!
//! LoRA specializes a frozen base model through small adapter matrices that
//! are merged into the base weights: W' = W + (alpha/rank) * (B @ A).
//!
//! This module parses the `pytorch_lora_weights.safetensors` file written by
//! the diffusers DreamBooth trainer (PEFT `lora_A`/`lora_B` key layout, with
//! the older `lora_down`/`lora_up` convention also accepted) and merges the
//! scaled deltas into the UNet weight map before the model is built.

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::InferenceError;

/// Individual LoRA weight pair for a single layer
#[derive(Debug)]
pub struct LoraWeight {
    /// Down projection matrix (A), shape [rank, in_features]
    pub lora_down: Tensor,
    /// Up projection matrix (B), shape [out_features, rank]
    pub lora_up: Tensor,
    /// Alpha scaling factor (defaults to rank if not stored)
    pub alpha: f32,
    /// Rank of the low-rank decomposition
    pub rank: usize,
}

/// A trained adapter: all weight pairs keyed by full layer name
/// (e.g. "unet.down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q")
#[derive(Debug)]
pub struct LoraAdapter {
    pub weights: HashMap<String, LoraWeight>,
}

impl LoraAdapter {
    /// Load an adapter from a safetensors file.
    ///
    /// Tensors are loaded as F32 on the given device so the merge matmul
    /// runs in full precision regardless of the base model dtype.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading LoRA adapter");

        let file_data = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(|e| InferenceError::AdapterLoad(e.to_string()))?;

        let tensors = SafeTensors::deserialize(&file_data)
            .map_err(|e| InferenceError::AdapterLoad(format!("{}: {e}", path.display())))?;

        let mut alpha_values: HashMap<String, f32> = HashMap::new();
        let mut down_tensors: HashMap<String, Tensor> = HashMap::new();
        let mut up_tensors: HashMap<String, Tensor> = HashMap::new();

        // First pass: collect down/up tensors and per-layer alphas
        for (key, _) in tensors.tensors() {
            if key.ends_with(".alpha") {
                let tensor = load_tensor(&tensors, &key, device)?;
                let alpha = tensor
                    .to_device(&Device::Cpu)
                    .and_then(|t| t.to_scalar::<f32>())
                    .map_err(|e| InferenceError::AdapterLoad(format!("bad alpha {key}: {e}")))?;
                let layer = key.strip_suffix(".alpha").unwrap().to_string();
                debug!(layer = %layer, alpha = alpha, "Extracted alpha value");
                alpha_values.insert(layer, alpha);
            } else if key.contains(".lora_down.") || key.contains(".lora_A.") {
                let tensor = load_tensor(&tensors, &key, device)?;
                down_tensors.insert(lora_base_name(&key), tensor);
            } else if key.contains(".lora_up.") || key.contains(".lora_B.") {
                let tensor = load_tensor(&tensors, &key, device)?;
                up_tensors.insert(lora_base_name(&key), tensor);
            }
        }

        // Second pass: pair them up
        let mut weights = HashMap::new();
        for (layer, lora_down) in down_tensors {
            let Some(lora_up) = up_tensors.remove(&layer) else {
                warn!(layer = %layer, "LoRA down tensor without matching up tensor");
                continue;
            };
            let rank = lora_down
                .dims()
                .first()
                .copied()
                .ok_or_else(|| InferenceError::AdapterLoad(format!("scalar tensor for {layer}")))?;
            let alpha = alpha_values.get(&layer).copied().unwrap_or(rank as f32);

            debug!(layer = %layer, rank = rank, alpha = alpha, "Loaded LoRA weight pair");
            weights.insert(
                layer,
                LoraWeight {
                    lora_down,
                    lora_up,
                    alpha,
                    rank,
                },
            );
        }
        for layer in up_tensors.keys() {
            warn!(layer = %layer, "LoRA up tensor without matching down tensor");
        }

        if weights.is_empty() {
            return Err(InferenceError::AdapterLoad(format!(
                "no LoRA weight pairs found in {}",
                path.display()
            )));
        }

        info!(
            path = %path.display(),
            weight_pairs = weights.len(),
            "LoRA adapter loaded"
        );
        Ok(Self { weights })
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// Merge all UNet-targeted weight pairs into a UNet weight map.
    ///
    /// `tensors` holds the base UNet weights keyed by their diffusers names
    /// (relative, no "unet." prefix). Returns the number of merged layers.
    /// Pairs targeting the text encoders are skipped; the DreamBooth SDXL
    /// trainer leaves the encoders frozen by default.
    pub fn merge_into_unet(
        &self,
        tensors: &mut HashMap<String, Tensor>,
    ) -> Result<usize, InferenceError> {
        let mut merged = 0;
        let mut skipped_text_encoder = 0;

        for (layer, weight) in &self.weights {
            let Some(relative) = layer.strip_prefix("unet.") else {
                if layer.starts_with("text_encoder") {
                    skipped_text_encoder += 1;
                } else {
                    warn!(layer = %layer, "Unrecognized LoRA layer prefix, skipping");
                }
                continue;
            };

            let base_key = format!("{relative}.weight");
            let Some(base) = tensors.get(&base_key) else {
                warn!(layer = %layer, "No matching base weight for LoRA layer");
                continue;
            };

            let scale = weight.alpha / weight.rank as f32;
            let delta = weight
                .lora_up
                .matmul(&weight.lora_down)?
                .affine(scale as f64, 0.0)?
                .to_dtype(base.dtype())?;
            let updated = base.add(&delta)?;
            tensors.insert(base_key, updated);
            merged += 1;
        }

        if skipped_text_encoder > 0 {
            warn!(
                layers = skipped_text_encoder,
                "Adapter contains text encoder weights; only UNet weights are merged"
            );
        }
        info!(merged = merged, "LoRA weights merged into UNet");
        Ok(merged)
    }
}

/// Load one tensor from the safetensors view as F32.
fn load_tensor(
    tensors: &SafeTensors,
    key: &str,
    device: &Device,
) -> Result<Tensor, InferenceError> {
    let view = tensors
        .tensor(key)
        .map_err(|e| InferenceError::AdapterLoad(format!("tensor not found {key}: {e}")))?;

    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)
        }
        safetensors::Dtype::BF16 => {
            let halfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)
        }
        other => {
            return Err(InferenceError::AdapterLoad(format!(
                "unsupported tensor dtype {other:?} for {key}"
            )))
        }
    };

    tensor
        .and_then(|t| t.to_dtype(DType::F32))
        .map_err(|e| InferenceError::AdapterLoad(format!("{key}: {e}")))
}

/// Strip the projection suffix from a LoRA tensor name.
/// "unet.down_blocks.1.attn1.to_q.lora_A.weight" -> "unet.down_blocks.1.attn1.to_q"
pub fn lora_base_name(key: &str) -> String {
    let key = key.strip_suffix(".weight").unwrap_or(key);
    for suffix in [".lora_down", ".lora_up", ".lora_A", ".lora_B"] {
        if let Some(pos) = key.rfind(suffix) {
            return key[..pos].to_string();
        }
    }
    key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_base_name_peft_keys() {
        assert_eq!(
            lora_base_name(
                "unet.down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q.lora_A.weight"
            ),
            "unet.down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q"
        );
        assert_eq!(
            lora_base_name("unet.mid_block.attentions.0.proj_out.lora_B.weight"),
            "unet.mid_block.attentions.0.proj_out"
        );
    }

    #[test]
    fn test_lora_base_name_legacy_keys() {
        assert_eq!(
            lora_base_name("unet.up_blocks.0.attn2.to_k.lora_down.weight"),
            "unet.up_blocks.0.attn2.to_k"
        );
        assert_eq!(lora_base_name("some_layer.lora_up.weight"), "some_layer");
    }

    #[test]
    fn test_lora_base_name_passthrough() {
        // Names without a recognized suffix come back unchanged (minus .weight)
        assert_eq!(lora_base_name("unet.conv_in.weight"), "unet.conv_in");
    }

    #[test]
    fn test_merge_applies_scaled_delta() {
        let device = Device::Cpu;
        // rank 2, 3 in, 3 out; B @ A of ones gives a matrix of 2s,
        // alpha/rank = 2 scales it to 4s.
        let down = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let up = Tensor::ones((3, 2), DType::F32, &device).unwrap();

        let mut weights = HashMap::new();
        weights.insert(
            "unet.mid_block.attn1.to_q".to_string(),
            LoraWeight {
                lora_down: down,
                lora_up: up,
                alpha: 4.0,
                rank: 2,
            },
        );
        let adapter = LoraAdapter { weights };

        let mut base = HashMap::new();
        base.insert(
            "mid_block.attn1.to_q.weight".to_string(),
            Tensor::zeros((3, 3), DType::F32, &device).unwrap(),
        );

        let merged = adapter.merge_into_unet(&mut base).unwrap();
        assert_eq!(merged, 1);

        let updated = base.get("mid_block.attn1.to_q.weight").unwrap();
        let values = updated.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 4.0).abs() < 1e-6));
    }

    #[test]
    fn test_merge_skips_unmatched_layers() {
        let device = Device::Cpu;
        let down = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let up = Tensor::ones((3, 2), DType::F32, &device).unwrap();

        let mut weights = HashMap::new();
        weights.insert(
            "unet.nonexistent.to_q".to_string(),
            LoraWeight {
                lora_down: down.clone(),
                lora_up: up.clone(),
                alpha: 2.0,
                rank: 2,
            },
        );
        weights.insert(
            "text_encoder.layers.0.q_proj".to_string(),
            LoraWeight {
                lora_down: down,
                lora_up: up,
                alpha: 2.0,
                rank: 2,
            },
        );
        let adapter = LoraAdapter { weights };

        let mut base: HashMap<String, Tensor> = HashMap::new();
        let merged = adapter.merge_into_unet(&mut base).unwrap();
        assert_eq!(merged, 0);
    }

    #[test]
    fn test_load_missing_file_is_adapter_error() {
        let err = LoraAdapter::load("does-not-exist.safetensors", &Device::Cpu).unwrap_err();
        assert!(matches!(err, InferenceError::AdapterLoad(_)));
    }
}
