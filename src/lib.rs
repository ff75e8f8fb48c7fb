//! DreamBooth LoRA tools for Stable Diffusion XL
//!
//! Two workflows behind one CLI:
//!
//! - **Inference**: load the SDXL base model from `/app/models`, merge a
//!   trained LoRA adapter into the UNet, and render one seeded PNG with
//!   the Candle ML framework.
//! - **Training**: launch the vendored diffusers
//!   `train_dreambooth_lora_sdxl.py` script through `accelerate launch`
//!   with a fixed hyperparameter set, after staging the accelerate config
//!   into the HuggingFace cache.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dreambooth_lora::inference::{self, InferenceRequest};
//!
//! fn main() -> Result<(), dreambooth_lora::error::InferenceError> {
//!     let request = InferenceRequest {
//!         prompt: "a photo of sks dog".to_string(),
//!         num_inf_steps: 50,
//!         lora_model: "/inputs".into(),
//!         output: "/outputs".into(),
//!         seed: 42,
//!     };
//!     let path = inference::run(&request)?;
//!     println!("wrote {}", path.display());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod inference;
pub mod lora;
pub mod pipeline;
pub mod train;

/// Fixed base model location; externally provided, read-only.
pub const MODEL_DIR: &str = "/app/models";
