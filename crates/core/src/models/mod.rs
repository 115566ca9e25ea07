//! Language model backbones and the InternVL adapter around them.

pub mod internlm2;
pub mod internvl;
pub mod llama;
pub mod weights;

use candle_core::{DType, Device, Tensor};
use candle_nn::Embedding;
use thiserror::Error;

use crate::config::{ConfigError, LlmConfig};
use crate::context::{position_list, AttentionMetadata};
use crate::kv_cache::KvCache;

pub use internlm2::InternLM2ForCausalLM;
pub use internvl::InternVLChatModel;
pub use llama::LlamaForCausalLM;
pub use weights::{LoadStats, WeightStore};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("{arch} does not support {dtype:?}; use BF16 instead")]
    UnsupportedDtype { arch: String, dtype: DType },
    #[error("no step context is set")]
    MissingStepContext,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("model load error: {0}")]
    Load(#[from] candle_core::Error),
}

/// Inputs of one language model forward pass.
///
/// Past key values travel separately as `&mut KvCache`.
#[derive(Debug, Clone)]
pub struct ForwardInputs {
    /// `[1, tokens]` token ids.
    pub input_ids: Tensor,
    /// `[1, tokens]` positions.
    pub position_ids: Tensor,
    pub attn_metadata: AttentionMetadata,
    /// `[1, tokens, hidden]`; takes precedence over `input_ids` when set.
    pub inputs_embeds: Option<Tensor>,
    /// Token positions handled by the visual expert.
    pub vision_embedding_indexing: Option<Tensor>,
    /// Token positions handled by the text MLP when vision tokens are present.
    pub text_embedding_indexing: Option<Tensor>,
}

impl ForwardInputs {
    pub fn new(input_ids: Tensor, position_ids: Tensor, attn_metadata: AttentionMetadata) -> Self {
        Self {
            input_ids,
            position_ids,
            attn_metadata,
            inputs_embeds: None,
            vision_embedding_indexing: None,
            text_embedding_indexing: None,
        }
    }

    pub fn with_inputs_embeds(mut self, inputs_embeds: Tensor) -> Self {
        self.inputs_embeds = Some(inputs_embeds);
        self
    }
}

/// Validate the step layout against `tokens` and the cache, and return
/// per-token positions. Nothing is written to the cache when this fails.
pub(crate) fn checked_positions(
    inputs: &ForwardInputs,
    tokens: usize,
    past_key_values: &KvCache,
) -> candle_core::Result<Vec<usize>> {
    inputs.attn_metadata.validate()?;
    let expected = inputs.attn_metadata.num_tokens();
    if tokens != expected {
        candle_core::bail!("step has {tokens} tokens but attention metadata covers {expected}");
    }
    let positions = position_list(&inputs.position_ids)?;
    if positions.len() != tokens {
        candle_core::bail!(
            "position_ids has {} entries for {tokens} tokens",
            positions.len()
        );
    }
    past_key_values.check_history(
        &inputs.attn_metadata.cache_slots,
        &inputs.attn_metadata.history_lengths,
    )?;
    Ok(positions)
}

/// A decoder-only language model the serving runtime can drive.
pub trait CausalLanguageModel: Send + Sync {
    /// Run the decoder and return final hidden states `[1, tokens, hidden]`.
    fn forward(
        &self,
        inputs: &ForwardInputs,
        past_key_values: &mut KvCache,
    ) -> candle_core::Result<Tensor>;

    /// Project hidden states to vocabulary logits.
    fn get_logits(&self, hidden_states: &Tensor) -> candle_core::Result<Tensor>;

    fn get_input_embeddings(&self) -> &Embedding;

    /// Load named parameters (checkpoint names relative to this model).
    fn load_weights(
        &mut self,
        weights: &mut dyn Iterator<Item = (String, Tensor)>,
    ) -> candle_core::Result<LoadStats>;

    fn config(&self) -> &LlmConfig;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;
}

/// Construct the language model named by `cfg.architectures[0]`.
pub fn build_model_from_hf_config(
    cfg: &LlmConfig,
    dtype: DType,
    device: &Device,
) -> Result<Box<dyn CausalLanguageModel>, ModelError> {
    let arch = cfg.architecture()?;
    cfg.activation()?;
    cfg.rope_position_scale()?;
    match arch {
        "InternLM2ForCausalLM" => Ok(Box::new(InternLM2ForCausalLM::new(cfg, dtype, device)?)),
        "InternLM2VEForCausalLM" => Ok(Box::new(InternLM2ForCausalLM::new_visual_expert(
            cfg, dtype, device,
        )?)),
        "LlamaForCausalLM" | "InternLM3ForCausalLM" => {
            Ok(Box::new(LlamaForCausalLM::new(cfg, dtype, device)?))
        }
        "Qwen2ForCausalLM" => Ok(Box::new(LlamaForCausalLM::new_qwen2(cfg, dtype, device)?)),
        other => Err(ModelError::UnsupportedArchitecture(other.into())),
    }
}
