//! InternVL chat model: text-generation side.
//!
//! InternVL pairs a vision encoder with a language model backbone (InternLM2,
//! Qwen2, Llama). Image features are encoded upstream and arrive in the step
//! context as precomputed embeddings; this type splices them into the token
//! embeddings and drives the backbone.
//!
//! Mono-InternVL uses an InternLM2-VE backbone whose layers route vision and
//! text tokens to different MLPs, so for it the vision/text token indexings
//! are forwarded to the backbone as well.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use tracing::{debug, info};

use crate::config::VlmConfig;
use crate::context::{StepContext, StepContextManager};
use crate::kv_cache::KvCache;
use crate::layers::{complement_indices, index_list, scatter_rows};

use super::weights::LoadStats;
use super::{build_model_from_hf_config, CausalLanguageModel, ForwardInputs, ModelError};

/// Backbone architecture of Mono-InternVL.
pub const MONO_LLM_ARCH: &str = "InternLM2VEForCausalLM";

/// Checkpoint prefix of the language model parameters.
pub const LANGUAGE_MODEL_PREFIX: &str = "language_model.";

pub struct InternVLChatModel {
    config: VlmConfig,
    ctx_mgr: Arc<StepContextManager>,
    language_model: Box<dyn CausalLanguageModel>,
    llm_arch_name: String,
    is_mono: bool,
}

impl InternVLChatModel {
    /// Build the backbone named by `config.llm_config`.
    pub fn new(
        config: &VlmConfig,
        ctx_mgr: Arc<StepContextManager>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, ModelError> {
        check_dtype(config.llm_architecture()?, dtype)?;
        let language_model = build_model_from_hf_config(&config.llm_config, dtype, device)?;
        Self::with_language_model(config, ctx_mgr, language_model)
    }

    /// Wrap an already constructed backbone.
    pub fn with_language_model(
        config: &VlmConfig,
        ctx_mgr: Arc<StepContextManager>,
        language_model: Box<dyn CausalLanguageModel>,
    ) -> Result<Self, ModelError> {
        let llm_arch_name = config.llm_architecture()?.to_string();
        check_dtype(&llm_arch_name, language_model.dtype())?;
        let is_mono = llm_arch_name == MONO_LLM_ARCH;

        info!(
            llm_arch = %llm_arch_name,
            is_mono,
            dtype = ?language_model.dtype(),
            "built InternVL language model"
        );

        Ok(Self {
            config: config.clone(),
            ctx_mgr,
            language_model,
            llm_arch_name,
            is_mono,
        })
    }

    pub fn config(&self) -> &VlmConfig {
        &self.config
    }

    pub fn ctx_mgr(&self) -> &Arc<StepContextManager> {
        &self.ctx_mgr
    }

    pub fn language_model(&self) -> &dyn CausalLanguageModel {
        self.language_model.as_ref()
    }

    pub fn llm_arch_name(&self) -> &str {
        &self.llm_arch_name
    }

    pub fn is_mono(&self) -> bool {
        self.is_mono
    }

    pub fn device(&self) -> &Device {
        self.language_model.device()
    }

    /// Run the backbone. Token indexings only reach Mono-InternVL backbones.
    pub fn forward(
        &self,
        inputs: &ForwardInputs,
        past_key_values: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        if self.is_mono {
            return self.language_model.forward(inputs, past_key_values);
        }
        if inputs.vision_embedding_indexing.is_none() && inputs.text_embedding_indexing.is_none() {
            return self.language_model.forward(inputs, past_key_values);
        }
        let stripped = ForwardInputs {
            vision_embedding_indexing: None,
            text_embedding_indexing: None,
            ..inputs.clone()
        };
        self.language_model.forward(&stripped, past_key_values)
    }

    pub fn get_logits(&self, hidden_states: &Tensor) -> candle_core::Result<Tensor> {
        self.language_model.get_logits(hidden_states)
    }

    pub fn get_input_embeddings(&self) -> &Embedding {
        self.language_model.get_input_embeddings()
    }

    /// Assemble backbone inputs for one step.
    ///
    /// Vision embeddings from `context` overwrite the token embeddings at
    /// `input_embedding_indexing`; the embeddings are computed from
    /// `input_ids` when `inputs_embeds` is not supplied.
    pub fn prepare_inputs_for_generation(
        &self,
        inputs_embeds: Option<Tensor>,
        context: &StepContext,
    ) -> candle_core::Result<ForwardInputs> {
        let input_ids = &context.input_ids;
        let mut inputs_embeds = inputs_embeds;
        let mut vision_embedding_indexing = context.input_embedding_indexing.clone();

        if let Some(vision_embeddings) = &context.input_embeddings {
            if vision_embeddings.dim(0)? > 0 {
                let Some(indexing) = vision_embedding_indexing.as_ref() else {
                    candle_core::bail!("vision embeddings supplied without input_embedding_indexing");
                };
                let embeds = match inputs_embeds.take() {
                    Some(embeds) => embeds,
                    None => self.get_input_embeddings().forward(input_ids)?,
                };
                inputs_embeds = Some(scatter_rows(&embeds, indexing, vision_embeddings)?);
            }
        }

        let mut inputs = ForwardInputs {
            input_ids: input_ids.clone(),
            position_ids: context.position_ids.clone(),
            attn_metadata: context.attn_metadata.clone(),
            inputs_embeds,
            vision_embedding_indexing: None,
            text_embedding_indexing: None,
        };

        if self.is_mono {
            if let Some(vision_idx) = vision_embedding_indexing.take() {
                let seq_len = input_ids.dim(1)?;
                let vision = index_list(&vision_idx)?;
                let text = complement_indices(seq_len, &vision);
                debug!(
                    vision_tokens = vision.len(),
                    text_tokens = text.len(),
                    "split mono step by modality"
                );
                if !vision.is_empty() {
                    inputs.vision_embedding_indexing = Some(vision_idx);
                }
                if !text.is_empty() {
                    let n = text.len();
                    inputs.text_embedding_indexing =
                        Some(Tensor::from_vec(text, n, input_ids.device())?);
                }
            }
        }
        Ok(inputs)
    }

    /// Same as [`Self::prepare_inputs_for_generation`] using the context the
    /// manager currently holds.
    pub fn prepare_inputs_from_current(
        &self,
        inputs_embeds: Option<Tensor>,
    ) -> Result<ForwardInputs, ModelError> {
        let context = self
            .ctx_mgr
            .current()
            .ok_or(ModelError::MissingStepContext)?;
        Ok(self.prepare_inputs_for_generation(inputs_embeds, &context)?)
    }

    /// Load checkpoint tensors. Only `language_model.*` entries are kept, with
    /// the prefix removed; vision tower and projector weights are dropped.
    pub fn load_weights<I>(&mut self, weights: I) -> candle_core::Result<LoadStats>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let mut dropped = 0usize;
        let mut language_weights = weights.into_iter().filter_map(|(name, tensor)| {
            match name.strip_prefix(LANGUAGE_MODEL_PREFIX) {
                Some(stripped) => Some((stripped.to_string(), tensor)),
                None => {
                    dropped += 1;
                    None
                }
            }
        });
        let stats = self.language_model.load_weights(&mut language_weights)?;
        drop(language_weights);

        debug!(dropped, "ignored non language model weights");
        info!(
            loaded = stats.loaded,
            skipped = stats.skipped,
            missing = stats.missing.len(),
            "loaded language model weights"
        );
        Ok(stats)
    }
}

fn check_dtype(llm_arch: &str, dtype: DType) -> Result<(), ModelError> {
    // Mono-InternVL is numerically unstable in FP16.
    if llm_arch == MONO_LLM_ARCH && dtype == DType::F16 {
        return Err(ModelError::UnsupportedDtype {
            arch: llm_arch.to_string(),
            dtype,
        });
    }
    Ok(())
}
