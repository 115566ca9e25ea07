use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use candle_nn::Embedding;

use crate::config::LlmConfig;
use crate::kv_cache::KvCache;
use crate::models::{CausalLanguageModel, ForwardInputs, LoadStats};

/// What the adapter handed to the backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCall {
    pub num_tokens: usize,
    pub had_inputs_embeds: bool,
    pub had_vision_indexing: bool,
    pub had_text_indexing: bool,
}

#[derive(Default)]
struct Recorded {
    forwards: Vec<ForwardCall>,
    logits_calls: usize,
    loaded: Vec<String>,
}

/// A backbone that records its calls and returns zero hidden states/logits.
///
/// Clones share the recording, so a test can keep one handle while the
/// adapter owns another. The embedding table row `i` is filled with `i`.
#[derive(Clone)]
pub struct MockLanguageModel {
    config: LlmConfig,
    embeddings: Embedding,
    dtype: DType,
    device: Device,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockLanguageModel {
    pub fn new(config: LlmConfig, dtype: DType) -> Self {
        let device = Device::Cpu;
        let (vocab, hidden) = (config.vocab_size, config.hidden_size);
        let table = Tensor::arange(0f32, vocab as f32, &device)
            .and_then(|rows| rows.reshape((vocab, 1)))
            .and_then(|rows| rows.broadcast_as((vocab, hidden)))
            .and_then(|rows| rows.contiguous())
            .unwrap_or_else(|e| panic!("mock embedding table: {e}"));
        Self {
            embeddings: Embedding::new(table, hidden),
            config,
            dtype,
            device,
            recorded: Arc::default(),
        }
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn forward_calls(&self) -> Vec<ForwardCall> {
        self.recorded().forwards.clone()
    }

    pub fn last_forward(&self) -> Option<ForwardCall> {
        self.recorded().forwards.last().cloned()
    }

    pub fn logits_calls(&self) -> usize {
        self.recorded().logits_calls
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.recorded().loaded.clone()
    }
}

impl CausalLanguageModel for MockLanguageModel {
    fn forward(
        &self,
        inputs: &ForwardInputs,
        _past_key_values: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        let num_tokens = match &inputs.inputs_embeds {
            Some(embeds) => embeds.dim(1)?,
            None => inputs.input_ids.dim(1)?,
        };
        self.recorded().forwards.push(ForwardCall {
            num_tokens,
            had_inputs_embeds: inputs.inputs_embeds.is_some(),
            had_vision_indexing: inputs.vision_embedding_indexing.is_some(),
            had_text_indexing: inputs.text_embedding_indexing.is_some(),
        });
        Tensor::zeros(
            (1, num_tokens, self.config.hidden_size),
            DType::F32,
            &self.device,
        )
    }

    fn get_logits(&self, hidden_states: &Tensor) -> candle_core::Result<Tensor> {
        self.recorded().logits_calls += 1;
        let mut dims = hidden_states.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = self.config.vocab_size;
        }
        Tensor::zeros(dims, DType::F32, &self.device)
    }

    fn get_input_embeddings(&self) -> &Embedding {
        &self.embeddings
    }

    fn load_weights(
        &mut self,
        weights: &mut dyn Iterator<Item = (String, Tensor)>,
    ) -> candle_core::Result<LoadStats> {
        let mut recorded = self.recorded();
        let before = recorded.loaded.len();
        recorded.loaded.extend(weights.map(|(name, _)| name));
        Ok(LoadStats {
            loaded: recorded.loaded.len() - before,
            ..LoadStats::default()
        })
    }

    fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}
