//! Llama-style decoder with split q/k/v projections.
//!
//! Serves as the backbone for InternVL checkpoints built on Llama,
//! InternLM3 and Qwen2 (Qwen2 always carries q/k/v bias).

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_b, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use crate::config::LlmConfig;
use crate::context::AttentionMetadata;
use crate::kv_cache::KvCache;
use crate::layers::{varlen_attention, AttentionShape, MlpNames, RotaryEmbedding, SwiGluMlp};

use super::internlm2::attention_shape;
use super::weights::{LoadStats, WeightStore};
use super::{checked_positions, CausalLanguageModel, ForwardInputs};

#[derive(Debug, Clone, Copy)]
struct ProjectionBias {
    qkv: bool,
    o: bool,
}

struct LlamaAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    shape: AttentionShape,
}

impl LlamaAttention {
    fn new(cfg: &LlmConfig, bias: ProjectionBias, vb: VarBuilder) -> Result<Self> {
        let shape = attention_shape(cfg)?;
        let q_dim = shape.num_heads * shape.head_dim;
        let kv_dim = shape.num_kv_heads * shape.head_dim;
        Ok(Self {
            q_proj: linear_b(cfg.hidden_size, q_dim, bias.qkv, vb.pp("q_proj"))?,
            k_proj: linear_b(cfg.hidden_size, kv_dim, bias.qkv, vb.pp("k_proj"))?,
            v_proj: linear_b(cfg.hidden_size, kv_dim, bias.qkv, vb.pp("v_proj"))?,
            o_proj: linear_b(q_dim, cfg.hidden_size, bias.o, vb.pp("o_proj"))?,
            shape,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        positions: &[usize],
        rotary: &RotaryEmbedding,
        attn_metadata: &AttentionMetadata,
        cache: &mut KvCache,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let AttentionShape {
            num_heads,
            num_kv_heads,
            head_dim,
        } = self.shape;
        let xs = xs.squeeze(0)?;
        let tokens = xs.dim(0)?;

        let q = self
            .q_proj
            .forward(&xs)?
            .reshape((tokens, num_heads, head_dim))?;
        let k = self
            .k_proj
            .forward(&xs)?
            .reshape((tokens, num_kv_heads, head_dim))?;
        let v = self
            .v_proj
            .forward(&xs)?
            .reshape((tokens, num_kv_heads, head_dim))?;

        let (q, k) = rotary.apply(&q, &k, positions)?;
        let attn = varlen_attention(&q, &k, &v, attn_metadata, cache, layer_idx, self.shape)?;
        self.o_proj.forward(&attn)?.unsqueeze(0)
    }
}

struct LlamaDecoderLayer {
    self_attn: LlamaAttention,
    mlp: SwiGluMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    fn new(cfg: &LlmConfig, bias: ProjectionBias, vb: VarBuilder) -> Result<Self> {
        let act = cfg.activation().map_err(candle_core::Error::wrap)?;
        Ok(Self {
            self_attn: LlamaAttention::new(cfg, bias, vb.pp("self_attn"))?,
            mlp: SwiGluMlp::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                MlpNames::LLAMA,
                act,
                vb.pp("mlp"),
            )?,
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        positions: &[usize],
        rotary: &RotaryEmbedding,
        attn_metadata: &AttentionMetadata,
        cache: &mut KvCache,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let residual = xs;
        let h = self.input_layernorm.forward(xs)?;
        let h = self
            .self_attn
            .forward(&h, positions, rotary, attn_metadata, cache, layer_idx)?;
        let xs = (h + residual)?;
        let residual = &xs;
        let h = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&xs)?)?;
        residual + h
    }
}

pub struct LlamaForCausalLM {
    embed_tokens: Embedding,
    layers: Vec<LlamaDecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlmConfig,
    weights: WeightStore,
}

impl LlamaForCausalLM {
    pub fn new(cfg: &LlmConfig, dtype: DType, device: &Device) -> Result<Self> {
        let bias = cfg.attention_bias.unwrap_or(false);
        Self::build(cfg, ProjectionBias { qkv: bias, o: bias }, dtype, device)
    }

    pub fn new_qwen2(cfg: &LlmConfig, dtype: DType, device: &Device) -> Result<Self> {
        Self::build(cfg, ProjectionBias { qkv: true, o: false }, dtype, device)
    }

    fn build(cfg: &LlmConfig, bias: ProjectionBias, dtype: DType, device: &Device) -> Result<Self> {
        let weights = WeightStore::new(dtype, device);
        let vb = weights.var_builder();
        let vb_m = vb.pp("model");

        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;
        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| LlamaDecoderLayer::new(cfg, bias, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_b(cfg.hidden_size, cfg.vocab_size, false, vb.pp("lm_head"))?
        };
        let rotary = RotaryEmbedding::from_config(cfg, dtype, device)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config: cfg.clone(),
            weights,
        })
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.weights.names()
    }
}

impl CausalLanguageModel for LlamaForCausalLM {
    fn forward(&self, inputs: &ForwardInputs, past_key_values: &mut KvCache) -> Result<Tensor> {
        let mut xs = match &inputs.inputs_embeds {
            Some(embeds) => embeds.clone(),
            None => self.embed_tokens.forward(&inputs.input_ids)?,
        };
        let positions = checked_positions(inputs, xs.dim(1)?, past_key_values)?;
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(
                &xs,
                &positions,
                &self.rotary,
                &inputs.attn_metadata,
                past_key_values,
                layer_idx,
            )?;
        }
        self.norm.forward(&xs)
    }

    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.lm_head.forward(hidden_states)
    }

    fn get_input_embeddings(&self) -> &Embedding {
        &self.embed_tokens
    }

    fn load_weights(
        &mut self,
        weights: &mut dyn Iterator<Item = (String, Tensor)>,
    ) -> Result<LoadStats> {
        self.weights.load(weights)
    }

    fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        self.weights.device()
    }

    fn dtype(&self) -> DType {
        self.weights.dtype()
    }
}
