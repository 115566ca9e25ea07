//! InternLM2 decoder, optionally with a Visual Expert.
//!
//! InternLM2 fuses the query/key/value projections into one `wqkv` matrix
//! laid out per KV group as `[q_0 .. q_{g-1}, k, v]`. The Visual Expert
//! variant (Mono-InternVL's backbone) adds a second MLP, `feed_forward_ve`,
//! per layer. Tokens listed in `vision_embedding_indexing` go through it while
//! the rest use the regular `feed_forward`; attention weights are shared.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_b, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use crate::config::LlmConfig;
use crate::context::AttentionMetadata;
use crate::kv_cache::KvCache;
use crate::layers::{
    gather_rows, scatter_rows, varlen_attention, AttentionShape, MlpNames, RotaryEmbedding,
    SwiGluMlp,
};

use super::weights::{LoadStats, WeightStore};
use super::{checked_positions, CausalLanguageModel, ForwardInputs};

// ─── Attention ───────────────────────────────────────────────────────────────

struct InternLM2Attention {
    wqkv: Linear,
    wo: Linear,
    shape: AttentionShape,
}

impl InternLM2Attention {
    fn new(cfg: &LlmConfig, vb: VarBuilder) -> Result<Self> {
        let shape = attention_shape(cfg)?;
        let bias = cfg.attention_bias.unwrap_or(false);
        let qkv_out = (shape.num_heads + 2 * shape.num_kv_heads) * shape.head_dim;
        let wqkv = linear_b(cfg.hidden_size, qkv_out, bias, vb.pp("wqkv"))?;
        let wo = linear_b(
            shape.num_heads * shape.head_dim,
            cfg.hidden_size,
            bias,
            vb.pp("wo"),
        )?;
        Ok(Self { wqkv, wo, shape })
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
        let tokens = xs.dim(1)?;
        let groups = num_heads / num_kv_heads;

        let qkv = self
            .wqkv
            .forward(&xs.squeeze(0)?)?
            .reshape((tokens, num_kv_heads, groups + 2, head_dim))?;
        let q = qkv
            .narrow(2, 0, groups)?
            .contiguous()?
            .reshape((tokens, num_heads, head_dim))?;
        let k = qkv.narrow(2, groups, 1)?.squeeze(2)?.contiguous()?;
        let v = qkv.narrow(2, groups + 1, 1)?.squeeze(2)?.contiguous()?;

        let (q, k) = rotary.apply(&q, &k, positions)?;
        let attn = varlen_attention(&q, &k, &v, attn_metadata, cache, layer_idx, self.shape)?;
        self.wo.forward(&attn)?.unsqueeze(0)
    }
}

pub(super) fn attention_shape(cfg: &LlmConfig) -> Result<AttentionShape> {
    let num_heads = cfg.num_attention_heads;
    let num_kv_heads = cfg.num_kv_heads();
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        candle_core::bail!(
            "num_attention_heads ({num_heads}) must be a multiple of num_key_value_heads ({num_kv_heads})"
        );
    }
    Ok(AttentionShape {
        num_heads,
        num_kv_heads,
        head_dim: cfg.head_dim(),
    })
}

// ─── Decoder layer ───────────────────────────────────────────────────────────

struct InternLM2DecoderLayer {
    attention: InternLM2Attention,
    feed_forward: SwiGluMlp,
    feed_forward_ve: Option<SwiGluMlp>,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
}

impl InternLM2DecoderLayer {
    fn new(cfg: &LlmConfig, visual_expert: bool, vb: VarBuilder) -> Result<Self> {
        let act = cfg.activation().map_err(candle_core::Error::wrap)?;
        let attention = InternLM2Attention::new(cfg, vb.pp("attention"))?;
        let feed_forward = SwiGluMlp::new(
            cfg.hidden_size,
            cfg.intermediate_size,
            MlpNames::INTERNLM2,
            act,
            vb.pp("feed_forward"),
        )?;
        let feed_forward_ve = if visual_expert {
            Some(SwiGluMlp::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                MlpNames::INTERNLM2,
                act,
                vb.pp("feed_forward_ve"),
            )?)
        } else {
            None
        };
        let attention_norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("attention_norm"))?;
        let ffn_norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("ffn_norm"))?;
        Ok(Self {
            attention,
            feed_forward,
            feed_forward_ve,
            attention_norm,
            ffn_norm,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        inputs: &ForwardInputs,
        positions: &[usize],
        rotary: &RotaryEmbedding,
        cache: &mut KvCache,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let residual = xs;
        let h = self.attention_norm.forward(xs)?;
        let h = self.attention.forward(
            &h,
            positions,
            rotary,
            &inputs.attn_metadata,
            cache,
            layer_idx,
        )?;
        let xs = (h + residual)?;

        let residual = &xs;
        let h = self.ffn_norm.forward(&xs)?;
        let h = self.mlp(
            &h,
            inputs.vision_embedding_indexing.as_ref(),
            inputs.text_embedding_indexing.as_ref(),
        )?;
        residual + h
    }

    /// Route vision rows through the expert MLP. Without vision indexing every
    /// row is text; without text indexing every row is vision.
    fn mlp(
        &self,
        xs: &Tensor,
        vision_indexing: Option<&Tensor>,
        text_indexing: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (Some(expert), Some(vision_idx)) = (&self.feed_forward_ve, vision_indexing) else {
            return self.feed_forward.forward(xs);
        };
        let vision_out = expert.forward(&gather_rows(xs, vision_idx)?)?;
        let out = scatter_rows(xs, vision_idx, &vision_out)?;
        match text_indexing {
            Some(text_idx) => {
                let text_out = self.feed_forward.forward(&gather_rows(xs, text_idx)?)?;
                scatter_rows(&out, text_idx, &text_out)
            }
            None => Ok(out),
        }
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

pub struct InternLM2ForCausalLM {
    tok_embeddings: Embedding,
    layers: Vec<InternLM2DecoderLayer>,
    norm: RmsNorm,
    output: Linear,
    rotary: RotaryEmbedding,
    config: LlmConfig,
    weights: WeightStore,
    visual_expert: bool,
}

impl InternLM2ForCausalLM {
    pub fn new(cfg: &LlmConfig, dtype: DType, device: &Device) -> Result<Self> {
        Self::build(cfg, false, dtype, device)
    }

    /// InternLM2-VE: every layer carries a `feed_forward_ve` expert MLP.
    pub fn new_visual_expert(cfg: &LlmConfig, dtype: DType, device: &Device) -> Result<Self> {
        Self::build(cfg, true, dtype, device)
    }

    fn build(cfg: &LlmConfig, visual_expert: bool, dtype: DType, device: &Device) -> Result<Self> {
        let weights = WeightStore::new(dtype, device);
        let vb = weights.var_builder();
        let vb_m = vb.pp("model");

        let tok_embeddings = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("tok_embeddings"))?;

        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| InternLM2DecoderLayer::new(cfg, visual_expert, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let output = if cfg.tie_word_embeddings {
            Linear::new(tok_embeddings.embeddings().clone(), None)
        } else {
            linear_b(cfg.hidden_size, cfg.vocab_size, false, vb.pp("output"))?
        };

        let rotary = RotaryEmbedding::from_config(cfg, dtype, device)?;

        Ok(Self {
            tok_embeddings,
            layers,
            norm,
            output,
            rotary,
            config: cfg.clone(),
            weights,
            visual_expert,
        })
    }

    pub fn has_visual_expert(&self) -> bool {
        self.visual_expert
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Names of all parameters, as they appear in a checkpoint.
    pub fn parameter_names(&self) -> Vec<String> {
        self.weights.names()
    }

    pub fn state_dict(&self) -> Result<Vec<(String, Tensor)>> {
        self.weights.named_tensors()
    }
}

impl CausalLanguageModel for InternLM2ForCausalLM {
    fn forward(&self, inputs: &ForwardInputs, past_key_values: &mut KvCache) -> Result<Tensor> {
        let mut xs = match &inputs.inputs_embeds {
            Some(embeds) => embeds.clone(),
            None => self.tok_embeddings.forward(&inputs.input_ids)?,
        };
        let positions = checked_positions(inputs, xs.dim(1)?, past_key_values)?;

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(
                &xs,
                inputs,
                &positions,
                &self.rotary,
                past_key_values,
                layer_idx,
            )?;
        }
        self.norm.forward(&xs)
    }

    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.output.forward(hidden_states)
    }

    fn get_input_embeddings(&self) -> &Embedding {
        &self.tok_embeddings
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SequenceStep, StepContext};
    use crate::kv_cache::CacheConfig;
    use crate::testing::tiny_llm_config;

    fn inputs(ctx: &StepContext) -> ForwardInputs {
        ForwardInputs::new(
            ctx.input_ids.clone(),
            ctx.position_ids.clone(),
            ctx.attn_metadata.clone(),
        )
    }

    fn cache(cfg: &LlmConfig) -> KvCache {
        KvCache::new(&CacheConfig::for_model(cfg, 4))
    }

    #[test]
    fn construction_registers_internlm2_names() {
        let cfg = tiny_llm_config("InternLM2ForCausalLM");
        let model = InternLM2ForCausalLM::new(&cfg, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.num_layers(), cfg.num_hidden_layers);
        assert!(!model.has_visual_expert());

        let names = model.parameter_names();
        for expected in [
            "model.tok_embeddings.weight",
            "model.layers.0.attention.wqkv.weight",
            "model.layers.0.attention.wo.weight",
            "model.layers.1.feed_forward.w1.weight",
            "model.layers.1.ffn_norm.weight",
            "model.norm.weight",
            "output.weight",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(!names.iter().any(|n| n.contains("feed_forward_ve")));
    }

    #[test]
    fn visual_expert_adds_expert_mlp() {
        let cfg = tiny_llm_config("InternLM2VEForCausalLM");
        let model = InternLM2ForCausalLM::new_visual_expert(&cfg, DType::F32, &Device::Cpu).unwrap();
        assert!(model.has_visual_expert());
        assert!(model
            .parameter_names()
            .contains(&"model.layers.0.feed_forward_ve.w2.weight".to_string()));
    }

    #[test]
    fn tied_embeddings_skip_output_head() {
        let mut cfg = tiny_llm_config("InternLM2ForCausalLM");
        cfg.tie_word_embeddings = true;
        let model = InternLM2ForCausalLM::new(&cfg, DType::F32, &Device::Cpu).unwrap();
        assert!(!model.parameter_names().contains(&"output.weight".to_string()));
    }

    #[test]
    fn prefill_then_decode() {
        let cfg = tiny_llm_config("InternLM2ForCausalLM");
        let device = Device::Cpu;
        let model = InternLM2ForCausalLM::new(&cfg, DType::F32, &device).unwrap();
        let mut kv = cache(&cfg);

        let ctx = StepContext::build(&[SequenceStep::text(vec![1, 2, 3], 0, 0)], &device).unwrap();
        let hidden = model.forward(&inputs(&ctx), &mut kv).unwrap();
        assert_eq!(hidden.dims(), &[1, 3, cfg.hidden_size]);
        let logits = model.get_logits(&hidden).unwrap();
        assert_eq!(logits.dims(), &[1, 3, cfg.vocab_size]);
        assert_eq!(kv.seq_len(0, 0).unwrap(), 3);

        let ctx = StepContext::build(&[SequenceStep::text(vec![4], 3, 0)], &device).unwrap();
        let hidden = model.forward(&inputs(&ctx), &mut kv).unwrap();
        assert_eq!(hidden.dims(), &[1, 1, cfg.hidden_size]);
        assert_eq!(kv.seq_len(cfg.num_hidden_layers - 1, 0).unwrap(), 4);
    }

    #[test]
    fn inputs_embeds_take_precedence() {
        let cfg = tiny_llm_config("InternLM2ForCausalLM");
        let device = Device::Cpu;
        let model = InternLM2ForCausalLM::new(&cfg, DType::F32, &device).unwrap();

        let ctx = StepContext::build(&[SequenceStep::text(vec![1, 2], 0, 0)], &device).unwrap();
        let embeds = model
            .get_input_embeddings()
            .forward(&Tensor::new(&[[7u32, 8]], &device).unwrap())
            .unwrap();

        let with_embeds = model
            .forward(&inputs(&ctx).with_inputs_embeds(embeds), &mut cache(&cfg))
            .unwrap();
        let reference = {
            let ids = StepContext::build(&[SequenceStep::text(vec![7, 8], 0, 0)], &device).unwrap();
            model.forward(&inputs(&ids), &mut cache(&cfg)).unwrap()
        };
        let diff: f32 = (with_embeds - reference)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn expert_routing_changes_only_vision_rows() {
        let cfg = tiny_llm_config("InternLM2VEForCausalLM");
        let device = Device::Cpu;
        let model = InternLM2ForCausalLM::new_visual_expert(&cfg, DType::F32, &device).unwrap();
        let layer = &model.layers[0];

        let xs = Tensor::randn(0f32, 1.0, (1, 4, cfg.hidden_size), &device).unwrap();
        let text_only = layer.mlp(&xs, None, None).unwrap();

        let vision = Tensor::new(&[1u32, 2], &device).unwrap();
        let text = Tensor::new(&[0u32, 3], &device).unwrap();
        let routed = layer.mlp(&xs, Some(&vision), Some(&text)).unwrap();

        let row = |t: &Tensor, i: usize| -> Vec<f32> {
            t.squeeze(0).unwrap().get(i).unwrap().to_vec1().unwrap()
        };
        let max_diff = |a: Vec<f32>, b: Vec<f32>| {
            a.iter()
                .zip(&b)
                .map(|(x, y)| (x - y).abs())
                .fold(0f32, f32::max)
        };
        assert!(max_diff(row(&routed, 0), row(&text_only, 0)) < 1e-5);
        assert!(max_diff(row(&routed, 3), row(&text_only, 3)) < 1e-5);
        assert!(max_diff(row(&routed, 1), row(&text_only, 1)) > 1e-6);
    }

    #[test]
    fn mismatched_head_counts_are_rejected() {
        let mut cfg = tiny_llm_config("InternLM2ForCausalLM");
        cfg.num_key_value_heads = Some(3);
        assert!(InternLM2ForCausalLM::new(&cfg, DType::F32, &Device::Cpu).is_err());
    }
}
