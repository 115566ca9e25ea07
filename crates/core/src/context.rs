//! Per-step inputs shared between the serving loop and the model.
//!
//! A step flattens every scheduled sequence into a single row: `input_ids`
//! and `position_ids` are `[1, total_tokens]`, and [`AttentionMetadata`]
//! records where each sequence starts and which cache slot it owns.

use std::sync::{Arc, PoisonError, RwLock};

use candle_core::{DType, Device, Result, Tensor};

/// Layout of a flattened batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMetadata {
    /// True when every sequence contributes exactly one new token.
    pub is_decoding: bool,
    /// New tokens per sequence, in flattened order.
    pub q_seqlens: Vec<usize>,
    /// Tokens already cached per sequence before this step.
    pub history_lengths: Vec<usize>,
    /// KV cache slot owned by each sequence.
    pub cache_slots: Vec<usize>,
}

impl AttentionMetadata {
    pub fn num_sequences(&self) -> usize {
        self.q_seqlens.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.q_seqlens.iter().sum()
    }

    /// Flattened offset of the first token of each sequence.
    pub fn q_start_loc(&self) -> Vec<usize> {
        self.q_seqlens
            .iter()
            .scan(0usize, |start, &len| {
                let current = *start;
                *start += len;
                Some(current)
            })
            .collect()
    }

    /// Flattened index of the last token of each sequence.
    pub fn last_token_indices(&self) -> Vec<u32> {
        self.q_start_loc()
            .iter()
            .zip(&self.q_seqlens)
            .map(|(&start, &len)| (start + len.saturating_sub(1)) as u32)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.q_seqlens.len();
        if self.history_lengths.len() != n || self.cache_slots.len() != n {
            candle_core::bail!(
                "attention metadata length mismatch: q_seqlens={}, history_lengths={}, cache_slots={}",
                n,
                self.history_lengths.len(),
                self.cache_slots.len()
            );
        }
        if self.q_seqlens.contains(&0) {
            candle_core::bail!("attention metadata contains an empty sequence");
        }
        Ok(())
    }
}

/// Everything the model needs to run one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub input_ids: Tensor,
    pub position_ids: Tensor,
    pub attn_metadata: AttentionMetadata,
    /// Precomputed vision embeddings, `[num_vision_tokens, hidden_size]`.
    pub input_embeddings: Option<Tensor>,
    /// Flattened token positions the vision embeddings replace (u32).
    pub input_embedding_indexing: Option<Tensor>,
}

/// One sequence's share of a step, as handed over by the scheduler.
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub token_ids: Vec<u32>,
    pub history_len: usize,
    pub cache_slot: usize,
    /// Vision embeddings `[n, hidden]` for this sequence's new tokens.
    pub vision_embeddings: Option<Tensor>,
    /// Offsets within `token_ids` covered by `vision_embeddings`.
    pub vision_offsets: Vec<usize>,
}

impl SequenceStep {
    pub fn text(token_ids: Vec<u32>, history_len: usize, cache_slot: usize) -> Self {
        Self {
            token_ids,
            history_len,
            cache_slot,
            vision_embeddings: None,
            vision_offsets: Vec::new(),
        }
    }

    pub fn with_vision(mut self, embeddings: Tensor, offsets: Vec<usize>) -> Self {
        self.vision_embeddings = Some(embeddings);
        self.vision_offsets = offsets;
        self
    }
}

impl StepContext {
    pub fn new(input_ids: Tensor, position_ids: Tensor, attn_metadata: AttentionMetadata) -> Self {
        Self {
            input_ids,
            position_ids,
            attn_metadata,
            input_embeddings: None,
            input_embedding_indexing: None,
        }
    }

    pub fn with_input_embeddings(mut self, embeddings: Tensor, indexing: Tensor) -> Self {
        self.input_embeddings = Some(embeddings);
        self.input_embedding_indexing = Some(indexing);
        self
    }

    /// Flatten scheduled sequences into a single step.
    pub fn build(sequences: &[SequenceStep], device: &Device) -> Result<Self> {
        if sequences.is_empty() {
            candle_core::bail!("cannot build a step without sequences");
        }

        let mut token_ids = Vec::new();
        let mut positions = Vec::new();
        let mut vision_rows = Vec::new();
        let mut vision_indices = Vec::new();
        let mut metadata = AttentionMetadata {
            is_decoding: sequences.iter().all(|s| s.token_ids.len() == 1),
            q_seqlens: Vec::with_capacity(sequences.len()),
            history_lengths: Vec::with_capacity(sequences.len()),
            cache_slots: Vec::with_capacity(sequences.len()),
        };

        for seq in sequences {
            let start = token_ids.len();
            let len = seq.token_ids.len();
            token_ids.extend_from_slice(&seq.token_ids);
            positions.extend((seq.history_len..seq.history_len + len).map(|p| p as u32));

            if let Some(emb) = &seq.vision_embeddings {
                if emb.dim(0)? != seq.vision_offsets.len() {
                    candle_core::bail!(
                        "sequence in slot {} has {} vision rows but {} offsets",
                        seq.cache_slot,
                        emb.dim(0)?,
                        seq.vision_offsets.len()
                    );
                }
                if let Some(&bad) = seq.vision_offsets.iter().find(|&&o| o >= len) {
                    candle_core::bail!("vision offset {bad} outside sequence of length {len}");
                }
                vision_rows.push(emb.clone());
                vision_indices.extend(seq.vision_offsets.iter().map(|&o| (start + o) as u32));
            }

            metadata.q_seqlens.push(len);
            metadata.history_lengths.push(seq.history_len);
            metadata.cache_slots.push(seq.cache_slot);
        }
        metadata.validate()?;

        let total = token_ids.len();
        let input_ids = Tensor::from_vec(token_ids, (1, total), device)?;
        let position_ids = Tensor::from_vec(positions, (1, total), device)?;
        let mut ctx = Self::new(input_ids, position_ids, metadata);

        if !vision_rows.is_empty() {
            let embeddings = Tensor::cat(&vision_rows, 0)?;
            let n = vision_indices.len();
            let indexing = Tensor::from_vec(vision_indices, n, device)?;
            ctx = ctx.with_input_embeddings(embeddings, indexing);
        }
        Ok(ctx)
    }

    pub fn seq_len(&self) -> Result<usize> {
        self.input_ids.dim(1)
    }

    /// Positions as host integers, in flattened order.
    pub fn positions(&self) -> Result<Vec<usize>> {
        position_list(&self.position_ids)
    }
}

pub(crate) fn position_list(position_ids: &Tensor) -> Result<Vec<usize>> {
    Ok(position_ids
        .flatten_all()?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|p| p as usize)
        .collect())
}

/// Holds the context of the step currently being executed.
#[derive(Debug, Default)]
pub struct StepContextManager {
    current: RwLock<Option<Arc<StepContext>>>,
}

impl StepContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context(&self, ctx: StepContext) -> Arc<StepContext> {
        let ctx = Arc::new(ctx);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(ctx.clone());
        ctx
    }

    pub fn current(&self) -> Option<Arc<StepContext>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
