//! Single-step execution through the adapter.
//!
//! Scheduling and batching live in the serving runtime; this module runs one
//! already-scheduled step: prepare inputs from the current context, run the
//! backbone, and project the last token of every sequence to logits.

use candle_core::{DType, Tensor, D};
use thiserror::Error;
use tracing::trace;

use crate::context::{SequenceStep, StepContext};
use crate::kv_cache::KvCache;
use crate::models::{InternVLChatModel, ModelError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no step context is set")]
    NoContext,
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub struct StepOutput {
    /// `[1, tokens, hidden]`.
    pub hidden_states: Tensor,
    /// `[num_sequences, vocab]`, last token of each sequence.
    pub logits: Tensor,
}

/// Run the step held by the model's context manager.
pub fn execute_step(
    model: &InternVLChatModel,
    past_key_values: &mut KvCache,
) -> Result<StepOutput, EngineError> {
    let ctx = model.ctx_mgr().current().ok_or(EngineError::NoContext)?;
    let inputs = model.prepare_inputs_for_generation(None, &ctx)?;
    let hidden_states = model.forward(&inputs, past_key_values)?;

    let last = ctx.attn_metadata.last_token_indices();
    let num_seqs = last.len();
    let last = Tensor::from_vec(last, num_seqs, hidden_states.device())?;
    let last_hidden = hidden_states.index_select(&last, 1)?.squeeze(0)?;
    let logits = model.get_logits(&last_hidden)?;

    trace!(
        tokens = ctx.attn_metadata.num_tokens(),
        sequences = num_seqs,
        decoding = ctx.attn_metadata.is_decoding,
        "executed step"
    );
    Ok(StepOutput {
        hidden_states,
        logits,
    })
}

/// Install `sequences` as the current step and run it.
pub fn run_sequences(
    model: &InternVLChatModel,
    past_key_values: &mut KvCache,
    sequences: &[SequenceStep],
) -> Result<StepOutput, EngineError> {
    let ctx = StepContext::build(sequences, model.device())?;
    model.ctx_mgr().set_context(ctx);
    let output = execute_step(model, past_key_values);
    model.ctx_mgr().clear();
    output
}

/// Argmax token per row of `[num_sequences, vocab]` logits.
pub fn greedy_tokens(logits: &Tensor) -> candle_core::Result<Vec<u32>> {
    logits
        .to_dtype(DType::F32)?
        .argmax(D::Minus1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()
}
