use candle_core::{Result, Tensor};

use crate::context::AttentionMetadata;
use crate::kv_cache::KvCache;

use super::mask::causal_mask;

/// Head counts of one attention layer.
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

/// Expand `[num_kv_heads, seq, head_dim]` to `[num_kv_heads * n_rep, seq, head_dim]`.
pub fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (num_kv_heads, seq_len, head_dim) = xs.dims3()?;
    xs.unsqueeze(1)?
        .expand((num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((num_kv_heads * n_rep, seq_len, head_dim))
}

/// Causal attention over a flattened batch.
///
/// `q`: `[tokens, num_heads, head_dim]`, `k`/`v`: `[tokens, num_kv_heads, head_dim]`
/// with rotary embedding already applied. New keys/values are appended to
/// `cache` at `layer_idx`. Returns `[tokens, num_heads * head_dim]`.
pub fn varlen_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attn_metadata: &AttentionMetadata,
    cache: &mut KvCache,
    layer_idx: usize,
    shape: AttentionShape,
) -> Result<Tensor> {
    let AttentionShape {
        num_heads,
        num_kv_heads,
        head_dim,
    } = shape;
    let n_rep = num_heads / num_kv_heads;
    let scale = 1.0 / (head_dim as f64).sqrt();

    cache.check_layer_history(
        layer_idx,
        &attn_metadata.cache_slots,
        &attn_metadata.history_lengths,
    )?;

    let mut outputs = Vec::with_capacity(attn_metadata.num_sequences());
    let starts = attn_metadata.q_start_loc();
    for (seq_idx, &start) in starts.iter().enumerate() {
        let q_len = attn_metadata.q_seqlens[seq_idx];
        let slot = attn_metadata.cache_slots[seq_idx];
        let history = attn_metadata.history_lengths[seq_idx];

        let q_i = q.narrow(0, start, q_len)?.transpose(0, 1)?.contiguous()?;
        let k_i = k.narrow(0, start, q_len)?.transpose(0, 1)?.contiguous()?;
        let v_i = v.narrow(0, start, q_len)?.transpose(0, 1)?.contiguous()?;

        let (k_all, v_all) = cache.append(layer_idx, slot, &k_i, &v_i)?;
        let k_all = repeat_kv(k_all, n_rep)?.contiguous()?;
        let v_all = repeat_kv(v_all, n_rep)?.contiguous()?;

        // [num_heads, q_len, kv_len]
        let mut scores = (q_i.matmul(&k_all.t()?)? * scale)?;
        if q_len > 1 {
            let mask = causal_mask(q_len, history, scores.dtype(), scores.device())?;
            scores = scores.broadcast_add(&mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v_all)?; // [num_heads, q_len, head_dim]
        outputs.push(
            out.transpose(0, 1)?
                .reshape((q_len, num_heads * head_dim))?,
        );
    }

    Tensor::cat(&outputs, 0)
}
