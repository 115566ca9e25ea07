use candle_core::{DType, Device, Result, Tensor};

/// Causal mask for `seq_len` new tokens following `seqlen_offset` cached ones.
/// Returns shape `[seq_len, seq_len + seqlen_offset]`.
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)?.to_dtype(dtype)
}
