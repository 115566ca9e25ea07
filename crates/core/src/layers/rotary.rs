use candle_core::{DType, Device, Result, Tensor};

use crate::config::LlmConfig;

/// Rotary position embedding with precomputed cos/sin tables.
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
    max_positions: usize,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_positions: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::with_position_scale(head_dim, max_positions, rope_theta, 1.0, dtype, device)
    }

    /// Build from a backbone config, honouring `rope_scaling`.
    pub fn from_config(cfg: &LlmConfig, dtype: DType, device: &Device) -> Result<Self> {
        let scale = cfg.rope_position_scale().map_err(candle_core::Error::wrap)?;
        Self::with_position_scale(
            cfg.head_dim(),
            cfg.max_position_embeddings,
            cfg.rope_theta,
            scale,
            dtype,
            device,
        )
    }

    /// `position_scale` multiplies every position (linear rope scaling).
    pub fn with_position_scale(
        head_dim: usize,
        max_positions: usize,
        rope_theta: f64,
        position_scale: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let t = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .affine(position_scale, 0.0)?
            .reshape((max_positions, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
            max_positions,
        })
    }

    /// Rotate flattened tokens, each at its own position.
    ///
    /// `q`: `[tokens, num_heads, head_dim]`, `k`: `[tokens, num_kv_heads, head_dim]`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        if let Some(&p) = positions.iter().find(|&&p| p >= self.max_positions) {
            candle_core::bail!(
                "position {p} exceeds max_position_embeddings {}",
                self.max_positions
            );
        }
        let tokens = positions.len();
        let pos = Tensor::from_vec(
            positions.iter().map(|&p| p as u32).collect::<Vec<_>>(),
            tokens,
            self.sin.device(),
        )?;
        let cos = self.cos.index_select(&pos, 0)?;
        let sin = self.sin.index_select(&pos, 0)?;

        // rope wants [b, h, t, d]
        let q = q.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let k = k.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let q = candle_nn::rotary_emb::rope(&q, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k, &cos, &sin)?;

        let q = q.squeeze(0)?.transpose(0, 1)?.contiguous()?;
        let k = k.squeeze(0)?.transpose(0, 1)?.contiguous()?;
        Ok((q, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_have_half_head_dim_columns() {
        let rope = RotaryEmbedding::new(64, 128, 10000.0, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(rope.sin.dims(), &[128, 32]);
        assert_eq!(rope.cos.dims(), &[128, 32]);
    }

    #[test]
    fn position_zero_is_identity() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 16, 10000.0, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 2, 8), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 1, 8), &device).unwrap();

        let (q_rot, k_rot) = rope.apply(&q, &k, &[0]).unwrap();
        let dq: f32 = (q_rot - &q)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        let dk: f32 = (k_rot - &k)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(dq < 1e-5);
        assert!(dk < 1e-5);
    }

    #[test]
    fn per_token_positions_keep_shapes() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 64, 10000.0, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (3, 4, 16), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (3, 2, 16), &device).unwrap();
        let (q, k) = rope.apply(&q, &k, &[0, 5, 63]).unwrap();
        assert_eq!(q.dims(), &[3, 4, 16]);
        assert_eq!(k.dims(), &[3, 2, 16]);
    }

    #[test]
    fn position_past_table_is_rejected() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 4, 10000.0, DType::F32, &device).unwrap();
        let q = Tensor::zeros((1, 1, 8), DType::F32, &device).unwrap();
        assert!(rope.apply(&q, &q, &[4]).is_err());
    }

    #[test]
    fn linear_scaling_compresses_positions() {
        let device = Device::Cpu;
        let plain = RotaryEmbedding::new(8, 16, 10000.0, DType::F32, &device).unwrap();
        let scaled =
            RotaryEmbedding::with_position_scale(8, 16, 10000.0, 0.5, DType::F32, &device).unwrap();
        let a: Vec<f32> = plain.cos.get(2).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = scaled.cos.get(4).unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn from_config_rejects_unknown_scaling() {
        let mut cfg = LlmConfig::default();
        cfg.rope_scaling = Some(crate::config::RopeScaling {
            scaling_type: None,
            rope_type: Some("longrope".to_string()),
            factor: 2.0,
        });
        assert!(RotaryEmbedding::from_config(&cfg, DType::F32, &Device::Cpu).is_err());
    }
}
