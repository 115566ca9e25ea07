//! Row selection along the token axis of `[batch, seq, hidden]` tensors.

use candle_core::{DType, Result, Tensor};

/// Host copy of an index tensor.
pub fn index_list(indices: &Tensor) -> Result<Vec<u32>> {
    indices.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()
}

/// Token positions in `0..seq_len` that are not listed in `indices`.
pub fn complement_indices(seq_len: usize, indices: &[u32]) -> Vec<u32> {
    let mut taken = vec![false; seq_len];
    for &i in indices {
        if let Some(slot) = taken.get_mut(i as usize) {
            *slot = true;
        }
    }
    (0..seq_len as u32).filter(|&i| !taken[i as usize]).collect()
}

pub fn gather_rows(xs: &Tensor, indices: &Tensor) -> Result<Tensor> {
    xs.index_select(indices, 1)
}

/// Overwrite rows of `dst` at `indices` with `src`.
///
/// `src` is `[n, hidden]` or `[batch, n, hidden]` and is cast to the dtype and
/// device of `dst`. Indices must be unique and below `seq`.
pub fn scatter_rows(dst: &Tensor, indices: &Tensor, src: &Tensor) -> Result<Tensor> {
    let (batch, seq, hidden) = dst.dims3()?;
    let src = if src.rank() == 2 {
        src.unsqueeze(0)?
    } else {
        src.clone()
    };
    let src = src.to_device(dst.device())?.to_dtype(dst.dtype())?;
    let idx = index_list(indices)?;
    if src.dim(1)? != idx.len() {
        candle_core::bail!(
            "scatter_rows: {} source rows for {} indices",
            src.dim(1)?,
            idx.len()
        );
    }

    let mut hit = vec![0u8; seq];
    for &i in &idx {
        let i = i as usize;
        if i >= seq {
            candle_core::bail!("scatter_rows: index {i} out of range for sequence length {seq}");
        }
        if hit[i] != 0 {
            candle_core::bail!("scatter_rows: duplicate index {i}");
        }
        hit[i] = 1;
    }

    let device = dst.device();
    let n = idx.len();
    let idx = Tensor::from_vec(idx, n, device)?;
    let placed = Tensor::zeros((batch, seq, hidden), dst.dtype(), device)?.index_add(
        &idx,
        &src.broadcast_as((batch, n, hidden))?.contiguous()?,
        1,
    )?;
    let mask = Tensor::from_vec(hit, (1, seq, 1), device)?.broadcast_as((batch, seq, hidden))?;
    mask.where_cond(&placed, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.squeeze(0).unwrap().to_vec2().unwrap()
    }

    #[test]
    fn complement_skips_listed_positions() {
        assert_eq!(complement_indices(5, &[1, 3]), vec![0, 2, 4]);
        assert_eq!(complement_indices(2, &[0, 1]), Vec::<u32>::new());
        assert_eq!(complement_indices(3, &[]), vec![0, 1, 2]);
        // out-of-range entries are ignored
        assert_eq!(complement_indices(2, &[7]), vec![0, 1]);
    }

    #[test]
    fn scatter_replaces_selected_rows_only() {
        let device = Device::Cpu;
        let dst = Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap();
        let src = Tensor::new(&[[1f32, 2.], [3., 4.]], &device).unwrap();
        let idx = Tensor::new(&[3u32, 1], &device).unwrap();

        let out = scatter_rows(&dst, &idx, &src).unwrap();
        assert_eq!(
            rows(&out),
            vec![vec![0., 0.], vec![3., 4.], vec![0., 0.], vec![1., 2.]]
        );
    }

    #[test]
    fn scatter_casts_source_dtype() {
        let device = Device::Cpu;
        let dst = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();
        let src = Tensor::new(&[[5f64, 6.]], &device).unwrap();
        let idx = Tensor::new(&[0i64], &device).unwrap();
        let out = scatter_rows(&dst, &idx, &src).unwrap();
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(rows(&out), vec![vec![5., 6.], vec![1., 1.]]);
    }

    #[test]
    fn scatter_rejects_bad_indices() {
        let device = Device::Cpu;
        let dst = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        let src = Tensor::zeros((2, 2), DType::F32, &device).unwrap();

        let dup = Tensor::new(&[1u32, 1], &device).unwrap();
        assert!(scatter_rows(&dst, &dup, &src).is_err());

        let oob = Tensor::new(&[0u32, 3], &device).unwrap();
        assert!(scatter_rows(&dst, &oob, &src).is_err());

        let short = Tensor::new(&[0u32], &device).unwrap();
        assert!(scatter_rows(&dst, &short, &src).is_err());
    }

    #[test]
    fn gather_selects_rows() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[[[0f32], [1.], [2.], [3.]]], &device).unwrap();
        let idx = Tensor::new(&[2u32, 0], &device).unwrap();
        let out = gather_rows(&xs, &idx).unwrap();
        assert_eq!(rows(&out), vec![vec![2.], vec![0.]]);
    }
}
