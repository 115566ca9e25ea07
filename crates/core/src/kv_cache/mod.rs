//! Contiguous per-sequence key/value cache.
//!
//! Layout is layer-major: `layers[layer][slot]` holds the keys and values of
//! one sequence as `[num_kv_heads, seq_len, head_dim]` tensors. A slot is
//! assigned to a sequence by the caller for the lifetime of the request.

pub mod config;
mod error;

pub use config::CacheConfig;
pub use error::CacheError;

use candle_core::Tensor;

#[derive(Clone)]
struct CacheEntry {
    k: Tensor,
    v: Tensor,
}

pub struct KvCache {
    layers: Vec<Vec<Option<CacheEntry>>>,
    num_slots: usize,
}

impl KvCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            layers: vec![vec![None; config.num_slots]; config.num_layers],
            num_slots: config.num_slots,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    fn entry(&self, layer: usize, slot: usize) -> Result<&Option<CacheEntry>, CacheError> {
        let num_layers = self.layers.len();
        let slots = self
            .layers
            .get(layer)
            .ok_or(CacheError::LayerOutOfRange { layer, num_layers })?;
        slots.get(slot).ok_or(CacheError::SlotOutOfRange {
            slot,
            num_slots: self.num_slots,
        })
    }

    fn entry_mut(
        &mut self,
        layer: usize,
        slot: usize,
    ) -> Result<&mut Option<CacheEntry>, CacheError> {
        let num_layers = self.layers.len();
        let num_slots = self.num_slots;
        let slots = self
            .layers
            .get_mut(layer)
            .ok_or(CacheError::LayerOutOfRange { layer, num_layers })?;
        slots
            .get_mut(slot)
            .ok_or(CacheError::SlotOutOfRange { slot, num_slots })
    }

    /// Number of tokens cached for `slot` in `layer`.
    pub fn seq_len(&self, layer: usize, slot: usize) -> Result<usize, CacheError> {
        match self.entry(layer, slot)? {
            Some(entry) => Ok(entry.k.dim(1)?),
            None => Ok(0),
        }
    }

    /// Append new keys/values (`[num_kv_heads, new_tokens, head_dim]`) and
    /// return the full cached keys/values for the slot.
    pub fn append(
        &mut self,
        layer: usize,
        slot: usize,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let entry = self.entry_mut(layer, slot)?;
        let updated = match entry.as_ref() {
            Some(prev) => CacheEntry {
                k: Tensor::cat(&[&prev.k, k], 1)?,
                v: Tensor::cat(&[&prev.v, v], 1)?,
            },
            None => CacheEntry {
                k: k.contiguous()?,
                v: v.contiguous()?,
            },
        };
        let out = (updated.k.clone(), updated.v.clone());
        *entry = Some(updated);
        Ok(out)
    }

    /// Check that every layer holds exactly `history_lengths[i]` tokens for
    /// `slots[i]`.
    pub fn check_history(
        &self,
        slots: &[usize],
        history_lengths: &[usize],
    ) -> Result<(), CacheError> {
        for layer in 0..self.layers.len() {
            self.check_layer_history(layer, slots, history_lengths)?;
        }
        Ok(())
    }

    pub fn check_layer_history(
        &self,
        layer: usize,
        slots: &[usize],
        history_lengths: &[usize],
    ) -> Result<(), CacheError> {
        for (&slot, &expected) in slots.iter().zip(history_lengths) {
            let cached = self.seq_len(layer, slot)?;
            if cached != expected {
                return Err(CacheError::HistoryMismatch {
                    slot,
                    cached,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Drop the cached state of a finished sequence in every layer.
    pub fn free_slot(&mut self, slot: usize) -> Result<(), CacheError> {
        if slot >= self.num_slots {
            return Err(CacheError::SlotOutOfRange {
                slot,
                num_slots: self.num_slots,
            });
        }
        for slots in &mut self.layers {
            slots[slot] = None;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for slots in &mut self.layers {
            slots.iter_mut().for_each(|entry| *entry = None);
        }
    }
}
