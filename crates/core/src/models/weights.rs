//! Post-construction weight loading.
//!
//! Models are built on a [`VarMap`], so every parameter is a named variable.
//! Loading writes checkpoint tensors into those variables in place, which
//! keeps shared parameters (tied embeddings) shared.

use std::collections::HashSet;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, warn};

/// Outcome of a `load_weights` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    pub skipped: usize,
    /// Parameters the checkpoint did not provide, sorted.
    pub missing: Vec<String>,
}

pub struct WeightStore {
    varmap: VarMap,
    dtype: DType,
    device: Device,
}

impl WeightStore {
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.varmap.data().lock() {
            Ok(data) => data.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Detached copies of every parameter, sorted by name.
    pub fn named_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("weight store lock poisoned".to_string()))?;
        let mut tensors = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<Result<Vec<_>>>()?;
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(tensors)
    }

    /// Copy named tensors into the matching parameters.
    ///
    /// Unknown names are skipped. Shape mismatches are errors.
    pub fn load(&self, weights: &mut dyn Iterator<Item = (String, Tensor)>) -> Result<LoadStats> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("weight store lock poisoned".to_string()))?;

        let mut seen = HashSet::new();
        let mut stats = LoadStats::default();
        for (name, tensor) in weights {
            let Some(var) = data.get(&name) else {
                debug!(name = %name, "skipping unknown weight");
                stats.skipped += 1;
                continue;
            };
            if var.shape() != tensor.shape() {
                candle_core::bail!(
                    "shape mismatch for {name}: model {:?}, checkpoint {:?}",
                    var.shape(),
                    tensor.shape()
                );
            }
            let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
            seen.insert(name);
            stats.loaded += 1;
        }

        stats.missing = data
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        stats.missing.sort();
        if !stats.missing.is_empty() {
            warn!(
                count = stats.missing.len(),
                first = %stats.missing[0],
                "checkpoint did not provide every parameter"
            );
        }
        Ok(stats)
    }
}
