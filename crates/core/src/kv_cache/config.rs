use crate::config::LlmConfig;

/// Shape of the per-step KV cache handed to the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub num_layers: usize,
    /// Maximum number of concurrently cached sequences.
    pub num_slots: usize,
}

impl CacheConfig {
    pub fn for_model(cfg: &LlmConfig, num_slots: usize) -> Self {
        Self {
            num_layers: cfg.num_hidden_layers,
            num_slots,
        }
    }
}
