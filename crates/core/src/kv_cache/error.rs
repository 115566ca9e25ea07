use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache slot {slot} out of range (num_slots = {num_slots})")]
    SlotOutOfRange { slot: usize, num_slots: usize },

    #[error("cache layer {layer} out of range (num_layers = {num_layers})")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("cache slot {slot} holds {cached} tokens but the step expects history {expected}")]
    HistoryMismatch {
        slot: usize,
        cached: usize,
        expected: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl From<CacheError> for candle_core::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Candle(e) => e,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
