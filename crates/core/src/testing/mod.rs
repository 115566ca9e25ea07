//! Shared test utilities for internvl-core.
//!
//! Tiny configs and a recording mock language model for exercising the
//! adapter without real weights.

mod mock_model;
mod tiny_config;

pub use mock_model::{ForwardCall, MockLanguageModel};
pub use tiny_config::{tiny_llm_config, tiny_vlm_config};
