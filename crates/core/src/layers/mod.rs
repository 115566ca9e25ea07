pub mod attention;
pub mod indexing;
pub mod mask;
pub mod mlp;
pub mod rotary;

pub use attention::{repeat_kv, varlen_attention, AttentionShape};
pub use indexing::{complement_indices, gather_rows, index_list, scatter_rows};
pub use mask::causal_mask;
pub use mlp::{MlpNames, SwiGluMlp};
pub use rotary::RotaryEmbedding;
