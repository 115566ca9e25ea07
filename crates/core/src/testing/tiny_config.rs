use crate::config::{LlmConfig, VlmConfig};

/// Tiny backbone config (2 layers, 64 hidden, 4 heads / 2 KV heads).
pub fn tiny_llm_config(arch: &str) -> LlmConfig {
    LlmConfig {
        architectures: vec![arch.to_string()],
        hidden_size: 64,
        num_attention_heads: 4,
        num_key_value_heads: Some(2),
        num_hidden_layers: 2,
        intermediate_size: 128,
        vocab_size: 256,
        max_position_embeddings: 512,
        head_dim: Some(16),
        hidden_act: "silu".to_string(),
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        rope_scaling: None,
        tie_word_embeddings: false,
        attention_bias: Some(false),
        extra: serde_json::Map::new(),
    }
}

/// Tiny InternVL config around [`tiny_llm_config`].
pub fn tiny_vlm_config(llm_arch: &str) -> VlmConfig {
    let mut extra = serde_json::Map::new();
    extra.insert("downsample_ratio".to_string(), serde_json::json!(0.5));
    extra.insert(
        "vision_config".to_string(),
        serde_json::json!({"hidden_size": 32, "image_size": 28, "patch_size": 14}),
    );
    VlmConfig {
        architectures: vec!["InternVLChatModel".to_string()],
        llm_config: tiny_llm_config(llm_arch),
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_configs_are_consistent() {
        let cfg = tiny_vlm_config("InternLM2VEForCausalLM");
        assert_eq!(cfg.llm_architecture().unwrap(), "InternLM2VEForCausalLM");
        let llm = &cfg.llm_config;
        assert_eq!(llm.head_dim() * llm.num_attention_heads, llm.hidden_size);
        assert_eq!(llm.num_attention_heads % llm.num_kv_heads(), 0);
    }
}
