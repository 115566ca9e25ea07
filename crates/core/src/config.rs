use std::path::Path;

use candle_nn::Activation;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config has an empty architectures list")]
    EmptyArchitectures,
    #[error("unsupported hidden_act: {0}")]
    UnsupportedActivation(String),
    #[error("unsupported rope_scaling type: {0}")]
    UnsupportedRopeScaling(String),
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_scaling_factor() -> f64 {
    1.0
}

/// `rope_scaling` entry. Older checkpoints name the kind `type`, newer ones
/// `rope_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type", default)]
    pub scaling_type: Option<String>,
    #[serde(default)]
    pub rope_type: Option<String>,
    #[serde(default = "default_scaling_factor")]
    pub factor: f64,
}

impl RopeScaling {
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.scaling_type.as_deref())
            .unwrap_or("default")
    }
}

/// HuggingFace-style config of the language model backbone.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// InternLM2 checkpoints call this `bias`.
    #[serde(default, alias = "bias")]
    pub attention_bias: Option<bool>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LlmConfig {
    pub fn architecture(&self) -> Result<&str, ConfigError> {
        self.architectures
            .first()
            .map(|s| s.as_str())
            .ok_or(ConfigError::EmptyArchitectures)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// MLP gate activation named by `hidden_act`.
    pub fn activation(&self) -> Result<Activation, ConfigError> {
        match self.hidden_act.as_str() {
            "silu" | "swish" => Ok(Activation::Silu),
            "gelu" => Ok(Activation::Gelu),
            "gelu_pytorch_tanh" | "gelu_new" => Ok(Activation::GeluPytorchTanh),
            "relu" => Ok(Activation::Relu),
            other => Err(ConfigError::UnsupportedActivation(other.to_string())),
        }
    }

    /// Factor applied to positions before computing rotary angles.
    ///
    /// Dynamic NTK scaling only changes the tables past
    /// `max_position_embeddings`, which the rotary embedding rejects, so it
    /// maps to 1.
    pub fn rope_position_scale(&self) -> Result<f64, ConfigError> {
        let Some(scaling) = &self.rope_scaling else {
            return Ok(1.0);
        };
        match scaling.kind() {
            "default" | "dynamic" => Ok(1.0),
            "linear" if scaling.factor > 0.0 => Ok(1.0 / scaling.factor),
            other => Err(ConfigError::UnsupportedRopeScaling(format!(
                "{other} (factor {})",
                scaling.factor
            ))),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["InternLM2ForCausalLM".to_string()],
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: Some(8),
            num_hidden_layers: 32,
            intermediate_size: 14336,
            vocab_size: 92553,
            max_position_embeddings: 32768,
            head_dim: None,
            hidden_act: default_hidden_act(),
            rms_norm_eps: 1e-5,
            rope_theta: 1_000_000.0,
            rope_scaling: None,
            tie_word_embeddings: false,
            attention_bias: Some(false),
            extra: serde_json::Map::new(),
        }
    }
}

/// Top-level InternVL config. Only `llm_config` matters to the text path;
/// vision fields are kept in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct VlmConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    pub llm_config: LlmConfig,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl VlmConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn llm_architecture(&self) -> Result<&str, ConfigError> {
        self.llm_config.architecture()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERNVL2_8B_CONFIG: &str = r#"{
        "architectures": ["InternVLChatModel"],
        "downsample_ratio": 0.5,
        "select_layer": -1,
        "template": "internlm2-chat",
        "llm_config": {
            "architectures": ["InternLM2ForCausalLM"],
            "bias": false,
            "bos_token_id": 1,
            "eos_token_id": 2,
            "hidden_act": "silu",
            "hidden_size": 4096,
            "intermediate_size": 14336,
            "max_position_embeddings": 32768,
            "model_type": "internlm2",
            "num_attention_heads": 32,
            "num_hidden_layers": 32,
            "num_key_value_heads": 8,
            "rms_norm_eps": 1e-05,
            "rope_scaling": {"factor": 2.0, "type": "dynamic"},
            "rope_theta": 1000000,
            "tie_word_embeddings": false,
            "vocab_size": 92553
        },
        "vision_config": {
            "hidden_size": 1024,
            "image_size": 448,
            "patch_size": 14
        }
    }"#;

    #[test]
    fn parse_internvl2_8b_config() {
        let cfg = VlmConfig::from_json_str(INTERNVL2_8B_CONFIG).expect("parse");
        assert_eq!(cfg.architectures, vec!["InternVLChatModel"]);
        assert_eq!(cfg.llm_architecture().unwrap(), "InternLM2ForCausalLM");

        let llm = &cfg.llm_config;
        assert_eq!(llm.hidden_size, 4096);
        assert_eq!(llm.head_dim(), 128);
        assert_eq!(llm.num_kv_heads(), 8);
        assert_eq!(llm.attention_bias, Some(false));
        assert_eq!(llm.rope_theta, 1_000_000.0);
        assert_eq!(llm.rope_scaling.as_ref().unwrap().kind(), "dynamic");
        assert_eq!(llm.rope_position_scale().unwrap(), 1.0);
        assert_eq!(llm.activation().unwrap(), Activation::Silu);
        assert!(cfg.extra.contains_key("vision_config"));
    }

    #[test]
    fn missing_kv_heads_falls_back_to_attention_heads() {
        let json = r#"{
            "architectures": ["LlamaForCausalLM"],
            "hidden_size": 64,
            "num_attention_heads": 4,
            "num_hidden_layers": 1,
            "intermediate_size": 128,
            "vocab_size": 32
        }"#;
        let cfg: LlmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.num_kv_heads(), 4);
        assert_eq!(cfg.head_dim(), 16);
        assert_eq!(cfg.hidden_act, "silu");
        assert!(!cfg.tie_word_embeddings);
    }

    #[test]
    fn missing_llm_config_is_an_error() {
        let err = VlmConfig::from_json_str(r#"{"architectures": ["InternVLChatModel"]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn empty_architectures_is_reported() {
        let mut cfg = VlmConfig::from_json_str(INTERNVL2_8B_CONFIG).unwrap();
        cfg.llm_config.architectures.clear();
        assert!(matches!(
            cfg.llm_architecture(),
            Err(ConfigError::EmptyArchitectures)
        ));
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = VlmConfig::from_file("/nonexistent/config.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/config.json"));
    }

    fn llm_with(extra: &str) -> LlmConfig {
        let json = format!(
            r#"{{
                "architectures": ["LlamaForCausalLM"],
                "hidden_size": 64,
                "num_attention_heads": 4,
                "num_hidden_layers": 1,
                "intermediate_size": 128,
                "vocab_size": 32,
                {extra}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn linear_rope_scaling_divides_positions() {
        let cfg = llm_with(r#""rope_scaling": {"type": "linear", "factor": 4.0}"#);
        assert_eq!(cfg.rope_position_scale().unwrap(), 0.25);

        let cfg = llm_with(r#""rope_scaling": {"rope_type": "linear", "factor": 2.0}"#);
        assert_eq!(cfg.rope_position_scale().unwrap(), 0.5);
    }

    #[test]
    fn unknown_rope_scaling_is_rejected() {
        let cfg = llm_with(
            r#""rope_scaling": {"rope_type": "yarn", "factor": 4.0, "original_max_position_embeddings": 4096}"#,
        );
        assert!(matches!(
            cfg.rope_position_scale(),
            Err(ConfigError::UnsupportedRopeScaling(kind)) if kind.starts_with("yarn")
        ));
    }

    #[test]
    fn activation_follows_hidden_act() {
        let cfg = llm_with(r#""hidden_act": "gelu_pytorch_tanh""#);
        assert_eq!(cfg.activation().unwrap(), Activation::GeluPytorchTanh);

        let cfg = llm_with(r#""hidden_act": "sigmoid_lu""#);
        assert!(matches!(
            cfg.activation(),
            Err(ConfigError::UnsupportedActivation(act)) if act == "sigmoid_lu"
        ));
    }
}
