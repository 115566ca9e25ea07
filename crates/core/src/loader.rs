//! Checkpoint discovery and weight iteration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::config::VlmConfig;

const CONFIG_FILE: &str = "config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

pub struct ModelFiles {
    pub config: VlmConfig,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Read a checkpoint laid out in a local directory.
    pub fn from_directory(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let config = VlmConfig::from_file(dir.join(CONFIG_FILE))?;

        let single = dir.join(SINGLE_WEIGHTS_FILE);
        let weights = if single.exists() {
            vec![single]
        } else {
            let index = dir.join(WEIGHTS_INDEX_FILE);
            let content = std::fs::read_to_string(&index)
                .with_context(|| format!("no weights found in {}", dir.display()))?;
            shard_names(&content)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        };

        info!(dir = %dir.display(), shards = weights.len(), "found checkpoint");
        Ok(Self { config, weights })
    }
}

/// Download (or reuse from cache) a checkpoint from the HuggingFace Hub.
pub fn fetch_model(model_id: &str) -> anyhow::Result<ModelFiles> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

    let config = VlmConfig::from_file(repo.get(CONFIG_FILE)?)?;
    let weights = match repo.get(SINGLE_WEIGHTS_FILE) {
        Ok(path) => vec![path],
        Err(_) => {
            let index = repo.get(WEIGHTS_INDEX_FILE)?;
            shard_names(&std::fs::read_to_string(index)?)?
                .iter()
                .map(|name| repo.get(name))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    info!(model_id, shards = weights.len(), "fetched checkpoint");
    Ok(ModelFiles { config, weights })
}

/// Shard file names referenced by a safetensors index, in natural order.
fn shard_names(index_json: &str) -> anyhow::Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing weight_map in safetensors index"))?;

    let mut names: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    names.sort_by_key(|name| natural_key(name));
    names.dedup();
    Ok(names)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Text(String),
    Number(u64),
}

/// Split into digit and non-digit runs so "shard-2" sorts before "shard-10".
fn natural_key(name: &str) -> Vec<KeyPart> {
    let mut parts = Vec::new();
    let mut rest = name;
    while let Some(first) = rest.chars().next() {
        let is_digit = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != is_digit)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        parts.push(if is_digit {
            KeyPart::Number(run.parse().unwrap_or(u64::MAX))
        } else {
            KeyPart::Text(run.to_string())
        });
        rest = tail;
    }
    parts
}

/// Iterate `(name, tensor)` pairs, one shard in memory at a time.
pub fn iter_weights<'a>(
    paths: &'a [PathBuf],
    device: &'a Device,
) -> impl Iterator<Item = candle_core::Result<(String, Tensor)>> + 'a {
    paths.iter().flat_map(move |path| {
        debug!(shard = %path.display(), "reading weights");
        match candle_core::safetensors::load(path, device) {
            Ok(tensors) => {
                let mut entries: Vec<_> = tensors.into_iter().map(Ok).collect();
                entries.sort_by(|a, b| match (a, b) {
                    (Ok((x, _)), Ok((y, _))) => x.cmp(y),
                    _ => std::cmp::Ordering::Equal,
                });
                entries
            }
            Err(e) => vec![Err(e)],
        }
    })
}

/// Feed the shards to `load` one at a time. Reading stops at the first
/// unreadable shard, and that error is returned once `load` has finished.
pub fn load_streaming<T>(
    paths: &[PathBuf],
    device: &Device,
    load: impl FnOnce(&mut dyn Iterator<Item = (String, Tensor)>) -> candle_core::Result<T>,
) -> anyhow::Result<T> {
    let mut read_error = None;
    let mut weights = iter_weights(paths, device).map_while(|entry| match entry {
        Ok(weight) => Some(weight),
        Err(e) => {
            read_error = Some(e);
            None
        }
    });
    let loaded = load(&mut weights);
    drop(weights);

    if let Some(e) = read_error {
        return Err(anyhow::Error::new(e).context("failed to read safetensors weights"));
    }
    Ok(loaded?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use candle_core::DType;

    const CONFIG: &str = r#"{
        "architectures": ["InternVLChatModel"],
        "llm_config": {
            "architectures": ["InternLM2ForCausalLM"],
            "hidden_size": 64,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 2,
            "intermediate_size": 128,
            "vocab_size": 256
        }
    }"#;

    #[test]
    fn natural_order_sorts_numbers_numerically() {
        let index = r#"{"weight_map": {
            "a": "model-00010-of-00011.safetensors",
            "b": "model-00002-of-00011.safetensors",
            "c": "model-00002-of-00011.safetensors",
            "d": "model-00001-of-00011.safetensors"
        }}"#;
        assert_eq!(
            shard_names(index).unwrap(),
            vec![
                "model-00001-of-00011.safetensors",
                "model-00002-of-00011.safetensors",
                "model-00010-of-00011.safetensors",
            ]
        );

        let mut names = vec!["shard-10", "shard-2", "shard-1"];
        names.sort_by_key(|n| natural_key(n));
        assert_eq!(names, vec!["shard-1", "shard-2", "shard-10"]);
    }

    #[test]
    fn index_without_weight_map_is_an_error() {
        assert!(shard_names(r#"{"metadata": {}}"#).is_err());
    }

    #[test]
    fn reads_single_file_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), CONFIG).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "language_model.model.norm.weight".to_string(),
            Tensor::ones(64, DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "mlp1.0.weight".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.path().join(SINGLE_WEIGHTS_FILE)).unwrap();

        let files = ModelFiles::from_directory(dir.path()).unwrap();
        assert_eq!(files.weights.len(), 1);
        assert_eq!(files.config.llm_architecture().unwrap(), "InternLM2ForCausalLM");

        let names = load_streaming(&files.weights, &Device::Cpu, |weights| {
            Ok(weights.map(|(n, _)| n).collect::<Vec<_>>())
        })
        .unwrap();
        assert_eq!(names, vec!["language_model.model.norm.weight", "mlp1.0.weight"]);
    }

    #[test]
    fn reads_sharded_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), CONFIG).unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"x": "part-2.safetensors", "y": "part-1.safetensors"}}"#,
        )
        .unwrap();
        for (file, name) in [("part-1.safetensors", "y"), ("part-2.safetensors", "x")] {
            let mut tensors = HashMap::new();
            tensors.insert(name.to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
            candle_core::safetensors::save(&tensors, dir.path().join(file)).unwrap();
        }

        let files = ModelFiles::from_directory(dir.path()).unwrap();
        assert!(files.weights[0].ends_with("part-1.safetensors"));
        let names: Vec<String> = iter_weights(&files.weights, &Device::Cpu)
            .map(|w| w.unwrap().0)
            .collect();
        assert_eq!(names, vec!["y".to_string(), "x".to_string()]);
    }

    #[test]
    fn missing_weights_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), CONFIG).unwrap();
        let err = ModelFiles::from_directory(dir.path()).err().unwrap();
        assert!(err.to_string().contains("no weights found"));
    }

    #[test]
    fn streaming_stops_at_unreadable_shard() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("part-1.safetensors");
        let bad = dir.path().join("part-2.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("a".to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        candle_core::safetensors::save(&tensors, &good).unwrap();
        std::fs::write(&bad, b"not a safetensors file").unwrap();

        let mut seen = Vec::new();
        let err = load_streaming(&[good, bad], &Device::Cpu, |weights| {
            seen.extend(weights.map(|(n, _)| n));
            Ok(())
        })
        .unwrap_err();
        assert_eq!(seen, vec!["a".to_string()]);
        assert!(err.to_string().contains("failed to read safetensors weights"));
    }
}
