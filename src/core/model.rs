use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::preprocess::{normalize, Point, FEATURE_DIM, NUM_LANDMARKS};

pub const MODEL_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "model_config.json";
pub const LABELS_FILE: &str = "labels.json";
pub const LABEL_MAP_FILE: &str = "label_map.json";
pub const HISTORY_FILE: &str = "training_history.json";

/// Architecture of the dense classifier, persisted next to the weights.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub hidden: Vec<usize>,
    pub dropout: f32,
    pub num_classes: usize,
}

impl ModelConfig {
    pub fn for_classes(num_classes: usize) -> Self {
        Self { input_dim: FEATURE_DIM, hidden: vec![128, 64], dropout: 0.3, num_classes }
    }
}

/// 63 -> 128 (relu) -> dropout -> 64 (relu) -> classes. `forward` returns
/// logits; softmax is applied by the loss and by `probabilities`.
pub struct GestureNet {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
    dropout: Dropout,
}

impl GestureNet {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (h1, h2) = match config.hidden.as_slice() {
            [h1, h2] => (*h1, *h2),
            _ => candle_core::bail!("expected two hidden layers, got {:?}", config.hidden),
        };
        Ok(Self {
            fc1: linear(config.input_dim, h1, vb.pp("fc1"))?,
            fc2: linear(h1, h2, vb.pp("fc2"))?,
            out: linear(h2, config.num_classes, vb.pp("out"))?,
            dropout: Dropout::new(config.dropout),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?.relu()?;
        let xs = self.dropout.forward(&xs, train)?;
        let xs = self.fc2.forward(&xs)?.relu()?;
        self.out.forward(&xs)
    }

    pub fn probabilities(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::ops::softmax(&self.forward_t(xs, false)?, D::Minus1)
    }
}

/// A trained network together with its vocabulary.
pub struct GestureClassifier {
    pub config: ModelConfig,
    pub labels: Vec<String>,
    pub net: GestureNet,
    pub varmap: VarMap,
    pub device: Device,
}

impl GestureClassifier {
    pub fn init(labels: Vec<String>, device: Device) -> Result<Self> {
        let config = ModelConfig::for_classes(labels.len());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = GestureNet::new(&config, vb).context("Failed to build gesture network")?;
        Ok(Self { config, labels, net, varmap, device })
    }

    pub fn label_map(&self) -> BTreeMap<String, usize> {
        self.labels.iter().cloned().enumerate().map(|(i, l)| (l, i)).collect()
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)
            .with_context(|| format!("Failed to save weights to {:?}", path))
    }

    /// Restores a bundle written by the publisher. The vocabulary always comes
    /// from the bundle's own `labels.json`.
    pub fn load(dir: &Path, device: Device) -> Result<Self> {
        let config: ModelConfig = read_json(&dir.join(CONFIG_FILE))?;
        let labels: Vec<String> = read_json(&dir.join(LABELS_FILE))?;
        if labels.len() != config.num_classes {
            bail!(
                "Bundle at {:?} has {} labels but the model has {} outputs",
                dir,
                labels.len(),
                config.num_classes
            );
        }
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = GestureNet::new(&config, vb).context("Failed to build gesture network")?;
        varmap.load(dir.join(MODEL_FILE))
            .with_context(|| format!("Failed to load weights from {:?}", dir))?;
        Ok(Self { config, labels, net, varmap, device })
    }

    /// Most likely label and its probability for one 21-point hand.
    pub fn predict(&self, landmarks: &[Point]) -> Result<(String, f32)> {
        if landmarks.len() != NUM_LANDMARKS {
            bail!("Expected {} landmarks, got {}", NUM_LANDMARKS, landmarks.len());
        }
        let xs = Tensor::from_vec(normalize(landmarks), (1, FEATURE_DIM), &self.device)?;
        let probs: Vec<f32> = self.net.probabilities(&xs)?.squeeze(0)?.to_vec1()?;
        let (best, p) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
        let label = self.labels.get(best).context("Prediction index outside vocabulary")?;
        Ok((label.clone(), p))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {:?}", path))
}
