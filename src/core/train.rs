use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::model::GestureClassifier;
use crate::core::preprocess::{Dataset, Split, FEATURE_DIM};
use crate::utils::lib::create_progress_bar;

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub max_epochs: usize,
    pub batch_size: usize,
    pub patience: usize,
    pub learning_rate: f64,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self { max_epochs: 60, batch_size: 32, patience: 6, learning_rate: 1e-3, seed: None }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct History {
    pub epochs: Vec<EpochStats>,
    pub best_epoch: usize,
    pub stopped_early: bool,
}

/// Tensors for one split, built once per run.
pub struct SplitTensors {
    pub xs: Tensor,
    pub ys: Tensor,
}

impl SplitTensors {
    pub fn new(split: &Split, device: &Device) -> Result<Self> {
        let xs = Tensor::from_vec(split.flat_features(), (split.len(), FEATURE_DIM), device)
            .context("Failed to build feature tensor")?;
        let ys = Tensor::from_vec(split.targets.clone(), split.len(), device)
            .context("Failed to build target tensor")?;
        Ok(Self { xs, ys })
    }
}

/// Per-example cross-entropy of `logits` against class indices `ys`.
pub fn per_example_loss(logits: &Tensor, ys: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    log_probs.gather(&ys.unsqueeze(1)?, 1)?.squeeze(1)?.neg()
}

pub fn correct_count(logits: &Tensor, ys: &Tensor) -> candle_core::Result<usize> {
    let hits = logits.argmax(D::Minus1)?.eq(ys)?.to_dtype(candle_core::DType::F32)?;
    Ok(hits.sum_all()?.to_scalar::<f32>()? as usize)
}

pub struct Trainer {
    config: TrainConfig,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Fits a fresh classifier on `dataset.train`, monitoring `dataset.val`.
    /// On early stop the weights of the best monitored epoch are restored.
    pub fn fit(&self, dataset: &Dataset, device: &Device) -> Result<(GestureClassifier, History)> {
        let model = GestureClassifier::init(dataset.labels.clone(), device.clone())?;
        let train = SplitTensors::new(&dataset.train, device)?;
        let val = if dataset.val.is_empty() { None } else { Some(SplitTensors::new(&dataset.val, device)?) };
        let class_weights = Tensor::new(dataset.class_weights.as_slice(), device)
            .context("Failed to build class weight tensor")?;

        let params = ParamsAdamW { lr: self.config.learning_rate, weight_decay: 0.0, ..Default::default() };
        let mut optimizer = AdamW::new(model.varmap.all_vars(), params)
            .context("Failed to create optimizer")?;
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let n = dataset.train.len();
        let batch_size = self.config.batch_size.max(1);
        let mut order: Vec<u32> = (0..n as u32).collect();
        let mut history = History::default();
        let mut best: Option<(f64, HashMap<String, Tensor>)> = None;
        let mut stale = 0;

        info!(
            "Training on {} samples ({} classes), up to {} epochs",
            n,
            dataset.num_classes(),
            self.config.max_epochs
        );
        let progress_bar = create_progress_bar(self.config.max_epochs as u64)
            .context("Failed to create progress bar")?;

        for epoch in 1..=self.config.max_epochs {
            order.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            let mut correct = 0;

            for chunk in order.chunks(batch_size) {
                let idx = Tensor::new(chunk, device)?;
                let xs = train.xs.index_select(&idx, 0)?;
                let ys = train.ys.index_select(&idx, 0)?;
                let logits = model.net.forward_t(&xs, true)?;
                let weights = class_weights.index_select(&ys, 0)?;
                let loss = (per_example_loss(&logits, &ys)? * weights)?.mean_all()?;
                optimizer.backward_step(&loss).context("Optimizer step failed")?;

                loss_sum += loss.to_scalar::<f32>()? as f64 * chunk.len() as f64;
                correct += correct_count(&logits, &ys)?;
            }

            let (val_loss, val_accuracy) = match &val {
                Some(v) => {
                    let (l, a) = evaluate_split(&model, v)?;
                    (Some(l), Some(a))
                }
                None => (None, None),
            };
            let stats = EpochStats {
                epoch,
                loss: loss_sum / n.max(1) as f64,
                accuracy: correct as f64 / n.max(1) as f64,
                val_loss,
                val_accuracy,
            };
            debug!("Epoch {}: {:?}", epoch, stats);
            let monitored = stats.val_loss.unwrap_or(stats.loss);
            history.epochs.push(stats);
            progress_bar.inc(1);

            let improved = best.as_ref().map_or(true, |(best_loss, _)| monitored < *best_loss);
            if improved {
                best = Some((monitored, snapshot(&model)?));
                history.best_epoch = epoch;
                stale = 0;
            } else {
                stale += 1;
                if stale >= self.config.patience {
                    info!("Early stopping at epoch {} (best epoch {})", epoch, history.best_epoch);
                    history.stopped_early = true;
                    break;
                }
            }
        }
        progress_bar.finish_with_message("Training complete");

        if let Some((_, weights)) = best.filter(|_| history.stopped_early) {
            restore(&model, &weights)?;
        }
        Ok((model, history))
    }
}

/// Unweighted mean loss and accuracy over a whole split, inference mode.
pub fn evaluate_split(model: &GestureClassifier, split: &SplitTensors) -> Result<(f64, f64)> {
    let n = split.ys.dims1()?;
    if n == 0 {
        return Ok((0.0, 0.0));
    }
    let logits = model.net.forward_t(&split.xs, false)?;
    let loss = per_example_loss(&logits, &split.ys)?.mean_all()?.to_scalar::<f32>()? as f64;
    let accuracy = correct_count(&logits, &split.ys)? as f64 / n as f64;
    Ok((loss, accuracy))
}

fn snapshot(model: &GestureClassifier) -> Result<HashMap<String, Tensor>> {
    let vars = model.varmap.data().lock()
        .map_err(|_| anyhow::anyhow!("Model variables lock poisoned"))?;
    vars.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

fn restore(model: &GestureClassifier, weights: &HashMap<String, Tensor>) -> Result<()> {
    let vars = model.varmap.data().lock()
        .map_err(|_| anyhow::anyhow!("Model variables lock poisoned"))?;
    for (name, var) in vars.iter() {
        let saved = weights.get(name).with_context(|| format!("Missing snapshot for {}", name))?;
        Var::set(var, saved).with_context(|| format!("Failed to restore {}", name))?;
    }
    Ok(())
}
