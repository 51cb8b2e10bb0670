use anyhow::{Context, Result};
use candle_core::D;
use log::info;
use serde::{Deserialize, Serialize};

use crate::core::model::GestureClassifier;
use crate::core::preprocess::Split;
use crate::core::train::{per_example_loss, SplitTensors};

const EPSILON: f64 = 1e-8;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub test_loss: f64,
    /// Fraction in [0, 1].
    pub test_accuracy: f64,
    /// `confusion[true][predicted]`.
    pub confusion: Vec<Vec<u64>>,
    pub per_class: Vec<ClassMetrics>,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
}

pub fn confusion_matrix(targets: &[u32], predictions: &[u32], num_classes: usize) -> Vec<Vec<u64>> {
    let mut matrix = vec![vec![0u64; num_classes]; num_classes];
    for (&t, &p) in targets.iter().zip(predictions) {
        matrix[t as usize][p as usize] += 1;
    }
    matrix
}

/// Per-class precision/recall/F1 from a confusion matrix, with epsilon-padded
/// denominators so classes missing from the test split score 0.
pub fn class_metrics(confusion: &[Vec<u64>], labels: &[String]) -> Vec<ClassMetrics> {
    (0..confusion.len())
        .map(|c| {
            let tp = confusion[c][c] as f64;
            let predicted: u64 = confusion.iter().map(|row| row[c]).sum();
            let actual: u64 = confusion[c].iter().sum();
            let fp = predicted as f64 - tp;
            let fn_ = actual as f64 - tp;
            let precision = tp / (tp + fp + EPSILON);
            let recall = tp / (tp + fn_ + EPSILON);
            let f1 = 2.0 * precision * recall / (precision + recall + EPSILON);
            ClassMetrics {
                label: labels.get(c).cloned().unwrap_or_default(),
                precision,
                recall,
                f1,
                support: actual,
            }
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

pub fn evaluate(model: &GestureClassifier, test: &Split) -> Result<Evaluation> {
    let num_classes = model.labels.len();
    let (test_loss, predictions) = if test.is_empty() {
        (0.0, Vec::new())
    } else {
        let tensors = SplitTensors::new(test, &model.device)?;
        let logits = model.net.forward_t(&tensors.xs, false)
            .context("Forward pass over test split failed")?;
        let loss = per_example_loss(&logits, &tensors.ys)?.mean_all()?.to_scalar::<f32>()? as f64;
        let predictions: Vec<u32> = logits.argmax(D::Minus1)?.to_vec1()?;
        (loss, predictions)
    };

    let confusion = confusion_matrix(&test.targets, &predictions, num_classes);
    let correct: u64 = (0..num_classes).map(|c| confusion[c][c]).sum();
    let test_accuracy = if test.is_empty() { 0.0 } else { correct as f64 / test.len() as f64 };
    let per_class = class_metrics(&confusion, &model.labels);

    let evaluation = Evaluation {
        test_loss,
        test_accuracy,
        macro_precision: mean(per_class.iter().map(|m| m.precision)),
        macro_recall: mean(per_class.iter().map(|m| m.recall)),
        macro_f1: mean(per_class.iter().map(|m| m.f1)),
        confusion,
        per_class,
    };
    info!(
        "Test accuracy {:.4}, loss {:.4}, macro F1 {:.4}",
        evaluation.test_accuracy, evaluation.test_loss, evaluation.macro_f1
    );
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("L{}", i)).collect()
    }

    #[test]
    fn rows_count_true_labels() {
        let targets = [0, 0, 1, 2, 2, 2];
        let predictions = [0, 1, 1, 2, 0, 2];
        let m = confusion_matrix(&targets, &predictions, 3);
        assert_eq!(m, vec![vec![1, 1, 0], vec![0, 1, 0], vec![1, 0, 2]]);
        for (c, row) in m.iter().enumerate() {
            let expected = targets.iter().filter(|&&t| t as usize == c).count() as u64;
            assert_eq!(row.iter().sum::<u64>(), expected);
        }
    }

    #[test]
    fn metrics_from_confusion() {
        let m = vec![vec![2, 1], vec![0, 3]];
        let metrics = class_metrics(&m, &labels(2));
        assert!((metrics[0].precision - 1.0).abs() < 1e-6);
        assert!((metrics[0].recall - 2.0 / 3.0).abs() < 1e-6);
        assert!((metrics[1].precision - 0.75).abs() < 1e-6);
        assert!((metrics[1].recall - 1.0).abs() < 1e-6);
        assert!((metrics[1].f1 - 2.0 * 0.75 / 1.75).abs() < 1e-6);
    }

    #[test]
    fn absent_class_scores_zero() {
        let m = vec![vec![3, 0, 0], vec![0, 2, 0], vec![0, 0, 0]];
        let metrics = class_metrics(&m, &labels(3));
        assert_eq!(metrics[2].precision, 0.0);
        assert_eq!(metrics[2].recall, 0.0);
        assert_eq!(metrics[2].f1, 0.0);
        assert_eq!(metrics[2].support, 0);
    }

    #[test]
    fn macro_f1_is_unweighted_mean() {
        let model = GestureClassifier::init(labels(3), Device::Cpu).unwrap();
        let mut test = Split::default();
        for i in 0..9 {
            test.features.push((0..63).map(|d| ((i * 7 + d) % 11) as f32 * 0.1).collect());
            test.targets.push((i % 3) as u32);
        }
        let eval = evaluate(&model, &test).unwrap();

        let total: u64 = eval.confusion.iter().flatten().sum();
        assert_eq!(total, 9);
        let expected = eval.per_class.iter().map(|m| m.f1).sum::<f64>() / 3.0;
        assert!((eval.macro_f1 - expected).abs() < 1e-12);
        assert!(eval.per_class.iter().all(|m| (0.0..=1.0).contains(&m.f1)));
        assert!((0.0..=1.0).contains(&eval.test_accuracy));
        assert!(eval.test_loss >= 0.0);
    }

    #[test]
    fn empty_test_split() {
        let model = GestureClassifier::init(labels(2), Device::Cpu).unwrap();
        let eval = evaluate(&model, &Split::default()).unwrap();
        assert_eq!(eval.test_accuracy, 0.0);
        assert_eq!(eval.confusion, vec![vec![0, 0], vec![0, 0]]);
    }
}
