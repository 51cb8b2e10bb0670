use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::adapters::store::RawSample;

pub const NUM_LANDMARKS: usize = 21;
pub const FEATURE_DIM: usize = NUM_LANDMARKS * 3;
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

/// Split shares in percent; test takes the remainder.
const TRAIN_PERCENT: usize = 70;
const VAL_PERCENT: usize = 15;

pub type Point = [f32; 3];

/// Trimmed, uppercased label; missing or blank labels become `UNKNOWN`.
pub fn canonical_label(label: Option<&str>) -> String {
    match label.map(str::trim) {
        Some(l) if !l.is_empty() => l.to_uppercase(),
        _ => UNKNOWN_LABEL.to_string(),
    }
}

fn parse_coord(value: Option<&Value>) -> Option<f32> {
    let v = value?.as_f64()?;
    v.is_finite().then_some(v as f32)
}

fn parse_point(value: &Value) -> Option<Point> {
    match value {
        Value::Object(map) => Some([
            parse_coord(map.get("x"))?,
            parse_coord(map.get("y"))?,
            parse_coord(map.get("z"))?,
        ]),
        Value::Array(items) if items.len() == 3 => Some([
            parse_coord(items.first())?,
            parse_coord(items.get(1))?,
            parse_coord(items.get(2))?,
        ]),
        _ => None,
    }
}

/// Parses a landmark sequence. Anything other than exactly 21 well-formed
/// points is rejected.
pub fn parse_landmarks(value: &Value) -> Option<Vec<Point>> {
    let items = value.as_array()?;
    if items.len() != NUM_LANDMARKS {
        return None;
    }
    items.iter().map(parse_point).collect()
}

/// Wrist-relative feature vector: every point minus the first one, flattened.
pub fn normalize(landmarks: &[Point]) -> Vec<f32> {
    let origin = landmarks.first().copied().unwrap_or([0.0; 3]);
    landmarks
        .iter()
        .flat_map(|p| [p[0] - origin[0], p[1] - origin[1], p[2] - origin[2]])
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidSample {
    pub label: String,
    pub features: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct Split {
    pub features: Vec<Vec<f32>>,
    pub targets: Vec<u32>,
}

impl Split {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn flat_features(&self) -> Vec<f32> {
        self.features.iter().flatten().copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    /// Sorted vocabulary; a label's position is its class index.
    pub labels: Vec<String>,
    pub train: Split,
    pub val: Split,
    pub test: Split,
    pub class_weights: Vec<f32>,
}

impl Dataset {
    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn label_map(&self) -> BTreeMap<String, usize> {
        self.labels.iter().cloned().enumerate().map(|(i, l)| (l, i)).collect()
    }
}

pub enum Prepared {
    Ready(Dataset),
    NotEnoughSamples(usize),
}

pub struct Preprocessor {
    min_samples: usize,
    seed: Option<u64>,
}

impl Preprocessor {
    pub fn new(min_samples: usize) -> Self {
        Self { min_samples, seed: None }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn filter(&self, raw: &[RawSample]) -> Vec<ValidSample> {
        let valid: Vec<ValidSample> = raw
            .iter()
            .filter_map(|sample| {
                let landmarks = parse_landmarks(&sample.landmarks)?;
                Some(ValidSample {
                    label: canonical_label(sample.label.as_deref()),
                    features: normalize(&landmarks),
                })
            })
            .collect();
        debug!("Kept {} of {} samples after landmark validation", valid.len(), raw.len());
        valid
    }

    pub fn prepare(&self, raw: &[RawSample]) -> Prepared {
        let valid = self.filter(raw);
        if valid.len() < self.min_samples {
            info!(
                "Only {} valid samples, need at least {}; skipping training",
                valid.len(),
                self.min_samples
            );
            return Prepared::NotEnoughSamples(valid.len());
        }

        let labels = vocabulary(&valid);
        let index: BTreeMap<&str, u32> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i as u32))
            .collect();

        let mut order: Vec<usize> = (0..valid.len()).collect();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        order.shuffle(&mut rng);

        let (n_train, n_val) = split_sizes(valid.len());
        let take = |range: &[usize]| {
            let mut split = Split::default();
            for &i in range {
                split.features.push(valid[i].features.clone());
                split.targets.push(index[valid[i].label.as_str()]);
            }
            split
        };
        let train = take(&order[..n_train]);
        let val = take(&order[n_train..n_train + n_val]);
        let test = take(&order[n_train + n_val..]);
        let class_weights = class_weights(&train.targets, labels.len());

        info!(
            "Prepared {} samples over {} classes (train={}, val={}, test={})",
            valid.len(),
            labels.len(),
            train.len(),
            val.len(),
            test.len()
        );

        Prepared::Ready(Dataset { labels, train, val, test, class_weights })
    }
}

pub fn vocabulary(samples: &[ValidSample]) -> Vec<String> {
    samples
        .iter()
        .map(|s| s.label.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Train and validation sizes; test takes the remainder.
pub fn split_sizes(n: usize) -> (usize, usize) {
    let n_train = n * TRAIN_PERCENT / 100;
    let n_val = n * VAL_PERCENT / 100;
    (n_train, n_val.min(n - n_train))
}

/// Inverse-frequency weights: `total / (classes * max(1, count))`.
pub fn class_weights(targets: &[u32], num_classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; num_classes];
    for &t in targets {
        counts[t as usize] += 1;
    }
    let total = targets.len() as f32;
    counts
        .iter()
        .map(|&c| total / (num_classes as f32 * c.max(1) as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hand(offset: f32) -> Value {
        let points: Vec<Value> = (0..NUM_LANDMARKS)
            .map(|i| {
                let i = i as f32;
                json!({"x": 0.2 + i * (0.01 + offset * 0.001), "y": 0.5 + offset, "z": -0.1 * i})
            })
            .collect();
        Value::Array(points)
    }

    fn raw(label: Option<&str>, landmarks: Value) -> RawSample {
        RawSample { label: label.map(str::to_string), landmarks }
    }

    #[test]
    fn labels_are_trimmed_and_uppercased() {
        assert_eq!(canonical_label(Some("  thumbs up ")), "THUMBS UP");
        assert_eq!(canonical_label(Some("   ")), UNKNOWN_LABEL);
        assert_eq!(canonical_label(None), UNKNOWN_LABEL);
    }

    #[test]
    fn normalized_first_point_is_origin() {
        let points = parse_landmarks(&hand(0.3)).unwrap();
        let features = normalize(&points);
        assert_eq!(features.len(), FEATURE_DIM);
        assert_eq!(&features[..3], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn array_points_are_accepted() {
        let points: Vec<Value> = (0..NUM_LANDMARKS).map(|i| json!([i, i, i])).collect();
        let parsed = parse_landmarks(&Value::Array(points)).unwrap();
        assert_eq!(parsed[20], [20.0, 20.0, 20.0]);
    }

    #[test]
    fn malformed_landmarks_are_dropped() {
        let mut short = hand(0.0);
        short.as_array_mut().unwrap().pop();
        let mut broken = hand(0.0);
        broken.as_array_mut().unwrap()[4] = json!({"x": "a", "y": 0, "z": 0});
        let samples = vec![
            raw(Some("a"), hand(0.0)),
            raw(Some("b"), short),
            raw(Some("c"), broken),
            raw(Some("d"), Value::Null),
        ];
        let valid = Preprocessor::new(1).filter(&samples);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].label, "A");
    }

    #[test]
    fn vocabulary_ignores_invalid_samples() {
        let samples = vec![
            raw(Some("wave"), hand(0.0)),
            raw(Some(" fist"), hand(0.1)),
            raw(Some("WAVE "), hand(0.2)),
            raw(Some("ghost"), json!([])),
            raw(None, hand(0.3)),
        ];
        let valid = Preprocessor::new(1).filter(&samples);
        assert_eq!(vocabulary(&valid), vec!["FIST", "UNKNOWN", "WAVE"]);
    }

    #[test]
    fn too_few_samples_are_reported() {
        let samples: Vec<RawSample> = (0..9).map(|i| raw(Some("a"), hand(i as f32))).collect();
        match Preprocessor::new(10).prepare(&samples) {
            Prepared::NotEnoughSamples(n) => assert_eq!(n, 9),
            Prepared::Ready(_) => panic!("expected a soft failure"),
        }
    }

    #[test]
    fn split_sizes_floor_exactly() {
        assert_eq!(split_sizes(10), (7, 1));
        assert_eq!(split_sizes(12), (8, 1));
        assert_eq!(split_sizes(90), (63, 13));
        assert_eq!(split_sizes(170), (119, 25));
        assert_eq!(split_sizes(180), (126, 27));
        assert_eq!(split_sizes(330), (231, 49));
    }

    #[test]
    fn splits_are_disjoint_and_cover_everything() {
        for (n, n_train, n_val) in [(10usize, 7, 1), (12, 8, 1), (37, 25, 5), (90, 63, 13)] {
            let samples: Vec<RawSample> = (0..n)
                .map(|i| raw(Some(if i % 3 == 0 { "a" } else { "b" }), hand(i as f32)))
                .collect();
            let dataset = match Preprocessor::new(10).prepare(&samples) {
                Prepared::Ready(d) => d,
                Prepared::NotEnoughSamples(_) => panic!("expected a dataset"),
            };
            assert_eq!(dataset.train.len(), n_train);
            assert_eq!(dataset.val.len(), n_val);
            assert_eq!(dataset.total(), n);

            // Point 1's relative x is unique per generated hand.
            let mut seen = BTreeSet::new();
            for split in [&dataset.train, &dataset.val, &dataset.test] {
                for f in &split.features {
                    assert!(seen.insert(f[3].to_bits()), "sample appears in two splits");
                }
            }
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let samples: Vec<RawSample> = (0..40)
            .map(|i| raw(Some(if i % 2 == 0 { "a" } else { "b" }), hand(i as f32)))
            .collect();
        let run = || match Preprocessor::new(10).with_seed(Some(11)).prepare(&samples) {
            Prepared::Ready(d) => d.test.targets,
            Prepared::NotEnoughSamples(_) => unreachable!(),
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn rare_classes_get_larger_weights() {
        let weights = class_weights(&[0, 0, 0, 1], 3);
        assert!((weights[0] - 4.0 / 9.0).abs() < 1e-6);
        assert!((weights[1] - 4.0 / 3.0).abs() < 1e-6);
        // Absent class is treated as count 1.
        assert!((weights[2] - 4.0 / 3.0).abs() < 1e-6);
    }
}
