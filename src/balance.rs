use rand::{rngs::StdRng, seq::SliceRandom};

use crate::data::{class_counts, label_counts, Sample};

/// Randomly drop samples from larger classes until every non-empty class has as many as the
/// smallest one. The result is shuffled.
pub fn undersample(samples: Vec<Sample>, n_classes: usize, rng: &mut StdRng) -> Vec<Sample> {
    let counts = class_counts(&samples, n_classes);
    let Some(cap) = counts.iter().copied().filter(|&c| c > 0).min() else {
        return samples;
    };

    let mut by_class: Vec<Vec<Sample>> = vec![Vec::new(); n_classes];
    for s in samples {
        if let Some(bucket) = by_class.get_mut(s.label as usize) {
            bucket.push(s);
        }
    }

    let mut out = Vec::with_capacity(cap * n_classes);
    for mut bucket in by_class {
        bucket.shuffle(rng);
        bucket.truncate(cap);
        out.extend(bucket);
    }
    out.shuffle(rng);
    out
}

/// "balanced" weights: n_samples / (n_classes * count). Absent classes get 0.
pub fn class_weights(labels: &[i64], n_classes: usize) -> Vec<f64> {
    let counts = label_counts(labels.iter().copied(), n_classes);
    let n = labels.len() as f64;
    counts
        .iter()
        .map(|&c| if c == 0 { 0.0 } else { n / (n_classes as f64 * c as f64) })
        .collect()
}
