use std::fmt::Write as _;

use anyhow::Result;
use tch::{nn, nn::ModuleT, Device, Kind};

use crate::augment::batch_tensor;
use crate::data::LoadedSplit;

/// P(positive class) for every image in `split`, in order.
pub fn predict(
    net: &impl nn::ModuleT,
    split: &LoadedSplit,
    positive: usize,
    device: Device,
    batch_size: usize,
) -> Result<Vec<f64>> {
    let mut probs = Vec::with_capacity(split.len());
    tch::no_grad(|| -> Result<()> {
        let idxs: Vec<usize> = (0..split.len()).collect();
        for chunk in idxs.chunks(batch_size) {
            let bxs = batch_tensor(&split.images, chunk, None, device);
            let p = net
                .forward_t(&bxs, false)
                .softmax(-1, Kind::Float)
                .select(1, positive as i64)
                .to_device(Device::Cpu);
            probs.extend(Vec::<f64>::try_from(&p.to_kind(Kind::Double))?);
        }
        Ok(())
    })?;
    Ok(probs)
}

/// Binary confusion matrix; `m[truth][pred]`, index 1 = positive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfusionMatrix {
    pub m: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &[bool], pred: &[bool]) -> Self {
        let mut cm = Self::default();
        for (&t, &p) in truth.iter().zip(pred) {
            cm.m[t as usize][p as usize] += 1;
        }
        cm
    }

    pub fn tp(&self) -> usize {
        self.m[1][1]
    }
    pub fn tn(&self) -> usize {
        self.m[0][0]
    }
    pub fn fp(&self) -> usize {
        self.m[0][1]
    }
    pub fn fn_(&self) -> usize {
        self.m[1][0]
    }

    pub fn total(&self) -> usize {
        self.m.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp() + self.tn(), self.total())
    }

    /// Per-class stats, index 0 = negative, index 1 = positive.
    pub fn class_stats(&self) -> [ClassStats; 2] {
        let stats = |tp: usize, fp: usize, fn_: usize| {
            let precision = ratio(tp, tp + fp);
            let recall = ratio(tp, tp + fn_);
            let f1 = if precision + recall > 0.0 { 2.0 * precision * recall / (precision + recall) } else { 0.0 };
            ClassStats { precision, recall, f1, support: tp + fn_ }
        };
        [stats(self.tn(), self.fn_(), self.fp()), stats(self.tp(), self.fp(), self.fn_())]
    }
}

fn ratio(a: usize, b: usize) -> f64 {
    if b == 0 {
        0.0
    } else {
        a as f64 / b as f64
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ClassStats {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// ROC AUC via the rank-sum formulation, ties get their average rank.
/// `None` when only one class is present.
pub fn roc_auc(scores: &[f64], truth: &[bool]) -> Option<f64> {
    let n_pos = truth.iter().filter(|&&t| t).count();
    let n_neg = truth.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut pos_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            if truth[k] {
                pos_rank_sum += avg_rank;
            }
        }
        i = j + 1;
    }

    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub confusion: ConfusionMatrix,
    pub auc: Option<f64>,
    pub threshold: f64,
}

impl Evaluation {
    pub fn new(probs: &[f64], truth: &[bool], threshold: f64) -> Self {
        let pred: Vec<bool> = probs.iter().map(|&p| p >= threshold).collect();
        Self {
            confusion: ConfusionMatrix::from_predictions(truth, &pred),
            auc: roc_auc(probs, truth),
            threshold,
        }
    }

    /// Text report in the usual precision/recall/f1/support layout.
    /// `names[0]` is the negative class, `names[1]` the positive one.
    pub fn render(&self, names: [&str; 2]) -> String {
        let stats = self.confusion.class_stats();
        let total = self.confusion.total();
        let width = names.iter().map(|n| n.len()).max().unwrap_or(0).max(12);

        let mut out = String::new();
        let _ = writeln!(out, "{:>width$} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1-score", "support");
        let _ = writeln!(out);
        for (name, s) in names.iter().zip(&stats) {
            let _ = writeln!(
                out,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, s.precision, s.recall, s.f1, s.support
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{:>width$} {:>9} {:>9} {:>9.4} {:>9}", "accuracy", "", "", self.confusion.accuracy(), total);

        let macro_avg = |f: fn(&ClassStats) -> f64| stats.iter().map(f).sum::<f64>() / 2.0;
        let weighted_avg = |f: fn(&ClassStats) -> f64| {
            if total == 0 {
                0.0
            } else {
                stats.iter().map(|s| f(s) * s.support as f64).sum::<f64>() / total as f64
            }
        };
        let _ = writeln!(
            out,
            "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
            "macro avg",
            macro_avg(|s| s.precision),
            macro_avg(|s| s.recall),
            macro_avg(|s| s.f1),
            total
        );
        let _ = writeln!(
            out,
            "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
            "weighted avg",
            weighted_avg(|s| s.precision),
            weighted_avg(|s| s.recall),
            weighted_avg(|s| s.f1),
            total
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Confusion matrix (rows = truth, cols = predicted, threshold {:.2}):", self.threshold);
        let _ = writeln!(out, "{:>width$} {:>9} {:>9}", "", names[0], names[1]);
        for (name, row) in names.iter().zip(&self.confusion.m) {
            let _ = writeln!(out, "{:>width$} {:>9} {:>9}", name, row[0], row[1]);
        }
        let _ = writeln!(out);
        match self.auc {
            Some(auc) => {
                let _ = writeln!(out, "ROC AUC: {:.4}", auc);
            }
            None => {
                let _ = writeln!(out, "ROC AUC: n/a (single class in test set)");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_counts() {
        let truth = [true, true, false, false, true];
        let pred = [true, false, false, true, true];
        let cm = ConfusionMatrix::from_predictions(&truth, &pred);
        assert_eq!((cm.tp(), cm.tn(), cm.fp(), cm.fn_()), (2, 1, 1, 1));
        assert!((cm.accuracy() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn class_stats_for_both_classes() {
        let cm = ConfusionMatrix { m: [[8, 2], [1, 9]] };
        let [neg, pos] = cm.class_stats();
        assert!((pos.precision - 9.0 / 11.0).abs() < 1e-12);
        assert!((pos.recall - 0.9).abs() < 1e-12);
        assert!((neg.precision - 8.0 / 9.0).abs() < 1e-12);
        assert!((neg.recall - 0.8).abs() < 1e-12);
        assert_eq!((neg.support, pos.support), (10, 10));
    }

    #[test]
    fn empty_predictions_do_not_divide_by_zero() {
        let cm = ConfusionMatrix { m: [[5, 0], [0, 0]] };
        let [_, pos] = cm.class_stats();
        assert_eq!(pos, ClassStats { precision: 0.0, recall: 0.0, f1: 0.0, support: 0 });
    }

    #[test]
    fn auc_perfect_inverted_and_random() {
        let truth = [false, false, true, true];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &truth), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &truth), Some(0.0));
        assert_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &truth), Some(0.5));
    }

    #[test]
    fn auc_with_ties() {
        // pairs (pos, neg): (0.4 vs 0.1) win, (0.4 vs 0.4) tie, (0.8 vs both) win -> 3.5 / 4
        let truth = [false, false, true, true];
        let auc = roc_auc(&[0.1, 0.4, 0.4, 0.8], &truth).unwrap();
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn auc_undefined_for_one_class() {
        assert_eq!(roc_auc(&[0.2, 0.3], &[true, true]), None);
    }

    #[test]
    fn render_mentions_every_section() {
        let probs = [0.9, 0.2, 0.7, 0.4];
        let truth = [true, false, false, true];
        let eval = Evaluation::new(&probs, &truth, 0.5);
        let text = eval.render(["real", "fake"]);
        assert!(text.contains("precision"));
        assert!(text.contains("macro avg"));
        assert!(text.contains("weighted avg"));
        assert!(text.contains("ROC AUC: 0.7500"));
        assert!(text.lines().any(|l| l.trim_start().starts_with("fake")));
    }
}
