use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};

use crate::dedup::DedupReport;
use crate::metrics::ConfusionMatrix;

const CELL: u32 = 160;
const BORDER: u32 = 2;

pub fn write_predictions(
    path: &Path,
    paths: &[PathBuf],
    labels: &[i64],
    classes: &[String],
    probs: &[f64],
    threshold: f64,
    positive: usize,
) -> Result<()> {
    let negative = if positive == 0 { 1 } else { 0 };
    let mut w = csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    w.write_record(["path", "label", "prob_fake", "predicted", "correct"])?;
    for ((p, &label), &prob) in paths.iter().zip(labels).zip(probs) {
        let pred = if prob >= threshold { positive } else { negative };
        w.write_record([
            p.display().to_string(),
            classes[label as usize].clone(),
            format!("{:.6}", prob),
            classes[pred].clone(),
            (pred as i64 == label).to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

/// Everything about the run besides the metrics themselves.
pub struct RunSummary<'a> {
    pub classes: &'a [String],
    pub dedup: DedupReport,
    pub train_before_balance: Vec<usize>,
    pub train_after_balance: Vec<usize>,
    pub class_weights: Vec<f64>,
    pub split_sizes: [usize; 3],
    pub pretrained: bool,
    pub best_val_loss: f64,
}

impl RunSummary<'_> {
    pub fn render(&self) -> String {
        let per_class = |v: &[usize]| {
            self.classes
                .iter()
                .zip(v)
                .map(|(c, n)| format!("{c}={n}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let weights = self
            .classes
            .iter()
            .zip(&self.class_weights)
            .map(|(c, w)| format!("{c}={w:.3}"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Dedup removed: {} within-split, {} valid/train leaks, {} test leaks, {} unreadable\n\
             Train before balancing: {}\n\
             Train after balancing:  {}\n\
             Class weights: {}\n\
             Split sizes: train {} / valid {} / test {}\n\
             Pretrained backbone: {}\n\
             Best val loss: {:.4}\n",
            self.dedup.within,
            self.dedup.leaked_valid,
            self.dedup.leaked_test,
            self.dedup.unreadable,
            per_class(&self.train_before_balance),
            per_class(&self.train_after_balance),
            weights,
            self.split_sizes[0],
            self.split_sizes[1],
            self.split_sizes[2],
            if self.pretrained { "yes" } else { "no (trained from scratch)" },
            self.best_val_loss,
        )
    }
}

pub fn write_report(path: &Path, summary: &RunSummary, metrics: &str) -> Result<()> {
    let text = format!("{}\n{}", summary.render(), metrics);
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

/// Row-normalised 2x2 heatmap: white = 0%, dark blue = 100% of that true class.
pub fn confusion_heatmap(cm: &ConfusionMatrix) -> RgbImage {
    let side = 2 * CELL + 3 * BORDER;
    let mut img = RgbImage::from_pixel(side, side, Rgb([40, 40, 40]));

    for (t, row) in cm.m.iter().enumerate() {
        let row_total: usize = row.iter().sum();
        for (p, &count) in row.iter().enumerate() {
            let frac = if row_total == 0 { 0.0 } else { count as f64 / row_total as f64 };
            let color = Rgb([
                (255.0 - frac * 225.0) as u8,
                (255.0 - frac * 175.0) as u8,
                (255.0 - frac * 75.0) as u8,
            ]);
            let x0 = BORDER + p as u32 * (CELL + BORDER);
            let y0 = BORDER + t as u32 * (CELL + BORDER);
            for y in y0..y0 + CELL {
                for x in x0..x0 + CELL {
                    img.put_pixel(x, y, color);
                }
            }
        }
    }
    img
}

pub fn save_confusion_png(cm: &ConfusionMatrix, path: &Path) -> Result<()> {
    confusion_heatmap(cm)
        .save(path)
        .with_context(|| format!("save {}", path.display()))
}
