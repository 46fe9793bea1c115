use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom};
use tch::{nn, nn::ModuleT, nn::OptimizerConfig, Device, Kind, Reduction, Tensor};

use crate::augment::batch_tensor;
use crate::data::LoadedSplit;
use crate::model::Classifier;

const LR_FACTOR: f64 = 0.5;
const MIN_LR: f64 = 1e-7;
const MIN_DELTA: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct Phase {
    pub name: &'static str,
    pub epochs: usize,
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub phase: &'static str,
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub lr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verdict {
    pub improved: bool,
    pub reduce_lr: bool,
    pub stop: bool,
}

/// Tracks validation loss for checkpointing, plateau LR decay and early stopping.
#[derive(Debug, Clone)]
pub struct Monitor {
    best: f64,
    stale: usize,
    plateau: usize,
    patience: usize,
    lr_patience: usize,
}

impl Monitor {
    pub fn new(patience: usize) -> Self {
        Self {
            best: f64::INFINITY,
            stale: 0,
            plateau: 0,
            patience: patience.max(1),
            lr_patience: (patience / 2).max(1),
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// A new phase keeps the best loss (checkpoints only ever improve) but resets the counters.
    pub fn reset_counters(&mut self) {
        self.stale = 0;
        self.plateau = 0;
    }

    pub fn observe(&mut self, val_loss: f64) -> Verdict {
        if val_loss < self.best - MIN_DELTA {
            self.best = val_loss;
            self.stale = 0;
            self.plateau = 0;
            return Verdict { improved: true, ..Default::default() };
        }
        self.stale += 1;
        self.plateau += 1;
        let reduce_lr = self.plateau >= self.lr_patience;
        if reduce_lr {
            self.plateau = 0;
        }
        Verdict { improved: false, reduce_lr, stop: self.stale >= self.patience }
    }
}

pub struct Trainer<'a> {
    pub vs: &'a nn::VarStore,
    pub net: &'a Classifier,
    pub train: &'a LoadedSplit,
    pub valid: &'a LoadedSplit,
    pub class_weights: Tensor,
    pub batch_size: usize,
    pub device: Device,
    pub model_path: &'a Path,
}

fn weighted_loss(logits: &Tensor, ys: &Tensor, weights: &Tensor) -> Tensor {
    logits
        .log_softmax(-1, Kind::Float)
        .g_nll_loss(ys, Some(weights), Reduction::Mean, -100)
}

/// Mean weighted loss and accuracy over `split`, no augmentation, eval mode.
pub fn evaluate(
    net: &impl nn::ModuleT,
    split: &LoadedSplit,
    weights: &Tensor,
    device: Device,
    batch_size: usize,
) -> (f64, f64) {
    if split.is_empty() {
        return (0.0, 0.0);
    }
    let mut tot_loss = 0.0;
    let mut tot_correct = 0i64;
    let mut tot_seen = 0i64;

    tch::no_grad(|| {
        let idxs: Vec<usize> = (0..split.len()).collect();
        for chunk in idxs.chunks(batch_size) {
            let bxs = batch_tensor(&split.images, chunk, None, device);
            let ys: Vec<i64> = chunk.iter().map(|&i| split.labels[i]).collect();
            let bys = Tensor::from_slice(&ys).to(device);

            let logits = net.forward_t(&bxs, false);
            let n = chunk.len() as i64;
            tot_loss += weighted_loss(&logits, &bys, weights).double_value(&[]) * n as f64;
            tot_correct += logits.argmax(-1, false).eq_tensor(&bys).sum(Kind::Int64).int64_value(&[]);
            tot_seen += n;
        }
    });
    (tot_loss / tot_seen as f64, tot_correct as f64 / tot_seen as f64)
}

impl Trainer<'_> {
    /// One training phase. Returns the records of the epochs actually run.
    pub fn run_phase(&self, phase: &Phase, monitor: &mut Monitor, rng: &mut StdRng) -> Result<Vec<EpochRecord>> {
        let mut opt = nn::Adam::default().build(self.vs, phase.lr)?;
        let mut lr = phase.lr;
        let mut history = Vec::with_capacity(phase.epochs);
        monitor.reset_counters();

        let epoch_pb = ProgressBar::new(phase.epochs as u64);
        epoch_pb.set_style(
            ProgressStyle::with_template(" {spinner:.yellow} [{prefix} {pos}/{len}] {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        epoch_pb.set_prefix(phase.name);

        for epoch in 1..=phase.epochs {
            let mut indices: Vec<usize> = (0..self.train.len()).collect();
            indices.shuffle(rng);

            let batch_pb = ProgressBar::new(indices.len() as u64);
            batch_pb.set_style(
                ProgressStyle::with_template(
                    "  [ep {prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {percent:>3}% {pos}/{len} • {per_sec} • eta {eta_precise} • {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
            );
            batch_pb.set_prefix(epoch.to_string());

            let mut loss_sum = 0.0;
            let mut correct = 0i64;
            let mut seen = 0i64;

            for chunk in indices.chunks(self.batch_size) {
                let bxs = batch_tensor(&self.train.images, chunk, Some(&mut *rng), self.device);
                let ys: Vec<i64> = chunk.iter().map(|&i| self.train.labels[i]).collect();
                let bys = Tensor::from_slice(&ys).to(self.device);

                let logits = self.net.forward_t(&bxs, true);
                let loss = weighted_loss(&logits, &bys, &self.class_weights);
                opt.backward_step(&loss);

                let bs = chunk.len() as i64;
                loss_sum += loss.double_value(&[]) * bs as f64;
                correct += logits.argmax(-1, false).eq_tensor(&bys).sum(Kind::Int64).int64_value(&[]);
                seen += bs;

                batch_pb.set_message(format!(
                    "loss {:.4} • acc {:.2}%",
                    loss_sum / seen as f64,
                    correct as f64 / seen as f64 * 100.0
                ));
                batch_pb.inc(bs as u64);
            }
            batch_pb.finish_and_clear();

            let (val_loss, val_acc) =
                evaluate(self.net, self.valid, &self.class_weights, self.device, self.batch_size);
            let record = EpochRecord {
                phase: phase.name,
                epoch,
                train_loss: loss_sum / seen.max(1) as f64,
                train_acc: correct as f64 / seen.max(1) as f64,
                val_loss,
                val_acc,
                lr,
            };
            epoch_pb.set_message(format!(
                "loss {:.4} • acc {:.2}% • val_loss {:.4} • val_acc {:.2}% • lr {:.1e}",
                record.train_loss,
                record.train_acc * 100.0,
                val_loss,
                val_acc * 100.0,
                lr
            ));
            epoch_pb.inc(1);
            history.push(record);

            let verdict = monitor.observe(val_loss);
            if verdict.improved {
                self.vs
                    .save(self.model_path)
                    .with_context(|| format!("save checkpoint {}", self.model_path.display()))?;
                epoch_pb.println(format!(
                    "💾 [{}] epoch {epoch}: val_loss improved to {:.4} (val acc {:.2}%), saved",
                    phase.name,
                    val_loss,
                    val_acc * 100.0
                ));
            }
            if verdict.stop {
                epoch_pb.println(format!(
                    "⚠ [{}] early stop at epoch {epoch}: no improvement for {} epochs",
                    phase.name, monitor.patience
                ));
                break;
            }
            if verdict.reduce_lr && lr > MIN_LR {
                lr = (lr * LR_FACTOR).max(MIN_LR);
                opt.set_lr(lr);
                epoch_pb.println(format!("  [{}] plateau → lr {:.1e}", phase.name, lr));
            }
        }
        epoch_pb.finish_with_message(format!("{} done", phase.name));
        Ok(history)
    }
}

pub fn write_history(records: &[EpochRecord], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    w.write_record(["phase", "epoch", "train_loss", "train_acc", "val_loss", "val_acc", "lr"])?;
    for r in records {
        w.write_record([
            r.phase.to_string(),
            r.epoch.to_string(),
            format!("{:.6}", r.train_loss),
            format!("{:.6}", r.train_acc),
            format!("{:.6}", r.val_loss),
            format!("{:.6}", r.val_acc),
            format!("{:e}", r.lr),
        ])?;
    }
    w.flush()?;
    Ok(())
}
