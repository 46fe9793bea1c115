use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

// =============== HYPERPARAM & PATH ===============
pub const IMG_SIZE: u32 = 224;
pub const BATCH_SIZE: usize = 16;
pub const HEAD_EPOCHS: usize = 8;
pub const FINETUNE_EPOCHS: usize = 12;
pub const HEAD_LR: f64 = 1e-3;
pub const FINETUNE_LR: f64 = 1e-5;
// trailing bottleneck stages unfrozen in phase 2 (MobileNetV2 has 7)
pub const FINETUNE_STAGES: usize = 3;
pub const PATIENCE: usize = 4;
pub const SEED: u64 = 42;

// 64-bit pHash, max Hamming distance still counted as "same picture"
pub const HASH_THRESHOLD: u32 = 5;

pub const VAL_RATIO: f64 = 0.15;
pub const TEST_RATIO: f64 = 0.15;
pub const DECISION_THRESHOLD: f64 = 0.5;

// MobileNetV2 width multiplier
pub const WIDTH_MULT: f64 = 1.0;

pub const DATA_DIR: &str = "../Data";
pub const OUT_DIR: &str = "../outputs";
pub const PRETRAIN_PATH: &str = "../weights/mobilenet_v2_1_0_imagenet.safetensors";

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a real-vs-deepfake image classifier", long_about = None)]
pub struct Cli {
    /// Dataset root (either <root>/<class>/ or <root>/{train,valid,test}/<class>/)
    #[arg(long, default_value = DATA_DIR)]
    pub data_dir: PathBuf,

    /// Where checkpoints, logs and plots are written
    #[arg(long, default_value = OUT_DIR)]
    pub out_dir: PathBuf,

    /// Pretrained MobileNetV2 weights (safetensors)
    #[arg(long, default_value = PRETRAIN_PATH)]
    pub pretrained: PathBuf,

    #[arg(long, default_value_t = IMG_SIZE)]
    pub img_size: u32,

    #[arg(long, default_value_t = BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, default_value_t = HEAD_EPOCHS)]
    pub head_epochs: usize,

    #[arg(long, default_value_t = FINETUNE_EPOCHS)]
    pub finetune_epochs: usize,

    #[arg(long, default_value_t = HEAD_LR)]
    pub head_lr: f64,

    #[arg(long, default_value_t = FINETUNE_LR)]
    pub finetune_lr: f64,

    /// Number of trailing backbone stages unfrozen for fine-tuning
    #[arg(long, default_value_t = FINETUNE_STAGES)]
    pub finetune_stages: usize,

    /// Max Hamming distance between perceptual hashes treated as duplicates
    #[arg(long, default_value_t = HASH_THRESHOLD)]
    pub hash_threshold: u32,

    #[arg(long, default_value_t = VAL_RATIO)]
    pub val_ratio: f64,

    #[arg(long, default_value_t = TEST_RATIO)]
    pub test_ratio: f64,

    /// Skip undersampling the majority class (class weights still apply)
    #[arg(long)]
    pub no_balance: bool,

    #[arg(long, default_value_t = PATIENCE)]
    pub patience: usize,

    #[arg(long, default_value_t = SEED)]
    pub seed: u64,

    /// Decision threshold on P(fake)
    #[arg(long, default_value_t = DECISION_THRESHOLD)]
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub pretrained_path: PathBuf,
    pub img_size: u32,
    pub batch_size: usize,
    pub head_epochs: usize,
    pub finetune_epochs: usize,
    pub head_lr: f64,
    pub finetune_lr: f64,
    pub finetune_stages: usize,
    pub hash_threshold: u32,
    pub val_ratio: f64,
    pub test_ratio: f64,
    pub balance: bool,
    pub patience: usize,
    pub seed: u64,
    pub threshold: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: DATA_DIR.into(),
            out_dir: OUT_DIR.into(),
            pretrained_path: PRETRAIN_PATH.into(),
            img_size: IMG_SIZE,
            batch_size: BATCH_SIZE,
            head_epochs: HEAD_EPOCHS,
            finetune_epochs: FINETUNE_EPOCHS,
            head_lr: HEAD_LR,
            finetune_lr: FINETUNE_LR,
            finetune_stages: FINETUNE_STAGES,
            hash_threshold: HASH_THRESHOLD,
            val_ratio: VAL_RATIO,
            test_ratio: TEST_RATIO,
            balance: true,
            patience: PATIENCE,
            seed: SEED,
            threshold: DECISION_THRESHOLD,
        }
    }
}

impl Cli {
    pub fn into_config(self) -> TrainConfig {
        TrainConfig {
            data_dir: self.data_dir,
            out_dir: self.out_dir,
            pretrained_path: self.pretrained,
            img_size: self.img_size,
            batch_size: self.batch_size,
            head_epochs: self.head_epochs,
            finetune_epochs: self.finetune_epochs,
            head_lr: self.head_lr,
            finetune_lr: self.finetune_lr,
            finetune_stages: self.finetune_stages,
            hash_threshold: self.hash_threshold,
            val_ratio: self.val_ratio,
            test_ratio: self.test_ratio,
            balance: !self.no_balance,
            patience: self.patience,
            seed: self.seed,
            threshold: self.threshold,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, r) in [("val_ratio", self.val_ratio), ("test_ratio", self.test_ratio)] {
            if !(r > 0.0 && r < 1.0) {
                bail!("{name} must be in (0, 1), got {r}");
            }
        }
        if self.val_ratio + self.test_ratio >= 1.0 {
            bail!(
                "val_ratio + test_ratio must leave room for training ({} + {})",
                self.val_ratio,
                self.test_ratio
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be > 0");
        }
        if self.img_size < 32 {
            bail!("img_size {} too small for MobileNetV2 (min 32)", self.img_size);
        }
        if self.head_lr <= 0.0 || self.finetune_lr <= 0.0 {
            bail!("learning rates must be positive");
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            bail!("threshold must be in (0, 1), got {}", self.threshold);
        }
        Ok(())
    }

    pub fn model_path(&self) -> PathBuf {
        self.out_dir.join("best_mobilenet_v2_deepfake.safetensors")
    }

    pub fn final_model_path(&self) -> PathBuf {
        self.out_dir.join("final_mobilenet_v2_deepfake.safetensors")
    }

    pub fn history_path(&self) -> PathBuf {
        self.out_dir.join("history.csv")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.out_dir.join("predictions.csv")
    }

    pub fn report_path(&self) -> PathBuf {
        self.out_dir.join("report.txt")
    }

    pub fn confusion_png_path(&self) -> PathBuf {
        self.out_dir.join("confusion_matrix.png")
    }

    pub fn preview_png_path(&self) -> PathBuf {
        self.out_dir.join("augmentation_preview.png")
    }
}
