use std::{fs, time::Instant};

use anyhow::{bail, Result};
use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use tch::{nn, Device, Tensor};

mod augment;
mod balance;
mod config;
mod data;
mod dedup;
mod metrics;
mod model;
mod pretrained;
mod report;
mod train;

use config::{Cli, WIDTH_MULT};
use data::class_counts;
use metrics::Evaluation;
use model::Classifier;
use train::{Monitor, Phase, Trainer};

const NUM_CLASSES: usize = 2;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cfg = Cli::parse().into_config();
    cfg.validate()?;

    tch::set_num_threads(num_cpus::get() as i32);
    tch::set_num_interop_threads(1);
    tch::manual_seed(cfg.seed as i64);
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let device = Device::cuda_if_available();
    println!("Using device: {:?} | threads: {} | seed: {}", device, num_cpus::get(), cfg.seed);

    // ===== DATA =====
    let classes = data::list_classes(&cfg.data_dir)?;
    if classes.len() != NUM_CLASSES {
        bail!("expected exactly 2 classes (real / fake), found {:?}", classes);
    }
    let positive = data::positive_class(&classes);
    let negative = 1 - positive;
    println!("✓ Classes: {:?} (positive: '{}')\n", classes, classes[positive]);

    let mut ds = data::scan_dataset(&cfg.data_dir, &classes)?;
    let dedup_report = dedup::deduplicate(&mut ds, cfg.hash_threshold);
    data::ensure_splits(&mut ds, cfg.val_ratio, cfg.test_ratio, &mut rng);
    if ds.valid.is_empty() || ds.test.is_empty() {
        bail!("not enough images left after dedup to build validation and test splits");
    }
    data::check_class_coverage(&ds)?;

    let train_before = class_counts(&ds.train, NUM_CLASSES);
    if cfg.balance {
        ds.train = balance::undersample(std::mem::take(&mut ds.train), NUM_CLASSES, &mut rng);
        println!("⚖ Balanced train by undersampling: {:?} → {:?}", train_before, class_counts(&ds.train, NUM_CLASSES));
        data::check_class_coverage(&ds)?;
    }
    let train_after = class_counts(&ds.train, NUM_CLASSES);
    ds.summary();

    fs::create_dir_all(&cfg.out_dir)?;
    println!("Outputs will be written to: {}", cfg.out_dir.display());

    let train_set = data::load_images("train", &ds.train, cfg.img_size);
    let valid_set = data::load_images("valid", &ds.valid, cfg.img_size);
    let test_set = data::load_images("test", &ds.test, cfg.img_size);
    if train_set.is_empty() || valid_set.is_empty() || test_set.is_empty() {
        bail!("a split has no decodable images");
    }
    for (name, split) in [("train", &train_set), ("valid", &valid_set), ("test", &test_set)] {
        let counts = data::label_counts(split.labels.iter().copied(), NUM_CLASSES);
        if counts.contains(&0) {
            bail!("{name} split lost a class to undecodable images: {counts:?}");
        }
    }

    let weights = balance::class_weights(&train_set.labels, NUM_CLASSES);
    println!("⚖ Class weights: {:?}", weights);
    let weights_f32: Vec<f32> = weights.iter().map(|&w| w as f32).collect();
    let class_weights = Tensor::from_slice(&weights_f32).to(device);

    augment::save_preview(&train_set.images, &cfg.preview_png_path(), &mut rng)?;
    println!("💾 Augmentation preview: {}\n", cfg.preview_png_path().display());

    // ===== TRAINING =====
    let model_path = cfg.model_path();
    let mut monitor = Monitor::new(cfg.patience);
    let mut history = Vec::new();
    let has_pretrained;
    {
        let mut vs = nn::VarStore::new(device);
        let mut net = Classifier::new(&vs.root(), WIDTH_MULT, NUM_CLASSES as i64);

        has_pretrained = if cfg.pretrained_path.exists() {
            match pretrained::load_backbone(&mut vs, &cfg.pretrained_path, WIDTH_MULT) {
                Ok(r) => {
                    println!(
                        "✓ Loaded pretrained base from {} (copied {}, shape mismatch {}, unmapped {})",
                        cfg.pretrained_path.display(),
                        r.copied,
                        r.shape_mismatch,
                        r.unmapped
                    );
                    true
                }
                Err(e) => {
                    println!("⚠ Pretrained load failed: {e:#}");
                    false
                }
            }
        } else {
            println!("⚠ Pretrained file not found: {}", cfg.pretrained_path.display());
            false
        };

        let head_phase = if has_pretrained {
            let frozen = model::freeze_base(&vs);
            net.set_trainable_stages(0);
            println!("✓ Frozen base params: {}", frozen);
            Phase { name: "head", epochs: cfg.head_epochs, lr: cfg.head_lr }
        } else {
            println!("⚠ No pretrained backbone → training the full network in a single phase.");
            Phase { name: "full", epochs: cfg.head_epochs + cfg.finetune_epochs, lr: cfg.head_lr }
        };
        println!("🧠 Trainable parameters: {}", model::trainable_params(&vs));

        println!("\nStarting training...\n");
        {
            let trainer = Trainer {
                vs: &vs,
                net: &net,
                train: &train_set,
                valid: &valid_set,
                class_weights: class_weights.shallow_clone(),
                batch_size: cfg.batch_size,
                device,
                model_path: &model_path,
            };
            history.extend(trainer.run_phase(&head_phase, &mut monitor, &mut rng)?);
        }

        if has_pretrained && cfg.finetune_epochs > 0 {
            let unfrozen = model::unfreeze_top(&vs, cfg.finetune_stages);
            net.set_trainable_stages(cfg.finetune_stages);
            println!(
                "\n✓ Unfroze top {} stages ({} params tensors) → {} trainable parameters\n",
                cfg.finetune_stages,
                unfrozen,
                model::trainable_params(&vs)
            );
            let trainer = Trainer {
                vs: &vs,
                net: &net,
                train: &train_set,
                valid: &valid_set,
                class_weights: class_weights.shallow_clone(),
                batch_size: cfg.batch_size,
                device,
                model_path: &model_path,
            };
            let phase = Phase { name: "finetune", epochs: cfg.finetune_epochs, lr: cfg.finetune_lr };
            history.extend(trainer.run_phase(&phase, &mut monitor, &mut rng)?);
        }

        if !model_path.exists() {
            vs.save(&model_path)?;
        }
        vs.save(cfg.final_model_path())?;
        println!("💾 Final weights: {}", cfg.final_model_path().display());
    }
    train::write_history(&history, &cfg.history_path())?;
    println!("💾 Training log: {}", cfg.history_path().display());

    // ===== TEST =====
    println!("\n🧪 Evaluating best checkpoint on test set...");
    let mut vs = nn::VarStore::new(device);
    let net = Classifier::new(&vs.root(), WIDTH_MULT, NUM_CLASSES as i64);
    vs.load(&model_path)?;

    let (test_loss, test_acc) = train::evaluate(&net, &test_set, &class_weights, device, cfg.batch_size);
    println!("✓ Test Loss: {:.4} | Test Accuracy: {:.2}%", test_loss, test_acc * 100.0);

    let probs = metrics::predict(&net, &test_set, positive, device, cfg.batch_size)?;
    let truth: Vec<bool> = test_set.labels.iter().map(|&l| l as usize == positive).collect();
    let eval = Evaluation::new(&probs, &truth, cfg.threshold);
    let text = eval.render([classes[negative].as_str(), classes[positive].as_str()]);
    println!("\n{text}");

    report::write_predictions(
        &cfg.predictions_path(),
        &test_set.paths,
        &test_set.labels,
        &classes,
        &probs,
        cfg.threshold,
        positive,
    )?;
    let summary = report::RunSummary {
        classes: &classes,
        dedup: dedup_report,
        train_before_balance: train_before,
        train_after_balance: train_after,
        class_weights: weights,
        split_sizes: [train_set.len(), valid_set.len(), test_set.len()],
        pretrained: has_pretrained,
        best_val_loss: monitor.best(),
    };
    report::write_report(&cfg.report_path(), &summary, &text)?;
    report::save_confusion_png(&eval.confusion, &cfg.confusion_png_path())?;
    println!("💾 Predictions: {}", cfg.predictions_path().display());
    println!("💾 Report: {}", cfg.report_path().display());
    println!("💾 Confusion matrix: {}", cfg.confusion_png_path().display());

    println!("\n⏱ Total time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
