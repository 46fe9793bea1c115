use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

/// How the dataset was laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `<root>/<class>/*`, one pool split in memory
    Pool,
    /// `<root>/{train,valid,test}/<class>/*`
    Presplit,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub classes: Vec<String>,
    pub layout: Layout,
    pub train: Vec<Sample>,
    pub valid: Vec<Sample>,
    pub test: Vec<Sample>,
}

impl Dataset {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn summary(&self) {
        println!(" Dataset summary:");
        for (name, split) in [("Train", &self.train), ("Valid", &self.valid), ("Test", &self.test)] {
            let counts = class_counts(split, self.num_classes());
            let per_class: Vec<String> = self
                .classes
                .iter()
                .zip(&counts)
                .map(|(c, n)| format!("{c}={n}"))
                .collect();
            println!("  {name:<5}: {:>6} images ({})", split.len(), per_class.join(", "));
        }
        println!();
    }
}

fn is_image(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

pub fn list_classes(root: &Path) -> Result<Vec<String>> {
    let train = root.join(Split::Train.dir_name());
    let base = if train.is_dir() { train } else { root.to_path_buf() };

    let classes: Vec<String> = sorted_subdirs(&base)?
        .into_iter()
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .filter(|name| !matches!(name.as_str(), "valid" | "test"))
        .collect();

    if classes.len() < 2 {
        bail!(
            "need at least 2 class directories under {}, found {:?}",
            base.display(),
            classes
        );
    }
    Ok(classes)
}

/// Index of the class treated as positive ("fake") in binary metrics.
pub fn positive_class(classes: &[String]) -> usize {
    classes
        .iter()
        .position(|c| c.to_ascii_lowercase().contains("fake"))
        .unwrap_or(1.min(classes.len().saturating_sub(1)))
}

fn scan_class_dirs(dir: &Path, classes: &[String]) -> Result<Vec<Sample>> {
    let index_map: HashMap<&str, i64> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i as i64))
        .collect();

    let mut samples = Vec::new();
    for class_dir in sorted_subdirs(dir)? {
        let Some(class_name) = class_dir.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(&label) = index_map.get(class_name) else {
            if !matches!(class_name, "train" | "valid" | "test") {
                eprintln!("  ⚠ Class '{}' not in class list, skipping.", class_name);
            }
            continue;
        };

        let mut paths: Vec<PathBuf> = fs::read_dir(&class_dir)
            .with_context(|| format!("read dir {}", class_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        paths.sort();

        samples.extend(paths.into_iter().map(|path| Sample { path, label }));
    }
    Ok(samples)
}

pub fn scan_dataset(root: &Path, classes: &[String]) -> Result<Dataset> {
    let train_dir = root.join(Split::Train.dir_name());
    if !train_dir.is_dir() {
        let pool = scan_class_dirs(root, classes)?;
        if pool.is_empty() {
            bail!("no images found under {}", root.display());
        }
        return Ok(Dataset {
            classes: classes.to_vec(),
            layout: Layout::Pool,
            train: pool,
            valid: Vec::new(),
            test: Vec::new(),
        });
    }

    let read = |split: Split| -> Result<Vec<Sample>> {
        let dir = root.join(split.dir_name());
        if !dir.is_dir() {
            println!("⚠ Split '{}' not found at: {}", split.dir_name(), dir.display());
            return Ok(Vec::new());
        }
        scan_class_dirs(&dir, classes)
    };
    let train = read(Split::Train)?;
    let valid = read(Split::Valid)?;
    let test = read(Split::Test)?;
    if train.is_empty() {
        bail!("training split at {} is empty", train_dir.display());
    }
    Ok(Dataset { classes: classes.to_vec(), layout: Layout::Presplit, train, valid, test })
}

/// Occurrences of each label in `0..n_classes`; out-of-range labels are ignored.
pub fn label_counts<I: IntoIterator<Item = i64>>(labels: I, n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_classes];
    for l in labels {
        if let Some(c) = usize::try_from(l).ok().and_then(|i| counts.get_mut(i)) {
            *c += 1;
        }
    }
    counts
}

pub fn class_counts(samples: &[Sample], n_classes: usize) -> Vec<usize> {
    label_counts(samples.iter().map(|s| s.label), n_classes)
}

/// Every class must have at least one sample in every split.
pub fn check_class_coverage(ds: &Dataset) -> Result<()> {
    for (split, samples) in [(Split::Train, &ds.train), (Split::Valid, &ds.valid), (Split::Test, &ds.test)] {
        let counts = class_counts(samples, ds.num_classes());
        if let Some(missing) = counts.iter().position(|&c| c == 0) {
            bail!(
                "class '{}' has no images in the {} split (counts {:?})",
                ds.classes[missing],
                split.dir_name(),
                counts
            );
        }
    }
    Ok(())
}

fn group_by_class(samples: Vec<Sample>) -> Vec<(i64, Vec<Sample>)> {
    let mut groups: Vec<(i64, Vec<Sample>)> = Vec::new();
    for s in samples {
        match groups.iter_mut().find(|(l, _)| *l == s.label) {
            Some((_, g)) => g.push(s),
            None => groups.push((s.label, vec![s])),
        }
    }
    groups.sort_by_key(|(l, _)| *l);
    groups
}

/// Per-class split into (train, valid, test). A ratio of 0 leaves that split empty.
pub fn stratified_split(
    samples: Vec<Sample>,
    val_ratio: f64,
    test_ratio: f64,
    rng: &mut StdRng,
) -> (Vec<Sample>, Vec<Sample>, Vec<Sample>) {
    let (mut train, mut valid, mut test) = (Vec::new(), Vec::new(), Vec::new());

    for (_, mut group) in group_by_class(samples) {
        group.shuffle(rng);
        let n = group.len();
        let mut n_test = (n as f64 * test_ratio).round() as usize;
        let mut n_val = (n as f64 * val_ratio).round() as usize;
        if n >= 3 {
            if test_ratio > 0.0 {
                n_test = n_test.max(1);
            }
            if val_ratio > 0.0 {
                n_val = n_val.max(1);
            }
        }
        // always leave at least one training sample
        while n_test + n_val >= n && (n_test > 0 || n_val > 0) {
            if n_test >= n_val && n_test > 0 {
                n_test -= 1;
            } else {
                n_val -= 1;
            }
        }

        let mut rest = group.split_off(n_test);
        test.extend(group);
        let tail = rest.split_off(n_val);
        valid.extend(rest);
        train.extend(tail);
    }

    train.shuffle(rng);
    (train, valid, test)
}

/// Fill in whichever of valid/test is missing by carving it out of train.
pub fn ensure_splits(ds: &mut Dataset, val_ratio: f64, test_ratio: f64, rng: &mut StdRng) {
    let need_val = ds.valid.is_empty();
    let need_test = ds.test.is_empty();
    if !need_val && !need_test {
        return;
    }
    let v = if need_val { val_ratio } else { 0.0 };
    let t = if need_test { test_ratio } else { 0.0 };
    if ds.layout == Layout::Presplit {
        println!(
            "⚠ Missing split(s){}{} → carving from TRAIN.",
            if need_val { " valid" } else { "" },
            if need_test { " test" } else { "" }
        );
    }

    let pool = std::mem::take(&mut ds.train);
    let (train, valid, test) = stratified_split(pool, v, t, rng);
    ds.train = train;
    if need_val {
        ds.valid = valid;
    }
    if need_test {
        ds.test = test;
    }
}

/// Decoded, resized images for one split, kept in memory as RGB so each epoch can re-augment.
pub struct LoadedSplit {
    pub images: Vec<RgbImage>,
    pub labels: Vec<i64>,
    pub paths: Vec<PathBuf>,
}

impl LoadedSplit {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

pub fn load_images(name: &str, samples: &[Sample], img_size: u32) -> LoadedSplit {
    println!("\n Loading {} images ({})...", name.to_uppercase(), samples.len());
    let pb = ProgressBar::new(samples.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("  {elapsed_precise} │{bar:40.cyan/blue}│ {pos}/{len} • eta {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );

    let results: Vec<_> = samples
        .par_iter()
        .filter_map(|s| {
            let out = match image::open(&s.path) {
                Ok(img) => {
                    let img = img.resize_exact(img_size, img_size, imageops::FilterType::Triangle);
                    Some((img.to_rgb8(), s.label, s.path.clone()))
                }
                Err(e) => {
                    pb.println(format!("  ⚠ Failed to load {:?}: {}", s.path, e));
                    None
                }
            };
            pb.inc(1);
            out
        })
        .collect();
    pb.finish_and_clear();

    let mut split = LoadedSplit { images: Vec::new(), labels: Vec::new(), paths: Vec::new() };
    for (img, label, path) in results {
        split.images.push(img);
        split.labels.push(label);
        split.paths.push(path);
    }
    println!("✓ Loaded {} images", split.len());
    split
}
