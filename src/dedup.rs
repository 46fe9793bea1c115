//! Perceptual-hash deduplication.
//!
//! Near-identical frames (re-encodes, crops of the same face, consecutive video
//! frames) inflate accuracy when one copy lands in train and another in test.
//! Every sample gets a 64-bit DCT mean hash; two samples whose hashes differ in
//! at most `threshold` bits are treated as the same picture.

use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::data::{Dataset, Layout, Sample};

pub struct Hashed {
    pub sample: Sample,
    pub hash: ImageHash,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupReport {
    pub unreadable: usize,
    pub within: usize,
    pub leaked_valid: usize,
    pub leaked_test: usize,
}

fn hasher() -> Hasher {
    HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .hash_size(8, 8)
        .to_hasher()
}

/// Hash every sample in parallel; returns hashes in input order plus the number of unreadable files.
pub fn hash_samples(samples: Vec<Sample>, pb: &ProgressBar) -> (Vec<Hashed>, usize) {
    let n = samples.len();
    let hashed: Vec<Hashed> = samples
        .into_par_iter()
        .map_init(hasher, |h, sample| {
            let out = match image::open(&sample.path) {
                Ok(img) => Some(Hashed { hash: h.hash_image(&img), sample }),
                Err(e) => {
                    pb.println(format!("  ⚠ Cannot hash {:?}: {}", sample.path, e));
                    None
                }
            };
            pb.inc(1);
            out
        })
        .flatten()
        .collect();
    let unreadable = n - hashed.len();
    (hashed, unreadable)
}

fn near_any(hash: &ImageHash, kept: &[ImageHash], threshold: u32) -> bool {
    kept.iter().any(|k| hash.dist(k) <= threshold)
}

/// Keep the first occurrence of every near-duplicate group, in input order.
pub fn dedup_within(items: Vec<Hashed>, threshold: u32) -> (Vec<Hashed>, usize) {
    let mut kept: Vec<Hashed> = Vec::with_capacity(items.len());
    let mut removed = 0;
    for item in items {
        if kept.iter().any(|k| item.hash.dist(&k.hash) <= threshold) {
            removed += 1;
        } else {
            kept.push(item);
        }
    }
    (kept, removed)
}

/// Drop every candidate that is near any reference hash.
pub fn remove_leakage(
    reference: &[ImageHash],
    candidates: Vec<Hashed>,
    threshold: u32,
) -> (Vec<Hashed>, usize) {
    let before = candidates.len();
    let kept: Vec<Hashed> = candidates
        .into_par_iter()
        .filter(|c| !near_any(&c.hash, reference, threshold))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

fn hashes(items: &[Hashed]) -> Vec<ImageHash> {
    items.iter().map(|h| h.hash.clone()).collect()
}

fn unwrap_samples(items: Vec<Hashed>) -> Vec<Sample> {
    items.into_iter().map(|h| h.sample).collect()
}

/// Deduplicate each split, then strip valid/test images that already appear (near-)identically
/// in an earlier split. Pool datasets are only deduplicated within the pool, before splitting.
pub fn deduplicate(ds: &mut Dataset, threshold: u32) -> DedupReport {
    let total = (ds.train.len() + ds.valid.len() + ds.test.len()) as u64;
    println!("🔍 Hashing {} images (pHash 64-bit, threshold {})...", total, threshold);
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("  {elapsed_precise} │{bar:40.yellow/blue}│ {pos}/{len} • {per_sec}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );

    let mut report = DedupReport::default();

    let (train, bad) = hash_samples(std::mem::take(&mut ds.train), &pb);
    report.unreadable += bad;
    let (valid, bad) = hash_samples(std::mem::take(&mut ds.valid), &pb);
    report.unreadable += bad;
    let (test, bad) = hash_samples(std::mem::take(&mut ds.test), &pb);
    report.unreadable += bad;
    pb.finish_and_clear();

    let (train, n) = dedup_within(train, threshold);
    report.within += n;
    let (valid, n) = dedup_within(valid, threshold);
    report.within += n;
    let (test, n) = dedup_within(test, threshold);
    report.within += n;

    let (valid, test) = if ds.layout == Layout::Presplit {
        let train_hashes = hashes(&train);
        let (valid, leaked) = remove_leakage(&train_hashes, valid, threshold);
        report.leaked_valid = leaked;

        let mut seen = train_hashes;
        seen.extend(hashes(&valid));
        let (test, leaked) = remove_leakage(&seen, test, threshold);
        report.leaked_test = leaked;
        (valid, test)
    } else {
        (valid, test)
    };

    ds.train = unwrap_samples(train);
    ds.valid = unwrap_samples(valid);
    ds.test = unwrap_samples(test);

    println!(
        "✓ Dedup: removed {} within-split, {} valid↔train, {} test↔train/valid, {} unreadable",
        report.within, report.leaked_valid, report.leaked_test, report.unreadable
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn h(bits: u64) -> ImageHash {
        ImageHash::from_bytes(&bits.to_be_bytes()).unwrap()
    }

    fn item(name: &str, bits: u64) -> Hashed {
        Hashed { sample: Sample { path: PathBuf::from(name), label: 0 }, hash: h(bits) }
    }

    fn names(items: &[Hashed]) -> Vec<String> {
        items.iter().map(|i| i.sample.path.display().to_string()).collect()
    }

    #[test]
    fn keeps_first_of_each_group() {
        let items = vec![
            item("a", 0),
            item("b", 0b111),  // 3 bits from a
            item("c", u64::MAX),
            item("d", 0),
        ];
        let (kept, removed) = dedup_within(items, 3);
        assert_eq!(names(&kept), vec!["a", "c"]);
        assert_eq!(removed, 2);
    }

    #[test]
    fn zero_threshold_only_drops_exact_matches() {
        let items = vec![item("a", 0), item("b", 1), item("c", 0)];
        let (kept, removed) = dedup_within(items, 0);
        assert_eq!(names(&kept), vec!["a", "b"]);
        assert_eq!(removed, 1);
    }

    #[test]
    fn leakage_is_removed_from_candidates_only() {
        let reference = vec![h(0), h(0xFFFF_0000_0000_0000)];
        let candidates = vec![item("x", 0b1), item("y", 0x00FF_00FF_00FF_00FF), item("z", 0xFFFF_0000_0000_0001)];
        let (kept, removed) = remove_leakage(&reference, candidates, 2);
        assert_eq!(names(&kept), vec!["y"]);
        assert_eq!(removed, 2);
    }

    #[test]
    fn deduplicate_strips_test_copies_of_train_images() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let gradient = image::RgbImage::from_fn(64, 64, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
        let checker = image::RgbImage::from_fn(64, 64, |x, y| {
            let v = if (x / 8 + y / 8) % 2 == 0 { 255 } else { 0 };
            image::Rgb([v, v, v])
        });
        for p in ["train/fake/a.png", "train/fake/a_copy.png", "test/fake/a_leak.png"] {
            let path = root.join(p);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            gradient.save(&path).unwrap();
        }
        let path = root.join("test/fake/other.png");
        checker.save(&path).unwrap();

        let mut ds = Dataset {
            classes: vec!["fake".into(), "real".into()],
            layout: Layout::Presplit,
            train: vec![
                Sample { path: root.join("train/fake/a.png"), label: 0 },
                Sample { path: root.join("train/fake/a_copy.png"), label: 0 },
            ],
            valid: Vec::new(),
            test: vec![
                Sample { path: root.join("test/fake/a_leak.png"), label: 0 },
                Sample { path: path.clone(), label: 0 },
            ],
        };
        let report = deduplicate(&mut ds, 4);
        assert_eq!(report.within, 1);
        assert_eq!(report.leaked_test, 1);
        assert_eq!(ds.train.len(), 1);
        assert_eq!(ds.test, vec![Sample { path, label: 0 }]);
    }

    fn gradient() -> image::RgbImage {
        image::RgbImage::from_fn(64, 64, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 128]))
    }

    fn checker(tile: u32, shift: u32) -> image::RgbImage {
        image::RgbImage::from_fn(64, 64, |x, y| {
            let v = if ((x + shift) / tile + y / tile) % 2 == 0 { 255 } else { 0 };
            image::Rgb([v, v, v])
        })
    }

    fn save(img: &image::RgbImage, path: &std::path::Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        img.save(path).unwrap();
    }

    #[test]
    fn deduplicate_strips_valid_copies_of_train_and_test_copies_of_valid() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let grad = gradient();
        let board = checker(8, 0);
        save(&grad, &root.join("train/fake/a.png"));
        save(&grad, &root.join("valid/fake/a_again.png"));
        save(&board, &root.join("valid/real/b.png"));
        save(&board, &root.join("test/real/b_again.png"));

        let s = |p: &str, label| Sample { path: root.join(p), label };
        let mut ds = Dataset {
            classes: vec!["fake".into(), "real".into()],
            layout: Layout::Presplit,
            train: vec![s("train/fake/a.png", 0)],
            valid: vec![s("valid/fake/a_again.png", 0), s("valid/real/b.png", 1)],
            test: vec![s("test/real/b_again.png", 1)],
        };
        let report = deduplicate(&mut ds, 4);
        assert_eq!(report.within, 0);
        assert_eq!(report.leaked_valid, 1);
        assert_eq!(report.leaked_test, 1);
        assert_eq!(ds.train, vec![s("train/fake/a.png", 0)]);
        assert_eq!(ds.valid, vec![s("valid/real/b.png", 1)]);
        assert!(ds.test.is_empty());
    }

    #[test]
    fn pool_splits_share_no_near_duplicates() {
        use rand::{rngs::StdRng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let fakes = [checker(4, 0), checker(8, 0), checker(16, 0), checker(32, 0), checker(8, 4), checker(16, 8)];
        for (i, img) in fakes.iter().enumerate() {
            save(img, &root.join(format!("fake/{i}.png")));
            save(img, &root.join(format!("fake/{i}_copy.png")));
        }
        let reals = [
            gradient(),
            image::RgbImage::from_fn(64, 64, |x, _| image::Rgb([(x * 4) as u8; 3])),
            image::RgbImage::from_fn(64, 64, |_, y| image::Rgb([(y * 4) as u8; 3])),
            image::RgbImage::from_fn(64, 64, |x, y| image::Rgb([((x + y) * 2) as u8; 3])),
            image::RgbImage::from_fn(64, 64, |x, y| image::Rgb([((126 + x) - y) as u8; 3])),
            image::RgbImage::from_fn(64, 64, |x, y| {
                let d = (x as i32 - 32).pow(2) + (y as i32 - 32).pow(2);
                image::Rgb([if d < 300 { 255 } else { 0 }; 3])
            }),
        ];
        for (i, img) in reals.iter().enumerate() {
            save(img, &root.join(format!("real/{i}.png")));
            save(img, &root.join(format!("real/{i}_copy.png")));
        }

        let threshold = 5;
        let classes = crate::data::list_classes(root).unwrap();
        let mut ds = crate::data::scan_dataset(root, &classes).unwrap();
        assert_eq!(ds.layout, Layout::Pool);
        let report = deduplicate(&mut ds, threshold);
        assert!(report.within >= 12);
        crate::data::ensure_splits(&mut ds, 0.2, 0.2, &mut StdRng::seed_from_u64(42));
        assert!(!ds.train.is_empty() && !ds.valid.is_empty() && !ds.test.is_empty());

        let pb = ProgressBar::hidden();
        let splits: Vec<Vec<ImageHash>> = [&ds.train, &ds.valid, &ds.test]
            .into_iter()
            .map(|split| hashes(&hash_samples(split.clone(), &pb).0))
            .collect();
        for (i, a) in splits.iter().enumerate() {
            for b in &splits[i + 1..] {
                for ha in a {
                    assert!(b.iter().all(|hb| ha.dist(hb) > threshold));
                }
            }
        }
    }
}
