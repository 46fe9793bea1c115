use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use tch::{Device, Kind, Tensor};

const MAX_ZOOM: f32 = 0.10;
const MAX_BRIGHTNESS: f32 = 0.10;
// percent, as understood by imageops::contrast
const MAX_CONTRAST: f32 = 10.0;

const PREVIEW_GRID: u32 = 4;

/// Random horizontal flip, zoom, brightness and contrast. Faces keep their orientation, so there
/// are no vertical flips or rotations.
pub fn augment(img: &RgbImage, rng: &mut StdRng) -> RgbImage {
    let (w, h) = img.dimensions();
    let mut img = if rng.gen::<bool>() { imageops::flip_horizontal(img) } else { img.clone() };

    let zoom = rng.gen::<f32>() * MAX_ZOOM;
    if zoom > 0.01 {
        let cw = ((w as f32) * (1.0 - zoom)).round().max(1.0) as u32;
        let ch = ((h as f32) * (1.0 - zoom)).round().max(1.0) as u32;
        let x = rng.gen_range(0..=w - cw);
        let y = rng.gen_range(0..=h - ch);
        let crop = imageops::crop_imm(&img, x, y, cw, ch).to_image();
        img = imageops::resize(&crop, w, h, imageops::FilterType::Triangle);
    }

    let brightness = (rng.gen::<f32>() * 2.0 - 1.0) * MAX_BRIGHTNESS;
    let contrast = (rng.gen::<f32>() * 2.0 - 1.0) * MAX_CONTRAST;
    let img = imageops::contrast(&img, contrast);
    imageops::brighten(&img, (brightness * 255.0) as i32)
}

fn normalize_tensor(mut tensor: Tensor) -> Tensor {
    tensor = tensor / 255.0;
    (tensor - 0.5) / 0.5
}

/// Stack `idxs` of `images` into an NCHW float batch in [-1, 1]. `rng` enables augmentation.
pub fn batch_tensor(
    images: &[RgbImage],
    idxs: &[usize],
    rng: Option<&mut StdRng>,
    device: Device,
) -> Tensor {
    let (w, h) = images[idxs[0]].dimensions();
    let mut raw: Vec<u8> = Vec::with_capacity(idxs.len() * (w * h * 3) as usize);
    match rng {
        Some(rng) => {
            for &i in idxs {
                raw.extend_from_slice(augment(&images[i], rng).as_raw());
            }
        }
        None => {
            for &i in idxs {
                raw.extend_from_slice(images[i].as_raw());
            }
        }
    }
    let tensor = Tensor::from_slice(&raw)
        .reshape(&[idxs.len() as i64, h as i64, w as i64, 3])
        .to_kind(Kind::Uint8);
    normalize_tensor(tensor.permute(&[0, 3, 1, 2]).to_kind(Kind::Float)).to(device)
}

/// Save a grid of augmented training images so the augmentation strength can be eyeballed.
pub fn save_preview(images: &[RgbImage], path: &Path, rng: &mut StdRng) -> Result<()> {
    let Some(first) = images.first() else {
        return Ok(());
    };
    let (w, h) = first.dimensions();
    let mut grid = RgbImage::new(w * PREVIEW_GRID, h * PREVIEW_GRID);

    let mut idxs: Vec<usize> = (0..images.len()).collect();
    idxs.shuffle(rng);
    for (cell, &i) in idxs.iter().take((PREVIEW_GRID * PREVIEW_GRID) as usize).enumerate() {
        let tile = augment(&images[i], rng);
        let x = (cell as u32 % PREVIEW_GRID) * w;
        let y = (cell as u32 / PREVIEW_GRID) * h;
        imageops::replace(&mut grid, &tile, x as i64, y as i64);
    }
    grid.save(path).with_context(|| format!("save preview {}", path.display()))?;
    Ok(())
}
