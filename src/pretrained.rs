//! Loading ImageNet MobileNetV2 weights into the `base.*` half of the classifier.
//!
//! Accepted layouts:
//! - timm: `conv_stem`, `bn1`, `blocks.K.conv.{pw,pw_bn,dw,dw_bn,pw_linear,pw_linear_bn}`,
//!   `conv_head`, `bn2` with `K` a flat block index
//! - stage/block: `blocks.I.J.{conv_pw,conv_dw,conv_pwl,bn1,bn2,bn3}`, with `conv_pw_1` also
//!   accepted for the project conv
//! - a checkpoint of this program, already named `base.*`

use std::{collections::HashMap, fs, path::Path};

use anyhow::{bail, Context, Result};
use bytemuck::cast_slice;
use half::{bf16, f16};
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};

use crate::model::{block_prefix, round_channels, STAGES};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub copied: usize,
    pub shape_mismatch: usize,
    pub unmapped: usize,
}

fn read_safetensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    let bytes = fs::read(path).with_context(|| format!("read file {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes).with_context(|| "deserialize safetensors")?;
    let mut map = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name).with_context(|| format!("get tensor {}", name))?;
        let shape: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        // safetensors data is not guaranteed to be aligned for the target type
        let t = match tv.dtype() {
            Dtype::F32 => {
                let v: Vec<f32> = cast_slice::<u8, [u8; 4]>(data).iter().map(|b| f32::from_le_bytes(*b)).collect();
                Tensor::from_slice(&v).reshape(&shape)
            }
            Dtype::F16 => {
                let v: Vec<f32> = cast_slice::<u8, [u8; 2]>(data)
                    .iter()
                    .map(|b| f16::from_le_bytes(*b).to_f32())
                    .collect();
                Tensor::from_slice(&v).reshape(&shape)
            }
            Dtype::BF16 => {
                let v: Vec<f32> = cast_slice::<u8, [u8; 2]>(data)
                    .iter()
                    .map(|b| bf16::from_le_bytes(*b).to_f32())
                    .collect();
                Tensor::from_slice(&v).reshape(&shape)
            }
            Dtype::I64 => {
                let v: Vec<i64> = cast_slice::<u8, [u8; 8]>(data).iter().map(|b| i64::from_le_bytes(*b)).collect();
                Tensor::from_slice(&v).reshape(&shape).to_kind(Kind::Int64)
            }
            Dtype::I32 => {
                let v: Vec<i32> = cast_slice::<u8, [u8; 4]>(data).iter().map(|b| i32::from_le_bytes(*b)).collect();
                Tensor::from_slice(&v).reshape(&shape).to_kind(Kind::Int)
            }
            other => {
                eprintln!("  ⚠ Skipping tensor {} with unsupported dtype {:?}", name, other);
                continue;
            }
        };
        map.insert(name.to_string(), t);
    }
    Ok(map)
}

/// Flat block index -> (stage, block within stage).
fn flat_to_stage(mut k: usize) -> Option<(usize, usize)> {
    for (i, &(_, _, n, _)) in STAGES.iter().enumerate() {
        if k < n as usize {
            return Some((i, k));
        }
        k -= n as usize;
    }
    None
}

pub fn map_timm_key(key: &str) -> Option<String> {
    if key == "conv_stem.weight" {
        return Some("base.stem.weight".into());
    }
    if let Some(rest) = key.strip_prefix("bn1.") {
        return Some(format!("base.stem.bn.{rest}"));
    }
    if key == "conv_head.weight" {
        return Some("base.last.weight".into());
    }
    if let Some(rest) = key.strip_prefix("bn2.") {
        return Some(format!("base.last.bn.{rest}"));
    }

    let rem = key.strip_prefix("blocks.")?;
    let mut it = rem.splitn(3, '.');
    let k: usize = it.next()?.parse().ok()?;
    if it.next()? != "conv" {
        return None;
    }
    let tail = it.next()?;
    let (i, j) = flat_to_stage(k)?;
    let block = block_prefix(i, j);

    // longest prefixes first: "pw_linear_bn." also starts with "pw_"
    const PARTS: &[(&str, &str)] = &[
        ("pw_linear_bn.", "project.bn"),
        ("pw_linear.", "project"),
        ("pw_bn.", "expand.bn"),
        ("pw.", "expand"),
        ("dw_bn.", "dw.bn"),
        ("dw.", "dw"),
    ];
    PARTS
        .iter()
        .find_map(|(from, to)| tail.strip_prefix(from).map(|sfx| format!("{block}.{to}.{sfx}")))
}

/// Maps `blocks.I.J.*`. `out_channels` is the first dim of the source tensor, used to tell an
/// expand conv from a project conv when both are named `conv_pw`.
pub fn map_stage_block_key(key: &str, alpha: f64, out_channels: Option<i64>) -> Option<String> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.len() < 4 || parts[0] != "blocks" {
        return None;
    }
    let i: usize = parts[1].parse().ok()?;
    let j: usize = parts[2].parse().ok()?;
    let &(t, c, n, _) = STAGES.get(i)?;
    if j >= n as usize {
        return None;
    }
    let tail = parts[3..].join(".");
    let block = block_prefix(i, j);

    // input channels of block (i, j)
    let in_c = if j > 0 {
        round_channels(c, alpha)
    } else if i == 0 {
        round_channels(32, alpha)
    } else {
        round_channels(STAGES[i - 1].1, alpha)
    };
    let hidden = in_c * t;

    match tail.as_str() {
        "conv_dw.weight" => return Some(format!("{block}.dw.weight")),
        "conv_pwl.weight" | "conv_pw_1.weight" => return Some(format!("{block}.project.weight")),
        "conv_pw.weight" => {
            let expand = t != 1 && out_channels.map_or(true, |o| o == hidden);
            let which = if expand { "expand" } else { "project" };
            return Some(format!("{block}.{which}.weight"));
        }
        _ => {}
    }

    let (bn, rest) = tail.split_once('.')?;
    if rest == "num_batches_tracked" {
        return None;
    }
    let target = match (t == 1, bn) {
        (true, "bn1") => "dw.bn",
        (true, "bn2") => "project.bn",
        (false, "bn1") => "expand.bn",
        (false, "bn2") => "dw.bn",
        (false, "bn3") => "project.bn",
        _ => return None,
    };
    Some(format!("{block}.{target}.{rest}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schema {
    Native,
    Timm,
    StageBlock,
    Unknown,
}

fn detect_schema(src: &HashMap<String, Tensor>) -> Schema {
    if src.keys().any(|k| k.starts_with("base.")) {
        Schema::Native
    } else if src.contains_key("conv_stem.weight") || src.keys().any(|k| k.starts_with("blocks.") && k.contains(".conv.")) {
        Schema::Timm
    } else if src.keys().any(|k| k.starts_with("blocks.") && k.matches('.').count() >= 3) {
        Schema::StageBlock
    } else {
        Schema::Unknown
    }
}

/// Copy every mappable, shape-compatible tensor from `path` into `vs`. Errors if nothing was copied.
pub fn load_backbone(vs: &mut nn::VarStore, path: &Path, alpha: f64) -> Result<LoadReport> {
    let src = read_safetensors(path)?;
    let schema = detect_schema(&src);
    let mut targets = vs.variables();
    let mut report = LoadReport::default();

    for (key, tensor) in src.iter() {
        let dst = match schema {
            Schema::Native => key.starts_with("base.").then(|| key.clone()),
            Schema::Timm => map_timm_key(key),
            Schema::StageBlock => map_stage_block_key(key, alpha, tensor.size().first().copied()),
            Schema::Unknown => None,
        };
        let Some(dst) = dst else {
            report.unmapped += 1;
            continue;
        };
        match targets.get_mut(&dst) {
            Some(var) if var.size() == tensor.size() => {
                tch::no_grad(|| {
                    var.copy_(tensor);
                });
                report.copied += 1;
            }
            _ => report.shape_mismatch += 1,
        }
    }

    if report.copied == 0 {
        bail!("no tensors copied from '{}' (schema {:?})", path.display(), schema);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classifier;
    use tch::Device;

    #[test]
    fn timm_keys() {
        assert_eq!(map_timm_key("conv_stem.weight").as_deref(), Some("base.stem.weight"));
        assert_eq!(map_timm_key("bn2.running_var").as_deref(), Some("base.last.bn.running_var"));
        assert_eq!(map_timm_key("blocks.0.conv.dw.weight").as_deref(), Some("base.ir_0_0.dw.weight"));
        // flat index 3 = stage 2, first block
        assert_eq!(
            map_timm_key("blocks.3.conv.pw_linear_bn.bias").as_deref(),
            Some("base.ir_2_0.project.bn.bias")
        );
        assert_eq!(map_timm_key("blocks.16.conv.pw.weight").as_deref(), Some("base.ir_6_0.expand.weight"));
        assert_eq!(map_timm_key("blocks.17.conv.pw.weight"), None);
        assert_eq!(map_timm_key("classifier.weight"), None);
    }

    #[test]
    fn stage_block_keys() {
        assert_eq!(
            map_stage_block_key("blocks.0.0.bn1.weight", 1.0, None).as_deref(),
            Some("base.ir_0_0.dw.bn.weight")
        );
        assert_eq!(
            map_stage_block_key("blocks.1.0.bn3.running_mean", 1.0, None).as_deref(),
            Some("base.ir_1_0.project.bn.running_mean")
        );
        // stage 1 block 0: in 16, hidden 96
        assert_eq!(
            map_stage_block_key("blocks.1.0.conv_pw.weight", 1.0, Some(96)).as_deref(),
            Some("base.ir_1_0.expand.weight")
        );
        assert_eq!(
            map_stage_block_key("blocks.1.0.conv_pw.weight", 1.0, Some(24)).as_deref(),
            Some("base.ir_1_0.project.weight")
        );
        assert_eq!(
            map_stage_block_key("blocks.1.0.conv_pwl.weight", 1.0, Some(24)).as_deref(),
            Some("base.ir_1_0.project.weight")
        );
        assert_eq!(
            map_stage_block_key("blocks.0.0.conv_pwl.weight", 1.0, Some(16)).as_deref(),
            Some("base.ir_0_0.project.weight")
        );
        assert_eq!(map_stage_block_key("blocks.1.0.bn1.num_batches_tracked", 1.0, None), None);
        assert_eq!(map_stage_block_key("blocks.6.1.conv_dw.weight", 1.0, None), None);
    }

    #[test]
    fn roundtrip_native_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");

        let src_vs = nn::VarStore::new(Device::Cpu);
        let _src = Classifier::new(&src_vs.root(), 0.35, 2);
        src_vs.save(&path).unwrap();

        let mut dst_vs = nn::VarStore::new(Device::Cpu);
        let _dst = Classifier::new(&dst_vs.root(), 0.35, 2);
        let report = load_backbone(&mut dst_vs, &path, 0.35).unwrap();

        let n_base = dst_vs.variables().keys().filter(|k| k.starts_with("base.")).count();
        assert_eq!(report.copied, n_base);
        let (src_vars, dst_vars) = (src_vs.variables(), dst_vs.variables());
        assert!(src_vars["base.stem.weight"].allclose(&dst_vars["base.stem.weight"], 1e-6, 1e-6, false));
    }

    #[test]
    fn stage_block_project_conv_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timm.safetensors");

        let mut vs = nn::VarStore::new(Device::Cpu);
        let _net = Classifier::new(&vs.root(), 0.35, 2);
        let shape = vs.variables()["base.ir_1_0.project.weight"].size();
        let src = Tensor::ones(shape.as_slice(), (Kind::Float, Device::Cpu));
        Tensor::write_safetensors(&[("blocks.1.0.conv_pwl.weight", &src)], &path).unwrap();

        let report = load_backbone(&mut vs, &path, 0.35).unwrap();
        assert_eq!(report, LoadReport { copied: 1, shape_mismatch: 0, unmapped: 0 });
        assert!(vs.variables()["base.ir_1_0.project.weight"].equal(&src));
    }

    #[test]
    fn unrelated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.safetensors");
        let foo = Tensor::zeros(&[2, 2], (Kind::Float, Device::Cpu));
        Tensor::write_safetensors(&[("foo.weight", &foo)], &path).unwrap();
        let mut vs = nn::VarStore::new(Device::Cpu);
        let _net = Classifier::new(&vs.root(), 0.35, 2);
        assert!(load_backbone(&mut vs, &path, 0.35).is_err());
    }
}
