use tch::{nn, nn::ModuleT, Tensor};

// t (expansion), c (channels), n (repeats), s (stride)
pub const STAGES: &[(i64, i64, i64, i64)] = &[
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const HEAD_DROPOUT: f64 = 0.2;

pub fn round_channels(c: i64, wm: f64) -> i64 {
    let v = (c as f64 * wm).round() as i64;
    v.max(8)
}

fn relu6(x: &Tensor) -> Tensor {
    x.clamp(0.0, 6.0)
}

#[derive(Debug)]
struct InvertedResidual {
    conv_expand: Option<nn::Conv2D>,
    bn_expand: Option<nn::BatchNorm>,
    conv_dw: nn::Conv2D,
    bn_dw: nn::BatchNorm,
    conv_project: nn::Conv2D,
    bn_project: nn::BatchNorm,
    use_res: bool,
}

impl InvertedResidual {
    fn new(vs: &nn::Path, in_c: i64, out_c: i64, stride: i64, expand_ratio: i64) -> Self {
        let hidden_dim = in_c * expand_ratio;
        let no_bias = nn::ConvConfig { bias: false, ..Default::default() };

        let (conv_expand, bn_expand) = if expand_ratio != 1 {
            (
                Some(nn::conv2d(&vs.sub("expand"), in_c, hidden_dim, 1, no_bias)),
                Some(nn::batch_norm2d(&vs.sub("expand").sub("bn"), hidden_dim, Default::default())),
            )
        } else {
            (None, None)
        };

        let conv_dw = nn::conv2d(
            &vs.sub("dw"),
            hidden_dim,
            hidden_dim,
            3,
            nn::ConvConfig { stride, padding: 1, groups: hidden_dim, bias: false, ..Default::default() },
        );
        let bn_dw = nn::batch_norm2d(&vs.sub("dw").sub("bn"), hidden_dim, Default::default());

        let conv_project = nn::conv2d(&vs.sub("project"), hidden_dim, out_c, 1, no_bias);
        let bn_project = nn::batch_norm2d(&vs.sub("project").sub("bn"), out_c, Default::default());

        Self {
            conv_expand,
            bn_expand,
            conv_dw,
            bn_dw,
            conv_project,
            bn_project,
            use_res: stride == 1 && in_c == out_c,
        }
    }
}

impl nn::ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.shallow_clone();
        if let (Some(conv_e), Some(bn_e)) = (&self.conv_expand, &self.bn_expand) {
            x = relu6(&bn_e.forward_t(&conv_e.forward_t(&x, train), train));
        }
        x = relu6(&self.bn_dw.forward_t(&self.conv_dw.forward_t(&x, train), train));
        x = self.bn_project.forward_t(&self.conv_project.forward_t(&x, train), train);

        if self.use_res {
            xs + x
        } else {
            x
        }
    }
}

/// Variable-name prefix of bottleneck block `j` in stage `i`.
pub fn block_prefix(i: usize, j: usize) -> String {
    format!("base.ir_{}_{}", i, j)
}

/// Stem, one `SequentialT` per bottleneck stage, then the final 1x1 conv with pooling. Stages are
/// kept apart so the ones left frozen during fine-tuning can run in eval mode.
#[derive(Debug)]
struct Backbone {
    stem: nn::SequentialT,
    stages: Vec<nn::SequentialT>,
    last: nn::SequentialT,
}

fn mobilenet_v2_base(vs: &nn::Path, alpha: f64) -> (Backbone, i64) {
    let first = round_channels(32, alpha);
    let stem_vs = vs.sub("stem");
    let stem = nn::seq_t()
        .add(nn::conv2d(
            &stem_vs,
            3,
            first,
            3,
            nn::ConvConfig { stride: 2, padding: 1, bias: false, ..Default::default() },
        ))
        .add(nn::batch_norm2d(&stem_vs.sub("bn"), first, Default::default()))
        .add_fn(relu6);

    let mut stages = Vec::with_capacity(STAGES.len());
    let mut in_c = first;
    for (i, &(t, c, n, s)) in STAGES.iter().enumerate() {
        let out_c = round_channels(c, alpha);
        let mut stage = nn::seq_t();
        for j in 0..n {
            let stride = if j == 0 { s } else { 1 };
            let block_vs = vs.sub(&format!("ir_{}_{}", i, j));
            stage = stage.add(InvertedResidual::new(&block_vs, in_c, out_c, stride, t));
            in_c = out_c;
        }
        stages.push(stage);
    }

    let last = round_channels(1280, alpha);
    let last_vs = vs.sub("last");
    let tail = nn::seq_t()
        .add(nn::conv2d(&last_vs, in_c, last, 1, nn::ConvConfig { bias: false, ..Default::default() }))
        .add(nn::batch_norm2d(&last_vs.sub("bn"), last, Default::default()))
        .add_fn(relu6)
        .add_fn(|x| x.adaptive_avg_pool2d(&[1, 1]))
        .add_fn(move |x| x.view([-1, last]));

    (Backbone { stem, stages, last: tail }, last)
}

fn classifier_head(vs: &nn::Path, in_features: i64, num_classes: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn_t(|x, train| x.dropout(HEAD_DROPOUT, train))
        .add(nn::linear(vs, in_features, num_classes, Default::default()))
}

/// MobileNetV2 backbone under `base.*`, linear classifier under `head.*`.
#[derive(Debug)]
pub struct Classifier {
    base: Backbone,
    head: nn::SequentialT,
    trainable_stages: usize,
}

impl Classifier {
    pub fn new(root: &nn::Path, alpha: f64, num_classes: i64) -> Self {
        let (base, last) = mobilenet_v2_base(&root.sub("base"), alpha);
        let head = classifier_head(&root.sub("head"), last, num_classes);
        Self { base, head, trainable_stages: STAGES.len() }
    }

    /// Number of trailing bottleneck stages that run in train mode when the network trains, with
    /// the same meaning as in [`unfreeze_top`]: the final 1x1 conv follows whenever it is non-zero,
    /// the stem only when every stage does. Everything else stays in eval mode, so BatchNorm
    /// running statistics of frozen layers keep their pretrained values.
    pub fn set_trainable_stages(&mut self, stages: usize) {
        self.trainable_stages = stages.min(STAGES.len());
    }
}

impl nn::ModuleT for Classifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let first = STAGES.len() - self.trainable_stages;
        let mut x = self.base.stem.forward_t(xs, train && first == 0);
        for (i, stage) in self.base.stages.iter().enumerate() {
            x = stage.forward_t(&x, train && i >= first);
        }
        let f = self.base.last.forward_t(&x, train && self.trainable_stages > 0);
        self.head.forward_t(&f, train)
    }
}

// BatchNorm running statistics are buffers, never trained.
fn is_buffer(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// Stop gradients for every backbone parameter. Returns how many were frozen.
pub fn freeze_base(vs: &nn::VarStore) -> usize {
    let mut frozen = 0;
    for (name, var) in vs.variables() {
        if name.starts_with("base.") && !is_buffer(&name) {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}

/// Unfreeze the last `stages` bottleneck stages and the final 1x1 conv. `stages >= STAGES.len()`
/// unfreezes the whole backbone, 0 leaves it frozen. Returns how many variables were unfrozen.
pub fn unfreeze_top(vs: &nn::VarStore, stages: usize) -> usize {
    if stages == 0 {
        return 0;
    }
    let all = stages >= STAGES.len();
    let first_stage = STAGES.len().saturating_sub(stages);
    let prefixes: Vec<String> = (first_stage..STAGES.len())
        .map(|i| format!("base.ir_{}_", i))
        .chain(std::iter::once("base.last.".to_string()))
        .collect();

    let mut unfrozen = 0;
    for (name, var) in vs.variables() {
        if !name.starts_with("base.") || is_buffer(&name) {
            continue;
        }
        if all || prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            let _ = var.set_requires_grad(true);
            unfrozen += 1;
        }
    }
    unfrozen
}

/// Number of scalar parameters that currently receive gradients.
pub fn trainable_params(vs: &nn::VarStore) -> i64 {
    vs.trainable_variables()
        .iter()
        .filter(|t| t.requires_grad())
        .map(|t| t.numel() as i64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn logits_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = Classifier::new(&vs.root(), 0.35, 2);
        let xs = Tensor::zeros(&[2, 3, 64, 64], (Kind::Float, Device::Cpu));
        let logits = net.forward_t(&xs, false);
        assert_eq!(logits.size(), vec![2, 2]);
    }

    #[test]
    fn block_names_follow_stage_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = Classifier::new(&vs.root(), 1.0, 2);
        let vars = vs.variables();
        assert!(vars.contains_key("base.stem.weight"));
        assert!(vars.contains_key(&format!("{}.dw.weight", block_prefix(6, 0))));
        assert!(vars.contains_key("base.ir_0_0.project.bn.weight"));
        assert!(!vars.contains_key("base.ir_0_0.expand.weight"));
        assert!(vars.contains_key("head.weight"));
    }

    #[test]
    fn freeze_then_partial_unfreeze() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = Classifier::new(&vs.root(), 0.5, 2);
        let total = trainable_params(&vs);

        let frozen = freeze_base(&vs);
        assert!(frozen > 0);
        let head_only = trainable_params(&vs);
        assert!(head_only < total);
        assert!(head_only > 0);

        let unfrozen = unfreeze_top(&vs, 2);
        assert!(unfrozen > 0 && unfrozen < frozen);
        let partial = trainable_params(&vs);
        assert!(partial > head_only && partial < total);

        let vars = vs.variables();
        assert!(!vars["base.stem.weight"].requires_grad());
        assert!(vars["base.ir_6_0.dw.weight"].requires_grad());
        assert!(vars["base.last.weight"].requires_grad());
        assert!(!vars["base.ir_4_0.dw.weight"].requires_grad());

        assert_eq!(unfreeze_top(&vs, 0), 0);
        assert_eq!(unfreeze_top(&vs, 99), frozen);
        assert_eq!(trainable_params(&vs), total);
    }

    #[test]
    fn frozen_stages_keep_batchnorm_statistics() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut net = Classifier::new(&vs.root(), 0.35, 2);
        freeze_base(&vs);
        unfreeze_top(&vs, 2);
        net.set_trainable_stages(2);

        let frozen = ["base.stem.bn.running_var", "base.ir_0_0.dw.bn.running_var", "base.ir_4_2.project.bn.running_var"];
        let tuned = ["base.ir_5_0.dw.bn.running_var", "base.ir_6_0.project.bn.running_var", "base.last.bn.running_var"];
        let vars = vs.variables();
        let before: Vec<Tensor> = frozen.iter().chain(&tuned).map(|n| vars[*n].copy()).collect();

        let xs = Tensor::randn(&[4, 3, 64, 64], (Kind::Float, Device::Cpu));
        let _ = net.forward_t(&xs, true);

        let vars = vs.variables();
        for (name, old) in frozen.iter().zip(&before) {
            assert!(vars[*name].equal(old), "{name} drifted");
        }
        for (name, old) in tuned.iter().zip(&before[frozen.len()..]) {
            assert!(!vars[*name].equal(old), "{name} was not updated");
        }
    }

    #[test]
    fn fully_frozen_backbone_stays_in_eval_mode() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut net = Classifier::new(&vs.root(), 0.35, 2);
        net.set_trainable_stages(0);
        let before = vs.variables()["base.last.bn.running_var"].copy();
        let xs = Tensor::randn(&[2, 3, 64, 64], (Kind::Float, Device::Cpu));
        let logits = net.forward_t(&xs, true);
        assert_eq!(logits.size(), vec![2, 2]);
        assert!(vs.variables()["base.last.bn.running_var"].equal(&before));
    }
}
