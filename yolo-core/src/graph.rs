//! Static YOLOv8 computation graph.
//!
//! The network is expanded once, for a fixed input size, into a flat list of
//! nodes over named NCHW values with fully inferred shapes. Executors (CPU and
//! the GPU execution plan) walk the nodes in order; nothing is decided at run
//! time. Parameter names follow the state-dict layout of the weight file.

use std::fmt::{self, Write as _};

use anyhow::{Context, Result, bail, ensure};

use crate::{variant::ModelVariant, weights::WeightStore};

/// Batchnorm epsilon used by every `Conv_Block`.
pub const BN_EPSILON: f32 = 1e-3;
/// Distribution bins per box side in the detection head.
pub const REG_MAX: usize = 16;
/// Feature strides of the three detection levels.
pub const STRIDES: [usize; 3] = [8, 16, 32];
/// Largest stride; input sides must be multiples of it.
pub const MAX_STRIDE: usize = 32;

pub type ValueId = usize;

/// Activation fused into a convolution epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
    Silu,
}

impl Activation {
    /// Mode value shared with the WGSL kernels (`0` means identity).
    pub fn code(activation: Option<Activation>) -> u32 {
        match activation {
            None => 0,
            Some(Activation::Relu) => 1,
            Some(Activation::Sigmoid) => 2,
            Some(Activation::Silu) => 3,
        }
    }

    pub fn apply(self, value: f32) -> f32 {
        match self {
            Activation::Relu => value.max(0.0),
            Activation::Sigmoid => sigmoid(value),
            Activation::Silu => value * sigmoid(value),
        }
    }
}

pub(crate) fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Square convolution geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    pub groups: usize,
}

impl ConvGeometry {
    /// `kernel x kernel` convolution with "same" padding (`kernel / 2`).
    pub fn same(kernel: usize, stride: usize) -> Self {
        Self {
            kernel,
            stride,
            pad: kernel / 2,
            groups: 1,
        }
    }

    pub fn output_extent(&self, size: usize) -> Result<usize> {
        pooled_extent(size, self.kernel, self.stride, self.pad)
    }
}

fn pooled_extent(size: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    ensure!(stride > 0 && kernel > 0, "kernel and stride must be non-zero");
    let padded = size + 2 * pad;
    ensure!(
        padded >= kernel,
        "kernel {kernel} larger than padded extent {padded}"
    );
    Ok((padded - kernel) / stride + 1)
}

/// Operation performed by a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Convolution with folded batchnorm/bias and optional activation.
    Conv {
        param: usize,
        geometry: ConvGeometry,
        activation: Option<Activation>,
    },
    /// Max pooling; padded positions never win.
    MaxPool {
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    /// Nearest-neighbour 2x spatial upsample.
    Upsample2x,
    /// Concatenate all inputs along `axis`.
    Concat { axis: usize },
    /// Take `len` entries starting at `start` along `axis`.
    Slice { axis: usize, start: usize, len: usize },
    /// Element-wise sum of two equally shaped inputs.
    Add,
    /// DFL box decode plus sigmoid class scores for one head level.
    Decode {
        stride: usize,
        reg_max: usize,
        num_classes: usize,
    },
}

/// Kernel family that executes an [`Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Conv2d,
    MaxPool,
    Upsample2x,
    Copy,
    Add,
    Decode,
}

impl KernelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelKind::Conv2d => "conv2d",
            KernelKind::MaxPool => "max_pool",
            KernelKind::Upsample2x => "upsample2x",
            KernelKind::Copy => "copy",
            KernelKind::Add => "add",
            KernelKind::Decode => "decode",
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Op {
    pub fn kernel(&self) -> KernelKind {
        match self {
            Op::Conv { .. } => KernelKind::Conv2d,
            Op::MaxPool { .. } => KernelKind::MaxPool,
            Op::Upsample2x => KernelKind::Upsample2x,
            Op::Concat { .. } | Op::Slice { .. } => KernelKind::Copy,
            Op::Add => KernelKind::Add,
            Op::Decode { .. } => KernelKind::Decode,
        }
    }
}

/// A named value with static NCHW dims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueInfo {
    pub name: String,
    pub dims: [usize; 4],
}

impl ValueInfo {
    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn size_bytes(&self) -> u64 {
        (self.elements() * std::mem::size_of::<f32>()) as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
}

/// How a convolution's parameters are stored in the weight file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `{p}.conv.weight` followed by `{p}.bn.{weight,bias,running_mean,running_var}`.
    ConvBn,
    /// Plain `{p}.weight` and `{p}.bias`.
    ConvBias,
}

/// Parameters a convolution node expects to find in the weight file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub prefix: String,
    pub kind: ParamKind,
    /// `[out_channels, in_channels / groups, kernel, kernel]`.
    pub dims: [usize; 4],
}

impl ParamSpec {
    /// Tensor names and expected shapes.
    pub fn tensors(&self) -> Vec<(String, Vec<usize>)> {
        let p = &self.prefix;
        let channels = vec![self.dims[0]];
        match self.kind {
            ParamKind::ConvBn => vec![
                (format!("{p}.conv.weight"), self.dims.to_vec()),
                (format!("{p}.bn.weight"), channels.clone()),
                (format!("{p}.bn.bias"), channels.clone()),
                (format!("{p}.bn.running_mean"), channels.clone()),
                (format!("{p}.bn.running_var"), channels),
            ],
            ParamKind::ConvBias => vec![
                (format!("{p}.weight"), self.dims.to_vec()),
                (format!("{p}.bias"), channels),
            ],
        }
    }
}

/// Convolution weights with batchnorm folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerParams {
    pub dims: [usize; 4],
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

/// The expanded network.
#[derive(Debug, Clone)]
pub struct Graph {
    variant: ModelVariant,
    num_classes: usize,
    values: Vec<ValueInfo>,
    nodes: Vec<Node>,
    params: Vec<ParamSpec>,
    input: ValueId,
    output: ValueId,
}

impl Graph {
    /// Expand YOLOv8 for `variant`, `num_classes` and an input of `width x height`.
    pub fn yolov8(
        variant: ModelVariant,
        num_classes: usize,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        ensure!(num_classes > 0, "num_classes must be > 0");
        ensure!(
            width > 0 && height > 0 && width % MAX_STRIDE == 0 && height % MAX_STRIDE == 0,
            "input size {width}x{height} must be a non-zero multiple of {MAX_STRIDE}"
        );

        let mut b = GraphBuilder::new([1, 3, height, width]);
        let input = b.input;
        let v = variant;

        // Backbone.
        let x = b.conv_block("net.b1.0", input, v.channels(64), 3, 2)?;
        let x = b.conv_block("net.b1.1", x, v.channels(128), 3, 2)?;
        let x = b.c2f("net.b2.0", x, v.channels(128), v.repeats(3), true)?;
        let x = b.conv_block("net.b2.1", x, v.channels(256), 3, 2)?;
        let p3 = b.c2f("net.b2.2", x, v.channels(256), v.repeats(6), true)?;
        let x = b.conv_block("net.b3.0", p3, v.channels(512), 3, 2)?;
        let p4 = b.c2f("net.b3.1", x, v.channels(512), v.repeats(6), true)?;
        let x = b.conv_block("net.b4.0", p4, v.ratio_channels(512), 3, 2)?;
        let x = b.c2f("net.b4.1", x, v.ratio_channels(512), v.repeats(3), true)?;
        let p5 = b.sppf("net.b5.0", x, v.ratio_channels(512), 5)?;

        // Neck.
        let n = v.repeats(3);
        let up = b.upsample("fpn.up.0", p5)?;
        let cat = b.concat("fpn.cat.0", &[up, p4], 1)?;
        let x = b.c2f("fpn.n1", cat, v.channels(512), n, false)?;
        let up = b.upsample("fpn.up.1", x)?;
        let cat = b.concat("fpn.cat.1", &[up, p3], 1)?;
        let head1 = b.c2f("fpn.n2", cat, v.channels(256), n, false)?;
        let down = b.conv_block("fpn.n3", head1, v.channels(256), 3, 2)?;
        let cat = b.concat("fpn.cat.2", &[down, x], 1)?;
        let head2 = b.c2f("fpn.n4", cat, v.channels(512), n, false)?;
        let down = b.conv_block("fpn.n5", head2, v.channels(512), 3, 2)?;
        let cat = b.concat("fpn.cat.3", &[down, p5], 1)?;
        let head3 = b.c2f("fpn.n6", cat, v.ratio_channels(512), n, false)?;

        // Detection head.
        let first = v.channels(256);
        let cls_hidden = first.max(num_classes);
        let box_hidden = (first / 4).max(4 * REG_MAX);
        let mut decoded = Vec::with_capacity(STRIDES.len());
        for (level, (&feature, &stride)) in [head1, head2, head3].iter().zip(&STRIDES).enumerate() {
            let reg = b.conv_block(&format!("head.cv2.{level}.0"), feature, box_hidden, 3, 1)?;
            let reg = b.conv_block(&format!("head.cv2.{level}.1"), reg, box_hidden, 3, 1)?;
            let reg = b.conv_bias(&format!("head.cv2.{level}.2"), reg, 4 * REG_MAX)?;
            let cls = b.conv_block(&format!("head.cv3.{level}.0"), feature, cls_hidden, 3, 1)?;
            let cls = b.conv_block(&format!("head.cv3.{level}.1"), cls, cls_hidden, 3, 1)?;
            let cls = b.conv_bias(&format!("head.cv3.{level}.2"), cls, num_classes)?;
            decoded.push(b.decode(&format!("head.decode.{level}"), reg, cls, stride, num_classes)?);
        }
        let output = b.concat("head.output", &decoded, 2)?;

        Ok(Self {
            variant,
            num_classes,
            values: b.values,
            nodes: b.nodes,
            params: b.params,
            input,
            output,
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn values(&self) -> &[ValueInfo] {
        &self.values
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id]
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn input(&self) -> ValueId {
        self.input
    }

    pub fn output(&self) -> ValueId {
        self.output
    }

    pub fn input_dims(&self) -> [usize; 4] {
        self.values[self.input].dims
    }

    /// `[1, 4 + num_classes, anchors, 1]`.
    pub fn output_dims(&self) -> [usize; 4] {
        self.values[self.output].dims
    }

    /// Number of anchor points across all levels.
    pub fn anchor_count(&self) -> usize {
        self.output_dims()[2]
    }

    /// Every tensor name and shape the weight file must provide.
    pub fn required_tensors(&self) -> Vec<(String, Vec<usize>)> {
        self.params.iter().flat_map(ParamSpec::tensors).collect()
    }

    /// Index of the last node reading each value; `None` when never read.
    ///
    /// The graph output is treated as read after the final node.
    pub fn last_uses(&self) -> Vec<Option<usize>> {
        let mut last = vec![None; self.values.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for &input in &node.inputs {
                last[input] = Some(index);
            }
        }
        last[self.output] = Some(self.nodes.len());
        last
    }

    /// Validate weight shapes and fold batchnorm into convolution parameters.
    ///
    /// The returned vector is indexed like [`Graph::params`].
    pub fn fold_parameters(&self, store: &WeightStore) -> Result<Vec<LayerParams>> {
        self.params
            .iter()
            .map(|spec| fold_one(spec, store).with_context(|| format!("layer '{}'", spec.prefix)))
            .collect()
    }

    /// Human readable trace of every dispatch-level step.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} ({} classes), input {:?}, {} nodes, {} parameter layers",
            self.variant,
            self.num_classes,
            self.input_dims(),
            self.nodes.len(),
            self.params.len()
        );
        for (index, node) in self.nodes.iter().enumerate() {
            let inputs: Vec<&str> = node
                .inputs
                .iter()
                .map(|&id| self.values[id].name.as_str())
                .collect();
            let _ = writeln!(
                out,
                "{index:>4}  {:<10} {:<22} {:?} <- [{}]",
                node.op.kernel(),
                node.name,
                self.values[node.output].dims,
                inputs.join(", ")
            );
        }
        out
    }
}

fn fold_one(spec: &ParamSpec, store: &WeightStore) -> Result<LayerParams> {
    let expected = spec.tensors();
    for (name, dims) in &expected {
        let tensor = store.tensor(name)?;
        ensure!(
            tensor.dims() == dims.as_slice(),
            "tensor '{name}' has shape {:?}, expected {dims:?}",
            tensor.dims()
        );
    }

    let out_channels = spec.dims[0];
    let per_channel = spec.dims[1] * spec.dims[2] * spec.dims[3];
    let fetch = |index: usize| tensor_data(store, &expected[index].0);

    match spec.kind {
        ParamKind::ConvBias => Ok(LayerParams {
            dims: spec.dims,
            weight: fetch(0)?.to_vec(),
            bias: fetch(1)?.to_vec(),
        }),
        ParamKind::ConvBn => {
            let (weight, gamma, beta, mean, var) =
                (fetch(0)?, fetch(1)?, fetch(2)?, fetch(3)?, fetch(4)?);
            let mut folded = weight.to_vec();
            let mut bias = Vec::with_capacity(out_channels);
            for c in 0..out_channels {
                ensure!(var[c] >= 0.0, "negative running variance in channel {c}");
                let scale = gamma[c] / (var[c] + BN_EPSILON).sqrt();
                for w in &mut folded[c * per_channel..(c + 1) * per_channel] {
                    *w *= scale;
                }
                bias.push(beta[c] - mean[c] * scale);
            }
            Ok(LayerParams {
                dims: spec.dims,
                weight: folded,
                bias,
            })
        }
    }
}

fn tensor_data<'a>(store: &'a WeightStore, name: &str) -> Result<&'a [f32]> {
    Ok(store.tensor(name)?.data())
}

struct GraphBuilder {
    values: Vec<ValueInfo>,
    nodes: Vec<Node>,
    params: Vec<ParamSpec>,
    input: ValueId,
}

impl GraphBuilder {
    fn new(input_dims: [usize; 4]) -> Self {
        Self {
            values: vec![ValueInfo {
                name: "images".to_string(),
                dims: input_dims,
            }],
            nodes: Vec::new(),
            params: Vec::new(),
            input: 0,
        }
    }

    fn dims(&self, value: ValueId) -> [usize; 4] {
        self.values[value].dims
    }

    fn push(&mut self, name: String, op: Op, inputs: Vec<ValueId>, dims: [usize; 4]) -> ValueId {
        let output = self.values.len();
        self.values.push(ValueInfo {
            name: name.clone(),
            dims,
        });
        self.nodes.push(Node {
            name,
            op,
            inputs,
            output,
        });
        output
    }

    fn conv(
        &mut self,
        prefix: &str,
        input: ValueId,
        out_channels: usize,
        geometry: ConvGeometry,
        kind: ParamKind,
        activation: Option<Activation>,
    ) -> Result<ValueId> {
        let [n, c, h, w] = self.dims(input);
        ensure!(
            c % geometry.groups == 0 && out_channels % geometry.groups == 0,
            "{prefix}: channels {c}->{out_channels} not divisible by {} groups",
            geometry.groups
        );
        let out = [
            n,
            out_channels,
            geometry.output_extent(h)?,
            geometry.output_extent(w)?,
        ];
        let param = self.params.len();
        self.params.push(ParamSpec {
            prefix: prefix.to_string(),
            kind,
            dims: [
                out_channels,
                c / geometry.groups,
                geometry.kernel,
                geometry.kernel,
            ],
        });
        let op = Op::Conv {
            param,
            geometry,
            activation,
        };
        Ok(self.push(prefix.to_string(), op, vec![input], out))
    }

    /// Convolution + batchnorm + SiLU.
    fn conv_block(
        &mut self,
        prefix: &str,
        input: ValueId,
        out_channels: usize,
        kernel: usize,
        stride: usize,
    ) -> Result<ValueId> {
        self.conv(
            prefix,
            input,
            out_channels,
            ConvGeometry::same(kernel, stride),
            ParamKind::ConvBn,
            Some(Activation::Silu),
        )
    }

    /// 1x1 convolution with bias and no activation.
    fn conv_bias(&mut self, prefix: &str, input: ValueId, out_channels: usize) -> Result<ValueId> {
        self.conv(
            prefix,
            input,
            out_channels,
            ConvGeometry::same(1, 1),
            ParamKind::ConvBias,
            None,
        )
    }

    fn bottleneck(&mut self, prefix: &str, input: ValueId, shortcut: bool) -> Result<ValueId> {
        let channels = self.dims(input)[1];
        let hidden = self.conv_block(&format!("{prefix}.cv1"), input, channels, 3, 1)?;
        let out = self.conv_block(&format!("{prefix}.cv2"), hidden, channels, 3, 1)?;
        if shortcut {
            self.add(&format!("{prefix}.add"), input, out)
        } else {
            Ok(out)
        }
    }

    fn c2f(
        &mut self,
        prefix: &str,
        input: ValueId,
        out_channels: usize,
        repeats: usize,
        shortcut: bool,
    ) -> Result<ValueId> {
        let hidden = out_channels / 2;
        let joined = self.conv_block(&format!("{prefix}.cv1"), input, 2 * hidden, 1, 1)?;
        let first = self.slice(&format!("{prefix}.split.0"), joined, 0, hidden)?;
        let mut last = self.slice(&format!("{prefix}.split.1"), joined, hidden, hidden)?;
        let mut parts = vec![first, last];
        for i in 0..repeats {
            last = self.bottleneck(&format!("{prefix}.bottleneck.{i}"), last, shortcut)?;
            parts.push(last);
        }
        let cat = self.concat(&format!("{prefix}.cat"), &parts, 1)?;
        self.conv_block(&format!("{prefix}.cv2"), cat, out_channels, 1, 1)
    }

    fn sppf(
        &mut self,
        prefix: &str,
        input: ValueId,
        out_channels: usize,
        kernel: usize,
    ) -> Result<ValueId> {
        let hidden = self.dims(input)[1] / 2;
        let mut x = self.conv_block(&format!("{prefix}.cv1"), input, hidden, 1, 1)?;
        let mut parts = vec![x];
        for i in 0..3 {
            x = self.max_pool(&format!("{prefix}.pool.{i}"), x, kernel, 1, kernel / 2)?;
            parts.push(x);
        }
        let cat = self.concat(&format!("{prefix}.cat"), &parts, 1)?;
        self.conv_block(&format!("{prefix}.cv2"), cat, out_channels, 1, 1)
    }

    fn max_pool(
        &mut self,
        name: &str,
        input: ValueId,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<ValueId> {
        ensure!(pad * 2 <= kernel, "{name}: padding {pad} too large for kernel {kernel}");
        let [n, c, h, w] = self.dims(input);
        let out = [
            n,
            c,
            pooled_extent(h, kernel, stride, pad)?,
            pooled_extent(w, kernel, stride, pad)?,
        ];
        let op = Op::MaxPool {
            kernel,
            stride,
            pad,
        };
        Ok(self.push(name.to_string(), op, vec![input], out))
    }

    fn upsample(&mut self, name: &str, input: ValueId) -> Result<ValueId> {
        let [n, c, h, w] = self.dims(input);
        Ok(self.push(
            name.to_string(),
            Op::Upsample2x,
            vec![input],
            [n, c, h * 2, w * 2],
        ))
    }

    fn concat(&mut self, name: &str, inputs: &[ValueId], axis: usize) -> Result<ValueId> {
        ensure!(axis < 4, "{name}: axis {axis} out of range");
        let Some(&first) = inputs.first() else {
            bail!("{name}: concat needs at least one input");
        };
        let mut dims = self.dims(first);
        dims[axis] = 0;
        for &input in inputs {
            let other = self.dims(input);
            for d in 0..4 {
                ensure!(
                    d == axis || other[d] == dims[d],
                    "{name}: cannot concatenate {:?} with {:?} on axis {axis}",
                    self.dims(first),
                    other
                );
            }
            dims[axis] += other[axis];
        }
        Ok(self.push(name.to_string(), Op::Concat { axis }, inputs.to_vec(), dims))
    }

    fn slice(&mut self, name: &str, input: ValueId, start: usize, len: usize) -> Result<ValueId> {
        let mut dims = self.dims(input);
        ensure!(
            len > 0 && start + len <= dims[1],
            "{name}: channel slice {start}..{} out of range for {} channels",
            start + len,
            dims[1]
        );
        dims[1] = len;
        let op = Op::Slice {
            axis: 1,
            start,
            len,
        };
        Ok(self.push(name.to_string(), op, vec![input], dims))
    }

    fn add(&mut self, name: &str, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let dims = self.dims(lhs);
        ensure!(
            dims == self.dims(rhs),
            "{name}: cannot add {:?} and {:?}",
            dims,
            self.dims(rhs)
        );
        Ok(self.push(name.to_string(), Op::Add, vec![lhs, rhs], dims))
    }

    fn decode(
        &mut self,
        name: &str,
        boxes: ValueId,
        scores: ValueId,
        stride: usize,
        num_classes: usize,
    ) -> Result<ValueId> {
        let [n, box_channels, h, w] = self.dims(boxes);
        let [_, class_channels, sh, sw] = self.dims(scores);
        ensure!(
            box_channels == 4 * REG_MAX && class_channels == num_classes && (h, w) == (sh, sw),
            "{name}: unexpected head shapes {:?} / {:?}",
            self.dims(boxes),
            self.dims(scores)
        );
        let op = Op::Decode {
            stride,
            reg_max: REG_MAX,
            num_classes,
        };
        Ok(self.push(
            name.to_string(),
            op,
            vec![boxes, scores],
            [n, 4 + num_classes, h * w, 1],
        ))
    }
}
