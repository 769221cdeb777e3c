//! Host implementation of every graph kernel.
//!
//! These functions define the numerics the WGSL kernels must reproduce and
//! back the CPU inference path. Tensors are flat NCHW `f32` slices with batch 1.

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use rayon::prelude::*;

use crate::graph::{Activation, ConvGeometry, Graph, LayerParams, Node, Op, sigmoid};

/// Convolution with a folded bias and optional fused activation.
pub fn conv2d(
    input: &[f32],
    input_dims: [usize; 4],
    params: &LayerParams,
    geometry: ConvGeometry,
    activation: Option<Activation>,
) -> Result<(Vec<f32>, [usize; 4])> {
    let [batch, in_c, in_h, in_w] = input_dims;
    let [out_c, group_in, k_h, k_w] = params.dims;
    ensure!(batch == 1, "only batch size 1 is supported (got {batch})");
    ensure!(
        input.len() == in_c * in_h * in_w,
        "conv input expected {} elements, got {}",
        in_c * in_h * in_w,
        input.len()
    );
    ensure!(
        geometry.groups > 0 && in_c == group_in * geometry.groups,
        "conv expects {} input channels, got {in_c}",
        group_in * geometry.groups
    );
    ensure!(params.bias.len() == out_c, "conv bias length mismatch");
    let out_h = geometry.output_extent(in_h)?;
    let out_w = geometry.output_extent(in_w)?;
    let group_out = out_c / geometry.groups;
    let weights_per_out = group_in * k_h * k_w;
    let plane = out_h * out_w;
    let stride = geometry.stride;
    let pad = geometry.pad as isize;

    let mut output = vec![0.0f32; out_c * plane];
    output
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(oc, out_plane)| {
            out_plane.fill(params.bias[oc]);
            let in_start = (oc / group_out) * group_in;
            let weights = &params.weight[oc * weights_per_out..(oc + 1) * weights_per_out];
            for ic_local in 0..group_in {
                let in_plane = &input[(in_start + ic_local) * in_h * in_w..][..in_h * in_w];
                for ky in 0..k_h {
                    for kx in 0..k_w {
                        let w = weights[(ic_local * k_h + ky) * k_w + kx];
                        for oy in 0..out_h {
                            let iy = (oy * stride + ky) as isize - pad;
                            if iy < 0 || iy >= in_h as isize {
                                continue;
                            }
                            let row = &in_plane[iy as usize * in_w..][..in_w];
                            let out_row = &mut out_plane[oy * out_w..][..out_w];
                            for (ox, acc) in out_row.iter_mut().enumerate() {
                                let ix = (ox * stride + kx) as isize - pad;
                                if ix >= 0 && ix < in_w as isize {
                                    *acc = row[ix as usize].mul_add(w, *acc);
                                }
                            }
                        }
                    }
                }
            }
            if let Some(activation) = activation {
                for value in out_plane.iter_mut() {
                    *value = activation.apply(*value);
                }
            }
        });
    Ok((output, [1, out_c, out_h, out_w]))
}

/// Max pooling where padded positions are ignored.
pub fn max_pool(
    input: &[f32],
    dims: [usize; 4],
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<(Vec<f32>, [usize; 4])> {
    let [_, channels, in_h, in_w] = dims;
    ensure!(input.len() == channels * in_h * in_w, "max pool input size mismatch");
    ensure!(kernel > 0 && stride > 0, "kernel and stride must be > 0");
    ensure!(in_h + 2 * pad >= kernel && in_w + 2 * pad >= kernel, "pool kernel too large");
    let out_h = (in_h + 2 * pad - kernel) / stride + 1;
    let out_w = (in_w + 2 * pad - kernel) / stride + 1;
    let plane = out_h * out_w;
    let mut output = vec![0.0f32; channels * plane];
    output
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(c, out_plane)| {
            let in_plane = &input[c * in_h * in_w..][..in_h * in_w];
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut best = f32::NEG_INFINITY;
                    for ky in 0..kernel {
                        let iy = (oy * stride + ky) as isize - pad as isize;
                        if iy < 0 || iy >= in_h as isize {
                            continue;
                        }
                        for kx in 0..kernel {
                            let ix = (ox * stride + kx) as isize - pad as isize;
                            if ix >= 0 && ix < in_w as isize {
                                best = best.max(in_plane[iy as usize * in_w + ix as usize]);
                            }
                        }
                    }
                    out_plane[oy * out_w + ox] = best;
                }
            }
        });
    Ok((output, [dims[0], channels, out_h, out_w]))
}

/// Nearest-neighbour 2x upsample.
pub fn upsample2x(input: &[f32], dims: [usize; 4]) -> Result<(Vec<f32>, [usize; 4])> {
    let [_, channels, h, w] = dims;
    ensure!(input.len() == channels * h * w, "upsample input size mismatch");
    let (out_h, out_w) = (h * 2, w * 2);
    let mut output = vec![0.0f32; channels * out_h * out_w];
    output
        .par_chunks_mut(out_h * out_w)
        .enumerate()
        .for_each(|(c, out_plane)| {
            let in_plane = &input[c * h * w..][..h * w];
            for (oy, row) in out_plane.chunks_mut(out_w).enumerate() {
                let src = &in_plane[(oy / 2) * w..][..w];
                for (ox, value) in row.iter_mut().enumerate() {
                    *value = src[ox / 2];
                }
            }
        });
    Ok((output, [dims[0], channels, out_h, out_w]))
}

/// Element-wise sum.
pub fn add(lhs: &[f32], rhs: &[f32]) -> Result<Vec<f32>> {
    ensure!(
        lhs.len() == rhs.len(),
        "add operands differ in length ({} vs {})",
        lhs.len(),
        rhs.len()
    );
    Ok(lhs.iter().zip(rhs).map(|(a, b)| a + b).collect())
}

/// Region copy along one axis, shared by concat and slice.
///
/// Copies `len` entries of `axis`, starting at `src_offset` in the source and
/// `dst_offset` in the destination, for every outer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub outer: usize,
    pub inner: usize,
    pub src_dim: usize,
    pub dst_dim: usize,
    pub src_offset: usize,
    pub dst_offset: usize,
    pub len: usize,
}

impl CopyRegion {
    pub fn new(
        src_dims: [usize; 4],
        dst_dims: [usize; 4],
        axis: usize,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<Self> {
        ensure!(axis < 4, "axis {axis} out of range");
        ensure!(
            src_offset + len <= src_dims[axis] && dst_offset + len <= dst_dims[axis],
            "copy of {len} entries at {src_offset}->{dst_offset} exceeds axis {axis}"
        );
        let outer: usize = src_dims[..axis].iter().product();
        let inner: usize = src_dims[axis + 1..].iter().product();
        ensure!(
            outer == dst_dims[..axis].iter().product::<usize>()
                && inner == dst_dims[axis + 1..].iter().product::<usize>(),
            "copy between {src_dims:?} and {dst_dims:?} changes non-axis dims"
        );
        Ok(Self {
            outer,
            inner,
            src_dim: src_dims[axis],
            dst_dim: dst_dims[axis],
            src_offset,
            dst_offset,
            len,
        })
    }

    /// Number of elements moved.
    pub fn elements(&self) -> usize {
        self.outer * self.len * self.inner
    }

    pub fn apply(&self, src: &[f32], dst: &mut [f32]) {
        let run = self.len * self.inner;
        for o in 0..self.outer {
            let from = (o * self.src_dim + self.src_offset) * self.inner;
            let to = (o * self.dst_dim + self.dst_offset) * self.inner;
            dst[to..to + run].copy_from_slice(&src[from..from + run]);
        }
    }
}

/// Concatenate `inputs` along `axis`.
pub fn concat(inputs: &[(&[f32], [usize; 4])], axis: usize) -> Result<(Vec<f32>, [usize; 4])> {
    let Some(&(_, first)) = inputs.first() else {
        anyhow::bail!("concat needs at least one input");
    };
    let mut dims = first;
    dims[axis] = inputs.iter().map(|(_, d)| d[axis]).sum();
    let mut output = vec![0.0f32; dims.iter().product()];
    let mut offset = 0;
    for &(data, src_dims) in inputs {
        let region = CopyRegion::new(src_dims, dims, axis, 0, offset, src_dims[axis])?;
        ensure!(data.len() == src_dims.iter().product::<usize>(), "concat input size mismatch");
        region.apply(data, &mut output);
        offset += src_dims[axis];
    }
    Ok((output, dims))
}

/// Take `len` entries starting at `start` along `axis`.
pub fn slice(
    input: &[f32],
    dims: [usize; 4],
    axis: usize,
    start: usize,
    len: usize,
) -> Result<(Vec<f32>, [usize; 4])> {
    let mut out_dims = dims;
    out_dims[axis] = len;
    let region = CopyRegion::new(dims, out_dims, axis, start, 0, len)?;
    let mut output = vec![0.0f32; region.elements()];
    region.apply(input, &mut output);
    Ok((output, out_dims))
}

/// Decode one head level into `[1, 4 + classes, H * W, 1]`.
///
/// Each box side is a softmax over `reg_max` bins whose expectation is the
/// distance from the anchor centre; boxes are emitted as `cx, cy, w, h` in
/// input pixels followed by sigmoid class scores.
pub fn decode(
    boxes: &[f32],
    scores: &[f32],
    dims: [usize; 4],
    stride: usize,
    reg_max: usize,
    num_classes: usize,
) -> Result<(Vec<f32>, [usize; 4])> {
    let [_, _, h, w] = dims;
    let anchors = h * w;
    ensure!(boxes.len() == 4 * reg_max * anchors, "decode box input size mismatch");
    ensure!(scores.len() == num_classes * anchors, "decode score input size mismatch");
    let channels = 4 + num_classes;
    let mut output = vec![0.0f32; channels * anchors];
    let stride = stride as f32;

    let (geometry, classes) = output.split_at_mut(4 * anchors);
    for anchor in 0..anchors {
        let side = decode_sides(boxes, anchor, anchors, reg_max);
        let ax = (anchor % w) as f32 + 0.5;
        let ay = (anchor / w) as f32 + 0.5;
        let (x1, y1) = (ax - side[0], ay - side[1]);
        let (x2, y2) = (ax + side[2], ay + side[3]);
        geometry[anchor] = (x1 + x2) * 0.5 * stride;
        geometry[anchors + anchor] = (y1 + y2) * 0.5 * stride;
        geometry[2 * anchors + anchor] = (x2 - x1) * stride;
        geometry[3 * anchors + anchor] = (y2 - y1) * stride;
    }
    classes
        .par_iter_mut()
        .zip(scores.par_iter())
        .for_each(|(out, &logit)| *out = sigmoid(logit));
    Ok((output, [1, channels, anchors, 1]))
}

fn decode_sides(boxes: &[f32], anchor: usize, anchors: usize, reg_max: usize) -> [f32; 4] {
    let mut sides = [0.0f32; 4];
    for (k, side) in sides.iter_mut().enumerate() {
        let bin = |j: usize| boxes[(k * reg_max + j) * anchors + anchor];
        let max = (0..reg_max).map(bin).fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0f32;
        let mut weighted = 0.0f32;
        for j in 0..reg_max {
            let e = (bin(j) - max).exp();
            total += e;
            weighted += e * j as f32;
        }
        *side = weighted / total;
    }
    sides
}

/// Runs a [`Graph`] node by node on the host.
#[derive(Debug, Clone)]
pub struct CpuExecutor {
    graph: Arc<Graph>,
    params: Arc<Vec<LayerParams>>,
    last_uses: Vec<Option<usize>>,
}

impl CpuExecutor {
    pub fn new(graph: Arc<Graph>, params: Arc<Vec<LayerParams>>) -> Result<Self> {
        ensure!(
            params.len() == graph.params().len(),
            "graph needs {} parameter layers, got {}",
            graph.params().len(),
            params.len()
        );
        let last_uses = graph.last_uses();
        Ok(Self {
            graph,
            params,
            last_uses,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Execute the graph on a flat `[1, 3, H, W]` input and return the raw head output.
    pub fn run(&self, input: &[f32]) -> Result<Vec<f32>> {
        let graph = &*self.graph;
        let input_len = graph.value(graph.input()).elements();
        ensure!(
            input.len() == input_len,
            "input expected {input_len} elements, got {}",
            input.len()
        );

        let mut values: Vec<Option<Vec<f32>>> = vec![None; graph.values().len()];
        values[graph.input()] = Some(input.to_vec());

        for (index, node) in graph.nodes().iter().enumerate() {
            let output = self
                .execute_node(node, &values)
                .with_context(|| format!("node '{}' failed", node.name))?;
            let expected = graph.value(node.output);
            ensure!(
                output.len() == expected.elements(),
                "node '{}' produced {} elements, expected {:?}",
                node.name,
                output.len(),
                expected.dims
            );
            values[node.output] = Some(output);
            for &input in &node.inputs {
                if self.last_uses[input] == Some(index) {
                    values[input] = None;
                }
            }
        }

        values[graph.output()]
            .take()
            .context("graph output was never produced")
    }

    fn execute_node(&self, node: &Node, values: &[Option<Vec<f32>>]) -> Result<Vec<f32>> {
        let graph = &*self.graph;
        let operand = |slot: usize| -> Result<(&[f32], [usize; 4])> {
            let id = node.inputs[slot];
            let data = values[id]
                .as_deref()
                .with_context(|| format!("value '{}' is not live", graph.value(id).name))?;
            Ok((data, graph.value(id).dims))
        };

        let (output, _) = match &node.op {
            Op::Conv {
                param,
                geometry,
                activation,
            } => {
                let (data, dims) = operand(0)?;
                conv2d(data, dims, &self.params[*param], *geometry, *activation)?
            }
            Op::MaxPool {
                kernel,
                stride,
                pad,
            } => {
                let (data, dims) = operand(0)?;
                max_pool(data, dims, *kernel, *stride, *pad)?
            }
            Op::Upsample2x => {
                let (data, dims) = operand(0)?;
                upsample2x(data, dims)?
            }
            Op::Concat { axis } => {
                let inputs = (0..node.inputs.len())
                    .map(operand)
                    .collect::<Result<Vec<_>>>()?;
                concat(&inputs, *axis)?
            }
            Op::Slice { axis, start, len } => {
                let (data, dims) = operand(0)?;
                slice(data, dims, *axis, *start, *len)?
            }
            Op::Add => {
                let (lhs, dims) = operand(0)?;
                let (rhs, _) = operand(1)?;
                (add(lhs, rhs)?, dims)
            }
            Op::Decode {
                stride,
                reg_max,
                num_classes,
            } => {
                let (boxes, dims) = operand(0)?;
                let (scores, _) = operand(1)?;
                decode(boxes, scores, dims, *stride, *reg_max, *num_classes)?
            }
        };
        Ok(output)
    }
}
