//! Pre-recorded GPU execution of a [`Graph`].
//!
//! Every intermediate value is mapped onto a small set of reusable storage
//! buffers ("slots"), weights are uploaded once and every bind group and
//! uniform block is created up front. A run is then one buffer write, one
//! compute pass with every dispatch, and one readback.

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use bytemuck::cast_slice;
use log::debug;
use yolo_utils::{GPU_LOG_TARGET, gpu::GpuBufferPool, gpu_readback_f32};

use super::add::AddConfig;
use super::conv2d::Conv2dConfig;
use super::copy::CopyConfig;
use super::decode::DecodeConfig;
use super::max_pool::MaxPoolConfig;
use super::ops::GpuInferenceOps;
use super::tensor::tensor_usage;
use super::upsample2x::Upsample2xConfig;
use super::utils::{KernelLaunch, create_uniform_buffer};
use crate::graph::{Graph, KernelKind, LayerParams, Op};

/// Mapping of graph values onto reusable buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    /// Slot holding each value; every value produced or consumed has one.
    pub value_slots: Vec<Option<usize>>,
    /// Size in bytes of each slot.
    pub slot_sizes: Vec<u64>,
}

impl SlotAssignment {
    pub fn total_bytes(&self) -> u64 {
        self.slot_sizes.iter().sum()
    }
}

/// Assign values to slots by liveness.
///
/// A node's output is placed before its inputs are released, so a dispatch
/// never reads and writes the same buffer. Free slots are reused best-fit;
/// when none is large enough the largest free slot grows. The graph output
/// is never released.
pub fn assign_slots(graph: &Graph) -> SlotAssignment {
    let last_uses = graph.last_uses();
    let mut value_slots = vec![None; graph.values().len()];
    let mut slot_sizes: Vec<u64> = Vec::new();
    let mut free: Vec<usize> = Vec::new();

    let input = graph.input();
    value_slots[input] = Some(place(graph.value(input).size_bytes(), &mut free, &mut slot_sizes));

    for (index, node) in graph.nodes().iter().enumerate() {
        let size = graph.value(node.output).size_bytes();
        value_slots[node.output] = Some(place(size, &mut free, &mut slot_sizes));

        let mut release = |value: usize| {
            if value != graph.output()
                && let Some(slot) = value_slots[value]
                && !free.contains(&slot)
            {
                free.push(slot);
            }
        };
        for &value in &node.inputs {
            if last_uses[value] == Some(index) {
                release(value);
            }
        }
        if last_uses[node.output].is_none() {
            release(node.output);
        }
    }

    SlotAssignment {
        value_slots,
        slot_sizes,
    }
}

fn place(size: u64, free: &mut Vec<usize>, slot_sizes: &mut Vec<u64>) -> usize {
    let best_fit = free
        .iter()
        .enumerate()
        .filter(|&(_, &slot)| slot_sizes[slot] >= size)
        .min_by_key(|&(_, &slot)| slot_sizes[slot])
        .map(|(pos, _)| pos);
    let largest = || {
        free.iter()
            .enumerate()
            .max_by_key(|&(_, &slot)| slot_sizes[slot])
            .map(|(pos, _)| pos)
    };
    match best_fit.or_else(largest) {
        Some(pos) => {
            let slot = free.swap_remove(pos);
            slot_sizes[slot] = slot_sizes[slot].max(size);
            slot
        }
        None => {
            slot_sizes.push(size);
            slot_sizes.len() - 1
        }
    }
}

/// One recorded compute dispatch.
#[derive(Debug)]
pub struct PlannedDispatch {
    pub node: String,
    pub kernel: KernelKind,
    pub workgroups: [u32; 3],
    bind_group: wgpu::BindGroup,
    _uniforms: wgpu::Buffer,
}

/// Graph compiled against one [`GpuInferenceOps`] instance.
#[derive(Debug)]
pub struct ExecutionPlan {
    graph: Arc<Graph>,
    slots: Vec<wgpu::Buffer>,
    assignment: SlotAssignment,
    weights: Vec<wgpu::Buffer>,
    pool: Arc<GpuBufferPool>,
    weight_bytes: u64,
    dispatches: Vec<PlannedDispatch>,
    input_slot: usize,
    output_slot: usize,
    output_len: usize,
    readback: Mutex<wgpu::Buffer>,
}

impl ExecutionPlan {
    /// Upload `params`, allocate slots and record every dispatch of `graph`.
    pub fn build(ops: &GpuInferenceOps, graph: Arc<Graph>, params: &[LayerParams]) -> Result<Self> {
        anyhow::ensure!(
            params.len() == graph.params().len(),
            "graph needs {} parameter layers, got {}",
            graph.params().len(),
            params.len()
        );
        let context = ops.context();
        let device = context.device();
        let pool = ops.buffer_pool();
        let max_binding = context.max_storage_binding();

        let assignment = assign_slots(&graph);
        let mut slots = Vec::with_capacity(assignment.slot_sizes.len());
        for (index, &size) in assignment.slot_sizes.iter().enumerate() {
            anyhow::ensure!(
                size <= max_binding,
                "activation slot {index} needs {size} bytes, device allows {max_binding}"
            );
            let label = format!("yolo_plan_slot_{index}");
            slots.push(
                pool.acquire(size, tensor_usage(), Some(&label))
                    .with_context(|| format!("failed to allocate {label}"))?,
            );
        }

        let mut weights = Vec::with_capacity(params.len() * 2);
        let mut weight_bytes = 0u64;
        for (spec, layer) in graph.params().iter().zip(params) {
            for (suffix, data) in [("weight", &layer.weight), ("bias", &layer.bias)] {
                let size = (data.len() * std::mem::size_of::<f32>()) as u64;
                let label = format!("{}.{suffix}", spec.prefix);
                let buffer = pool
                    .acquire(size, tensor_usage(), Some(&label))
                    .with_context(|| format!("failed to upload {label}"))?;
                context.queue().write_buffer(&buffer, 0, cast_slice(data));
                weight_bytes += size;
                weights.push(buffer);
            }
        }

        let slot_of = |value: usize| -> Result<usize> {
            assignment.value_slots[value]
                .with_context(|| format!("value '{}' has no slot", graph.value(value).name))
        };

        let mut dispatches = Vec::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            let output = &slots[slot_of(node.output)?];
            let inputs = node
                .inputs
                .iter()
                .map(|&value| Ok(&slots[slot_of(value)?]))
                .collect::<Result<Vec<&wgpu::Buffer>>>()?;
            let input_dims: Vec<[usize; 4]> =
                node.inputs.iter().map(|&v| graph.value(v).dims).collect();
            let mut record = |config: &dyn RecordLaunch, storage: &[&wgpu::Buffer]| {
                dispatches.push(config.record(ops, &node.name, storage));
            };

            match &node.op {
                Op::Conv {
                    param,
                    geometry,
                    activation,
                } => {
                    let layer = &params[*param];
                    let config = Conv2dConfig::for_layer(
                        input_dims[0],
                        layer.dims[0],
                        *geometry,
                        *activation,
                    )?;
                    config.validate(
                        graph.value(node.inputs[0]).elements(),
                        layer.weight.len(),
                        layer.bias.len(),
                    )?;
                    let weight = &weights[2 * param];
                    let bias = &weights[2 * param + 1];
                    record(&config, &[inputs[0], weight, bias, output]);
                }
                Op::MaxPool {
                    kernel,
                    stride,
                    pad,
                } => {
                    let config = MaxPoolConfig::new(input_dims[0], *kernel, *stride, *pad)?;
                    record(&config, &[inputs[0], output]);
                }
                Op::Upsample2x => {
                    let config = Upsample2xConfig::new(input_dims[0])?;
                    record(&config, &[inputs[0], output]);
                }
                Op::Concat { axis } => {
                    let output_dims = graph.value(node.output).dims;
                    for (copy, input) in CopyConfig::concat(&input_dims, output_dims, *axis)?
                        .iter()
                        .zip(&inputs)
                    {
                        record(copy, &[*input, output]);
                    }
                }
                Op::Slice { axis, start, len } => {
                    let config = CopyConfig::slice(input_dims[0], *axis, *start, *len)?;
                    record(&config, &[inputs[0], output]);
                }
                Op::Add => {
                    let config = AddConfig::new(graph.value(node.output).elements())?;
                    record(&config, &[inputs[0], inputs[1], output]);
                }
                Op::Decode {
                    stride,
                    reg_max,
                    num_classes,
                } => {
                    let config = DecodeConfig::new(input_dims[0], *stride, *reg_max, *num_classes)?;
                    record(&config, &[inputs[0], inputs[1], output]);
                }
            }
        }

        let input_slot = slot_of(graph.input())?;
        let output_slot = slot_of(graph.output())?;
        let output_value = graph.value(graph.output());
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("yolo_plan_readback"),
            size: output_value.size_bytes(),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        debug!(
            target: GPU_LOG_TARGET,
            "execution plan: {} dispatches, {} slots ({} MiB activations, {} MiB weights)",
            dispatches.len(),
            slots.len(),
            assignment.total_bytes() / (1024 * 1024),
            weight_bytes / (1024 * 1024)
        );

        Ok(Self {
            output_len: output_value.elements(),
            graph,
            slots,
            assignment,
            weights,
            pool: pool.clone(),
            weight_bytes,
            dispatches,
            input_slot,
            output_slot,
            readback: Mutex::new(readback),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn dispatches(&self) -> &[PlannedDispatch] {
        &self.dispatches
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Bytes held by activation slots plus uploaded weights.
    pub fn memory_bytes(&self) -> u64 {
        self.assignment.total_bytes() + self.weight_bytes
    }

    /// Run the recorded plan on a flat `[1, 3, H, W]` input.
    pub fn run(&self, ops: &GpuInferenceOps, input: &[f32]) -> Result<Vec<f32>> {
        let expected = self.graph.value(self.graph.input()).elements();
        anyhow::ensure!(
            input.len() == expected,
            "plan input expected {expected} elements, got {}",
            input.len()
        );
        let context = ops.context();
        let device = context.device();
        let queue = context.queue();

        // Runs share the slots and readback buffer.
        let readback = self
            .readback
            .lock()
            .map_err(|_| anyhow::anyhow!("execution plan lock poisoned"))?;

        queue.write_buffer(&self.slots[self.input_slot], 0, cast_slice(input));
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("yolo_plan_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("yolo_plan_pass"),
                timestamp_writes: None,
            });
            for dispatch in &self.dispatches {
                ops.kernel(dispatch.kernel)
                    .encode(&mut pass, &dispatch.bind_group, dispatch.workgroups);
            }
        }
        let output_bytes = (self.output_len * std::mem::size_of::<f32>()) as u64;
        encoder.copy_buffer_to_buffer(&self.slots[self.output_slot], 0, &readback, 0, output_bytes);
        queue.submit(Some(encoder.finish()));

        gpu_readback_f32!(readback, device, self.output_len, "plan output")
    }

    /// One line per recorded dispatch.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} dispatches over {} slots, {:.1} MiB",
            self.dispatches.len(),
            self.slots.len(),
            self.memory_bytes() as f64 / (1024.0 * 1024.0)
        );
        for (index, dispatch) in self.dispatches.iter().enumerate() {
            let _ = writeln!(
                out,
                "{index:>4}  {:<10} {:<22} {:?}",
                dispatch.kernel, dispatch.node, dispatch.workgroups
            );
        }
        out
    }
}

impl Drop for ExecutionPlan {
    fn drop(&mut self) {
        let bytes: u64 = self
            .slots
            .iter()
            .chain(&self.weights)
            .map(wgpu::Buffer::size)
            .sum();
        self.pool.forget(bytes);
    }
}

/// Object-safe view of [`KernelLaunch`] used while recording.
trait RecordLaunch {
    fn record(
        &self,
        ops: &GpuInferenceOps,
        node: &str,
        storage: &[&wgpu::Buffer],
    ) -> PlannedDispatch;
}

impl<L: KernelLaunch> RecordLaunch for L {
    fn record(
        &self,
        ops: &GpuInferenceOps,
        node: &str,
        storage: &[&wgpu::Buffer],
    ) -> PlannedDispatch {
        let kernel = ops.kernel(self.kind());
        let device = ops.context().device();
        let uniforms = create_uniform_buffer(
            device,
            &format!("yolo_{}_{node}_uniforms", kernel.kind()),
            &self.uniforms(),
        );
        let bind_group = kernel.bind(device, storage, &uniforms);
        PlannedDispatch {
            node: node.to_string(),
            kernel: kernel.kind(),
            workgroups: self.workgroups(),
            bind_group,
            _uniforms: uniforms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::ModelVariant;

    #[test]
    fn slots_never_alias_live_values() {
        let graph = Graph::yolov8(ModelVariant::Nano, 80, 64, 64).unwrap();
        let assignment = assign_slots(&graph);
        let last_uses = graph.last_uses();

        // Track which value owns each slot while walking the schedule.
        let mut owner: Vec<Option<usize>> = vec![None; assignment.slot_sizes.len()];
        let input_slot = assignment.value_slots[graph.input()].unwrap();
        owner[input_slot] = Some(graph.input());
        for (index, node) in graph.nodes().iter().enumerate() {
            let slot = assignment.value_slots[node.output].unwrap();
            if let Some(previous) = owner[slot] {
                let dead = last_uses[previous].is_some_and(|last| last < index)
                    && previous != graph.output();
                assert!(dead, "{} overwrites live value {}", node.name, graph.value(previous).name);
            }
            for &input in &node.inputs {
                assert_ne!(
                    assignment.value_slots[input].unwrap(),
                    slot,
                    "{} reads and writes one slot",
                    node.name
                );
            }
            assert!(assignment.slot_sizes[slot] >= graph.value(node.output).size_bytes());
            owner[slot] = Some(node.output);
        }
    }

    #[test]
    fn slots_are_reused() {
        let graph = Graph::yolov8(ModelVariant::Nano, 80, 640, 640).unwrap();
        let assignment = assign_slots(&graph);
        assert!(assignment.slot_sizes.len() < graph.values().len() / 4);
        let naive: u64 = graph.values().iter().map(|v| v.size_bytes()).sum();
        assert!(assignment.total_bytes() < naive / 2);
    }
}
