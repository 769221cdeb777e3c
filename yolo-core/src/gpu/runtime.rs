use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use ndarray::{Array2, Array4};
use yolo_utils::{
    GPU_LOG_TARGET,
    gpu::GpuContext,
    telemetry::timing_guard,
};

use super::ops::GpuInferenceOps;
use super::plan::{ExecutionPlan, assign_slots};
use crate::model::{DetectionBackend, YoloModel, input_slice, output_matrix};

/// Headroom for eager-op temporaries and readback staging.
const FIXED_OVERHEAD: u64 = 64 * 1024 * 1024;

/// YOLOv8 running on a pre-recorded WebGPU execution plan.
#[derive(Debug)]
pub struct GpuYolo {
    ops: Arc<GpuInferenceOps>,
    plan: ExecutionPlan,
    memory_budget: u64,
}

impl GpuYolo {
    /// Record the plan for `model` on an existing context.
    ///
    /// `memory_limit` caps the buffer pool; without one the pool is sized
    /// from the plan's own estimate.
    pub fn with_context(
        context: Arc<GpuContext>,
        model: &YoloModel,
        memory_limit: Option<u64>,
    ) -> Result<Self> {
        let _guard = timing_guard("yolo_core::gpu_plan_build", log::Level::Debug);
        let estimate = estimate_inference_memory(model);
        let budget = match memory_limit {
            Some(limit) if limit < estimate => {
                warn!(
                    target: GPU_LOG_TARGET,
                    "GPU memory limit ({} MiB) is below the estimated requirement ({} MiB)",
                    limit / (1024 * 1024),
                    estimate / (1024 * 1024)
                );
                limit
            }
            Some(limit) => limit,
            None => estimate,
        };

        let ops = Arc::new(GpuInferenceOps::new(context, Some(budget))?);
        let plan = ExecutionPlan::build(&ops, model.graph().clone(), model.params())
            .context("failed to record GPU execution plan")?;
        info!(
            target: GPU_LOG_TARGET,
            "recorded {} dispatches for {} ({} slots, {:.1} MiB)",
            plan.dispatches().len(),
            model.variant(),
            plan.slot_count(),
            plan.memory_bytes() as f64 / (1024.0 * 1024.0)
        );
        Ok(Self {
            ops,
            plan,
            memory_budget: budget,
        })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Ceiling handed to the buffer pool.
    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    /// Bytes allocated through the buffer pool.
    pub fn memory_usage(&self) -> u64 {
        self.ops.memory_usage()
    }
}

impl DetectionBackend for GpuYolo {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn run(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let graph = self.plan.graph();
        let data = input_slice(graph, input)?;
        let output = self.plan.run(&self.ops, &data)?;
        output_matrix(graph, output)
    }
}

/// Folded weights plus the slot arena, with fixed headroom.
fn estimate_inference_memory(model: &YoloModel) -> u64 {
    let arena = assign_slots(model.graph()).total_bytes();
    model.parameter_bytes() + arena + FIXED_OVERHEAD
}
