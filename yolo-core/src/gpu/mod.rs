//! WebGPU execution of the YOLOv8 graph.
//!
//! Each op family has a single parametric WGSL kernel; tensor extents travel
//! in a small uniform block. [`GpuInferenceOps`] compiles the pipelines and
//! runs ops eagerly, while [`ExecutionPlan`] records the whole network once
//! and replays it per frame.

pub mod add;
pub mod conv2d;
pub mod copy;
pub mod decode;
pub mod max_pool;
pub mod ops;
pub mod plan;
pub mod runtime;
pub mod tensor;
pub mod upsample2x;
pub mod utils;


pub use add::AddConfig;
pub use conv2d::{Conv2dChannels, Conv2dConfig, Conv2dOptions, SpatialDims};
pub use copy::CopyConfig;
pub use decode::DecodeConfig;
pub use max_pool::MaxPoolConfig;
pub use ops::GpuInferenceOps;
pub use plan::{ExecutionPlan, PlannedDispatch, SlotAssignment, assign_slots};
pub use runtime::GpuYolo;
pub use tensor::{GpuTensor, TensorShape};
pub use upsample2x::Upsample2xConfig;

const CONV2D_WGSL: &str = include_str!("conv2d.wgsl");
const MAX_POOL_WGSL: &str = include_str!("pool.wgsl");
const UPSAMPLE2X_WGSL: &str = include_str!("resize2x.wgsl");
const ADD_WGSL: &str = include_str!("add.wgsl");
const COPY_WGSL: &str = include_str!("copy.wgsl");
const DECODE_WGSL: &str = include_str!("decode.wgsl");
