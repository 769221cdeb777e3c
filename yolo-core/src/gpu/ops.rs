use super::add::{self, AddConfig};
use super::conv2d::{self, Conv2dConfig};
use super::copy::{self, CopyConfig};
use super::decode::{self, DecodeConfig};
use super::max_pool::{self, MaxPoolConfig};
use super::tensor::GpuTensor;
use super::upsample2x::{self, Upsample2xConfig};
use super::utils::{ComputeKernel, KernelLaunch, create_uniform_buffer};
use crate::graph::KernelKind;

use anyhow::Result;
use std::sync::Arc;
use yolo_utils::gpu::{GpuBufferPool, GpuContext};

/// Collection of GPU-backed YOLO primitives.
///
/// Owns one compiled pipeline per kernel family plus the buffer pool every
/// tensor it creates draws from. The execution plan records dispatches
/// against these same pipelines.
#[derive(Debug)]
pub struct GpuInferenceOps {
    context: Arc<GpuContext>,
    buffer_pool: Arc<GpuBufferPool>,
    conv2d: ComputeKernel,
    max_pool: ComputeKernel,
    upsample2x: ComputeKernel,
    copy: ComputeKernel,
    add: ComputeKernel,
    decode: ComputeKernel,
}

impl GpuInferenceOps {
    /// Compile the pipelines on `context`; `memory_limit` caps the buffer pool in bytes.
    pub fn new(context: Arc<GpuContext>, memory_limit: Option<u64>) -> Result<Self> {
        let device = context.device();
        Ok(Self {
            conv2d: conv2d::pipeline(device),
            max_pool: max_pool::pipeline(device),
            upsample2x: upsample2x::pipeline(device),
            copy: copy::pipeline(device),
            add: add::pipeline(device),
            decode: decode::pipeline(device),
            buffer_pool: Arc::new(GpuBufferPool::new(context.clone(), memory_limit)),
            context,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn buffer_pool(&self) -> &Arc<GpuBufferPool> {
        &self.buffer_pool
    }

    pub(crate) fn kernel(&self, kind: KernelKind) -> &ComputeKernel {
        match kind {
            KernelKind::Conv2d => &self.conv2d,
            KernelKind::MaxPool => &self.max_pool,
            KernelKind::Upsample2x => &self.upsample2x,
            KernelKind::Copy => &self.copy,
            KernelKind::Add => &self.add,
            KernelKind::Decode => &self.decode,
        }
    }

    /// Upload host data into a pooled GPU tensor.
    pub fn upload_tensor<D>(&self, dims: D, data: &[f32], label: Option<&str>) -> Result<GpuTensor>
    where
        D: Into<Vec<usize>>,
    {
        GpuTensor::from_slice_with_pool(
            self.context.clone(),
            Some(self.buffer_pool.clone()),
            dims,
            data,
            label,
        )
    }

    /// Upload host data into an existing GPU tensor.
    pub fn upload_to_tensor(&self, tensor: &GpuTensor, data: &[f32]) -> Result<()> {
        self.ensure_same_context(tensor, "upload target")?;
        tensor.write(data)
    }

    pub fn download_tensor(&self, tensor: &GpuTensor) -> Result<Vec<f32>> {
        tensor.to_vec()
    }

    /// Bytes currently allocated through the pool (idle or in use).
    pub fn memory_usage(&self) -> u64 {
        self.buffer_pool.memory_usage()
    }

    fn ensure_same_context(&self, tensor: &GpuTensor, label: &str) -> Result<()> {
        anyhow::ensure!(
            Arc::ptr_eq(tensor.context(), &self.context),
            "{label} tensor was created from a different GPU context"
        );
        Ok(())
    }

    fn output_tensor(&self, dims: [usize; 4], label: &str) -> Result<GpuTensor> {
        GpuTensor::uninitialized_with_pool(
            self.context.clone(),
            Some(self.buffer_pool.clone()),
            dims,
            Some(label),
        )
    }

    /// Bind `storage` plus fresh uniforms and submit a single dispatch.
    pub(crate) fn launch<L: KernelLaunch>(
        &self,
        config: &L,
        storage: &[&wgpu::Buffer],
    ) -> Result<()> {
        let kernel = self.kernel(config.kind());
        let device = self.context.device();
        let label = format!("yolo_{}", kernel.kind());
        let uniforms =
            create_uniform_buffer(device, &format!("{label}_uniforms"), &config.uniforms());
        let bind_group = kernel.bind(device, storage, &uniforms);

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&format!("{label}_encoder")),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&format!("{label}_pass")),
                timestamp_writes: None,
            });
            kernel.encode(&mut pass, &bind_group, config.workgroups());
        }
        self.context.queue().submit(Some(encoder.finish()));
        Ok(())
    }

    /// Convolution with fused bias/activation on GPU-resident tensors.
    pub fn conv2d_tensor(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        config.validate(
            input.shape().elements(),
            weights.shape().elements(),
            bias.shape().elements(),
        )?;
        self.ensure_same_context(input, "conv2d input")?;
        self.ensure_same_context(weights, "conv2d weights")?;
        self.ensure_same_context(bias, "conv2d bias")?;
        let output = self.output_tensor(config.output_shape_dims(), "yolo_conv2d_output")?;
        self.launch(
            config,
            &[input.buffer(), weights.buffer(), bias.buffer(), output.buffer()],
        )?;
        Ok(output)
    }

    /// Upload host slices, run one convolution and download the result.
    pub fn conv2d(
        &self,
        input: &[f32],
        weights: &[f32],
        bias: &[f32],
        config: &Conv2dConfig,
    ) -> Result<Vec<f32>> {
        let input_tensor =
            self.upload_tensor(config.input_shape_dims(), input, Some("yolo_conv_input"))?;
        let weight_tensor = self.upload_tensor(
            config.weight_shape_dims(),
            weights,
            Some("yolo_conv_weights"),
        )?;
        let bias_tensor =
            self.upload_tensor(config.bias_shape_dims(), bias, Some("yolo_conv_bias"))?;
        let output = self.conv2d_tensor(&input_tensor, &weight_tensor, &bias_tensor, config)?;
        output.to_vec()
    }

    /// Max pool; padded taps never win.
    pub fn max_pool_tensor(
        &self,
        tensor: &GpuTensor,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<GpuTensor> {
        self.ensure_same_context(tensor, "max_pool tensor")?;
        let config = MaxPoolConfig::new(tensor.shape().nchw()?, kernel, stride, pad)?;
        let output = self.output_tensor(config.output_dims(), "yolo_max_pool_output")?;
        self.launch(&config, &[tensor.buffer(), output.buffer()])?;
        Ok(output)
    }

    /// Nearest-neighbour 2x upsample.
    pub fn upsample2x_tensor(&self, tensor: &GpuTensor) -> Result<GpuTensor> {
        self.ensure_same_context(tensor, "upsample tensor")?;
        let config = Upsample2xConfig::new(tensor.shape().nchw()?)?;
        let output = self.output_tensor(config.output_dims(), "yolo_upsample2x_output")?;
        self.launch(&config, &[tensor.buffer(), output.buffer()])?;
        Ok(output)
    }

    /// Element-wise addition of two tensors.
    pub fn add_tensors(&self, lhs: &GpuTensor, rhs: &GpuTensor) -> Result<GpuTensor> {
        self.ensure_same_context(lhs, "add lhs")?;
        self.ensure_same_context(rhs, "add rhs")?;
        anyhow::ensure!(
            lhs.shape().dims() == rhs.shape().dims(),
            "add tensors require identical shapes (lhs={:?}, rhs={:?})",
            lhs.shape().dims(),
            rhs.shape().dims()
        );
        let config = AddConfig::new(lhs.shape().elements())?;
        let output = self.output_tensor(lhs.shape().nchw()?, "yolo_add_output")?;
        self.launch(&config, &[lhs.buffer(), rhs.buffer(), output.buffer()])?;
        Ok(output)
    }

    /// Concatenate NCHW tensors along `axis`.
    pub fn concat_tensors(&self, inputs: &[&GpuTensor], axis: usize) -> Result<GpuTensor> {
        let Some(first) = inputs.first() else {
            anyhow::bail!("concat needs at least one input");
        };
        anyhow::ensure!(axis < 4, "concat axis {axis} out of range");
        let mut dims = Vec::with_capacity(inputs.len());
        for tensor in inputs {
            self.ensure_same_context(tensor, "concat input")?;
            dims.push(tensor.shape().nchw()?);
        }
        let mut output_dims = first.shape().nchw()?;
        output_dims[axis] = dims.iter().map(|d| d[axis]).sum();
        let output = self.output_tensor(output_dims, "yolo_concat_output")?;
        let copies = CopyConfig::concat(&dims, output_dims, axis)?;
        for (tensor, copy) in inputs.iter().zip(&copies) {
            self.launch(copy, &[tensor.buffer(), output.buffer()])?;
        }
        Ok(output)
    }

    /// Take `len` entries starting at `start` along `axis`.
    pub fn slice_tensor(
        &self,
        tensor: &GpuTensor,
        axis: usize,
        start: usize,
        len: usize,
    ) -> Result<GpuTensor> {
        self.ensure_same_context(tensor, "slice tensor")?;
        anyhow::ensure!(axis < 4, "slice axis {axis} out of range");
        let dims = tensor.shape().nchw()?;
        let copy = CopyConfig::slice(dims, axis, start, len)?;
        let mut output_dims = dims;
        output_dims[axis] = len;
        let output = self.output_tensor(output_dims, "yolo_slice_output")?;
        self.launch(&copy, &[tensor.buffer(), output.buffer()])?;
        Ok(output)
    }

    /// Decode one head level into `[1, 4 + classes, H * W, 1]`.
    pub fn decode_tensors(
        &self,
        boxes: &GpuTensor,
        scores: &GpuTensor,
        stride: usize,
        reg_max: usize,
    ) -> Result<GpuTensor> {
        self.ensure_same_context(boxes, "decode boxes")?;
        self.ensure_same_context(scores, "decode scores")?;
        let box_dims = boxes.shape().nchw()?;
        let score_dims = scores.shape().nchw()?;
        anyhow::ensure!(
            box_dims[2..] == score_dims[2..],
            "decode maps differ in size ({box_dims:?} vs {score_dims:?})"
        );
        let config = DecodeConfig::new(box_dims, stride, reg_max, score_dims[1])?;
        let output = self.output_tensor(config.output_dims(), "yolo_decode_output")?;
        self.launch(&config, &[boxes.buffer(), scores.buffer(), output.buffer()])?;
        Ok(output)
    }
}
