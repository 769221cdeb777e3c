use anyhow::{Context, Result};
use bytemuck::cast_slice;
use std::{fmt, sync::Arc};
use wgpu::util::DeviceExt;
use yolo_utils::{
    gpu::{GpuBufferPool, GpuContext},
    gpu_readback_f32,
};

/// Describes the dimensionality of a GPU tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorShape {
    dims: Vec<usize>,
    elements: usize,
}

impl TensorShape {
    /// Create a tensor shape from the provided dimensions.
    pub fn new<D>(dims: D) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let dims_vec = dims.into();
        anyhow::ensure!(
            !dims_vec.is_empty(),
            "tensor shape must have at least one dimension"
        );
        let mut elements = 1usize;
        for (idx, dim) in dims_vec.iter().enumerate() {
            anyhow::ensure!(
                *dim > 0,
                "dimension {idx} must be greater than zero (got {dim})"
            );
            elements = elements
                .checked_mul(*dim)
                .with_context(|| format!("tensor shape would overflow usize at dimension {idx}"))?;
        }
        Ok(Self {
            dims: dims_vec,
            elements,
        })
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// The dims as NCHW, for kernels that only accept rank-4 tensors.
    pub fn nchw(&self) -> Result<[usize; 4]> {
        <[usize; 4]>::try_from(self.dims.as_slice())
            .map_err(|_| anyhow::anyhow!("expected an NCHW tensor, got dims {:?}", self.dims))
    }

    pub fn size_bytes(&self) -> u64 {
        (self.elements * std::mem::size_of::<f32>()) as u64
    }
}

/// Wrapper around a GPU buffer holding an `f32` tensor.
///
/// Clones share the buffer. Pooled buffers return to their pool when the
/// last clone drops.
pub struct GpuTensor {
    inner: Arc<GpuTensorInner>,
}

struct GpuTensorInner {
    context: Arc<GpuContext>,
    buffer: wgpu::Buffer,
    shape: TensorShape,
    pool: Option<Arc<GpuBufferPool>>,
}

impl Drop for GpuTensorInner {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.recycle(self.buffer.clone(), self.buffer.size(), tensor_usage());
        }
    }
}

impl GpuTensor {
    /// Upload host data. The data length must match the shape's element count.
    pub fn from_slice<D>(
        context: Arc<GpuContext>,
        dims: D,
        data: &[f32],
        label: Option<&str>,
    ) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        Self::from_slice_with_pool(context, None, dims, data, label)
    }

    /// Upload host data into a buffer taken from `pool`.
    pub fn from_slice_with_pool<D>(
        context: Arc<GpuContext>,
        pool: Option<Arc<GpuBufferPool>>,
        dims: D,
        data: &[f32],
        label: Option<&str>,
    ) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let shape = TensorShape::new(dims)?;
        anyhow::ensure!(
            data.len() == shape.elements(),
            "tensor upload expected {} values, got {}",
            shape.elements(),
            data.len()
        );
        let usage = tensor_usage();
        let buffer = match pool.as_ref() {
            Some(pool) => {
                let buffer = pool.acquire(shape.size_bytes(), usage, label)?;
                context.queue().write_buffer(&buffer, 0, cast_slice(data));
                buffer
            }
            None => context
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label,
                    contents: cast_slice(data),
                    usage,
                }),
        };
        Ok(Self::from_parts(context, pool, buffer, shape))
    }

    /// Overwrite the tensor contents. The data length must match the element count.
    pub fn write(&self, data: &[f32]) -> Result<()> {
        anyhow::ensure!(
            data.len() == self.shape().elements(),
            "write data length {} does not match tensor elements {}",
            data.len(),
            self.shape().elements()
        );
        self.context()
            .queue()
            .write_buffer(&self.inner.buffer, 0, cast_slice(data));
        Ok(())
    }

    /// Allocate a tensor with undefined contents.
    pub fn uninitialized<D>(context: Arc<GpuContext>, dims: D, label: Option<&str>) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        Self::uninitialized_with_pool(context, None, dims, label)
    }

    pub fn uninitialized_with_pool<D>(
        context: Arc<GpuContext>,
        pool: Option<Arc<GpuBufferPool>>,
        dims: D,
        label: Option<&str>,
    ) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let shape = TensorShape::new(dims)?;
        let usage = tensor_usage();
        let buffer = match pool.as_ref() {
            Some(pool) => pool.acquire(shape.size_bytes(), usage, label)?,
            None => context.device().create_buffer(&wgpu::BufferDescriptor {
                label,
                size: shape.size_bytes(),
                usage,
                mapped_at_creation: false,
            }),
        };
        Ok(Self::from_parts(context, pool, buffer, shape))
    }

    /// Download the tensor contents to the host.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let device = self.context().device();
        let size_bytes = self.shape().size_bytes();
        let usage = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ;

        let readback = match &self.inner.pool {
            Some(pool) => pool.acquire(size_bytes, usage, Some("yolo_tensor_readback"))?,
            None => device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("yolo_tensor_readback"),
                size: size_bytes,
                usage,
                mapped_at_creation: false,
            }),
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("yolo_tensor_readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(self.buffer(), 0, &readback, 0, size_bytes);
        self.context().queue().submit(Some(encoder.finish()));

        let result = gpu_readback_f32!(
            readback,
            device,
            self.shape().elements(),
            "tensor readback"
        );

        if let Some(pool) = &self.inner.pool {
            pool.recycle(readback.clone(), readback.size(), usage);
        }
        result
    }

    pub fn shape(&self) -> &TensorShape {
        &self.inner.shape
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.inner.buffer
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.inner.context
    }

    fn from_parts(
        context: Arc<GpuContext>,
        pool: Option<Arc<GpuBufferPool>>,
        buffer: wgpu::Buffer,
        shape: TensorShape,
    ) -> Self {
        Self {
            inner: Arc::new(GpuTensorInner {
                context,
                buffer,
                shape,
                pool,
            }),
        }
    }
}

impl Clone for GpuTensor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTensor")
            .field("dims", &self.shape().dims())
            .finish()
    }
}

pub(crate) fn tensor_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

#[cfg(test)]
mod tests {
    use super::*;
    use yolo_utils::gpu::{GpuAvailability, GpuContextOptions};

    fn test_context() -> Option<Arc<GpuContext>> {
        match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => Some(ctx),
            other => {
                eprintln!("Skipping GPU tensor test: {:?}", other.status().summary);
                None
            }
        }
    }

    #[test]
    fn shapes_validate_dims() {
        assert!(TensorShape::new(Vec::<usize>::new()).is_err());
        assert!(TensorShape::new([2usize, 0]).is_err());
        let shape = TensorShape::new([1usize, 3, 4, 5]).unwrap();
        assert_eq!(shape.elements(), 60);
        assert_eq!(shape.size_bytes(), 240);
        assert_eq!(shape.nchw().unwrap(), [1, 3, 4, 5]);
        assert!(TensorShape::new([4usize]).unwrap().nchw().is_err());
    }

    #[test]
    fn upload_download_roundtrip() {
        let Some(ctx) = test_context() else {
            return;
        };
        let data: Vec<f32> = (0..16).map(|i| i as f32 * 0.5).collect();
        let tensor = GpuTensor::from_slice(ctx, [2usize, 2, 2, 2], &data, Some("tensor_test"))
            .expect("tensor upload");
        assert_eq!(tensor.shape().elements(), data.len());
        assert_eq!(tensor.to_vec().expect("download tensor"), data);
    }

    #[test]
    fn pooled_tensors_return_buffers() {
        let Some(ctx) = test_context() else {
            return;
        };
        let pool = Arc::new(GpuBufferPool::new(ctx.clone(), None));
        assert_eq!(pool.available(), 0);
        {
            let tensor = GpuTensor::uninitialized_with_pool(
                ctx.clone(),
                Some(pool.clone()),
                [1usize, 1, 1, 1],
                Some("tensor_pool_test"),
            )
            .expect("allocate pooled tensor");
            let _alias = tensor.clone();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn write_replaces_contents() {
        let Some(ctx) = test_context() else {
            return;
        };
        let tensor = GpuTensor::from_slice(ctx, [4usize], &[1.0, 2.0, 3.0, 4.0], None)
            .expect("tensor upload");
        tensor.write(&[10.0, 20.0, 30.0, 40.0]).expect("tensor write");
        assert_eq!(tensor.to_vec().unwrap(), vec![10.0, 20.0, 30.0, 40.0]);
        assert!(tensor.write(&[1.0]).is_err());
    }
}
