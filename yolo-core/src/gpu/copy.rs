use super::utils::{ComputeKernel, KernelLaunch, LINEAR_WORKGROUP, linear_workgroups, to_u32};
use crate::{cpu::CopyRegion, graph::KernelKind};

use anyhow::Result;
use yolo_utils::{create_gpu_pipeline, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry};

pub(crate) fn pipeline(device: &wgpu::Device) -> ComputeKernel {
    ComputeKernel::new(
        KernelKind::Copy,
        create_gpu_pipeline!(
            device,
            "copy",
            super::COPY_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_write),
                uniform_buffer_entry!(2),
            ]
        ),
    )
}

/// A [`CopyRegion`] validated for the 32-bit index space of the shader.
#[derive(Debug, Clone, Copy)]
pub struct CopyConfig {
    uniforms: CopyUniforms,
}

impl CopyConfig {
    pub fn new(region: CopyRegion) -> Result<Self> {
        let total = region.elements();
        anyhow::ensure!(total > 0, "copy region is empty");
        Ok(Self {
            uniforms: CopyUniforms {
                outer: to_u32(region.outer, "copy outer extent")?,
                inner: to_u32(region.inner, "copy inner extent")?,
                src_dim: to_u32(region.src_dim, "copy source axis")?,
                dst_dim: to_u32(region.dst_dim, "copy destination axis")?,
                src_offset: to_u32(region.src_offset, "copy source offset")?,
                dst_offset: to_u32(region.dst_offset, "copy destination offset")?,
                len: to_u32(region.len, "copy length")?,
                total: to_u32(total, "copy element count")?,
                __padding: [],
            },
        })
    }

    /// One copy per input, writing consecutive blocks of the concatenated output.
    pub fn concat(inputs: &[[usize; 4]], output: [usize; 4], axis: usize) -> Result<Vec<Self>> {
        let mut offset = 0;
        inputs
            .iter()
            .map(|&dims| {
                let region = CopyRegion::new(dims, output, axis, 0, offset, dims[axis])?;
                offset += dims[axis];
                Self::new(region)
            })
            .collect()
    }

    pub fn slice(input: [usize; 4], axis: usize, start: usize, len: usize) -> Result<Self> {
        let mut output = input;
        output[axis] = len;
        Self::new(CopyRegion::new(input, output, axis, start, 0, len)?)
    }
}

gpu_uniforms!(pub(crate) CopyUniforms, 0, {
    outer: u32,
    inner: u32,
    src_dim: u32,
    dst_dim: u32,
    src_offset: u32,
    dst_offset: u32,
    len: u32,
    total: u32,
});

impl KernelLaunch for CopyConfig {
    type Uniforms = CopyUniforms;

    fn kind(&self) -> KernelKind {
        KernelKind::Copy
    }

    fn uniforms(&self) -> CopyUniforms {
        self.uniforms
    }

    fn workgroups(&self) -> [u32; 3] {
        linear_workgroups(self.uniforms.total, LINEAR_WORKGROUP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_offsets_accumulate() {
        let copies = CopyConfig::concat(&[[1, 4, 8, 8], [1, 2, 8, 8]], [1, 6, 8, 8], 1).unwrap();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].uniforms().dst_offset, 0);
        assert_eq!(copies[1].uniforms().dst_offset, 4);
        assert_eq!(copies[1].uniforms().total, 2 * 64);
        assert_eq!(copies[1].uniforms().inner, 64);
    }

    #[test]
    fn slice_copies_a_channel_window() {
        let copy = CopyConfig::slice([1, 8, 4, 4], 1, 4, 4).unwrap();
        let u = copy.uniforms();
        assert_eq!((u.src_offset, u.len, u.src_dim, u.dst_dim), (4, 4, 8, 4));
        assert!(CopyConfig::slice([1, 8, 4, 4], 1, 6, 4).is_err());
    }
}
