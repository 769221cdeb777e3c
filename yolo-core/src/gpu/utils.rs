use anyhow::{Context, Result};
use bytemuck::{Pod, bytes_of};

use crate::graph::KernelKind;

/// Largest workgroup count wgpu accepts in a single dispatch dimension.
pub(crate) const MAX_WORKGROUPS_PER_DIM: u32 = 65_535;
/// Threads per workgroup of the one-dimensional kernels.
pub(crate) const LINEAR_WORKGROUP: u32 = 256;

pub(crate) fn create_uniform_buffer(
    device: &wgpu::Device,
    label: &str,
    data: &impl Pod,
) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;

    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytes_of(data),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

pub(crate) fn compute_output_dim(size: u32, pad: u32, kernel: u32, stride: u32) -> Result<u32> {
    anyhow::ensure!(stride > 0, "stride must be > 0");
    anyhow::ensure!(kernel > 0, "kernel must be > 0");
    let numerator = size
        .checked_add(pad * 2)
        .context("padding overflowed u32")?
        .checked_sub(kernel)
        .context("kernel larger than padded input")?;
    Ok(numerator / stride + 1)
}

/// Spread `elements` threads over a 2-D grid so no dimension exceeds the dispatch limit.
///
/// Shaders recover the flat index as `gid.x + gid.y * num_workgroups.x * workgroup_size`.
pub(crate) fn linear_workgroups(elements: u32, workgroup_size: u32) -> [u32; 3] {
    let groups = elements.div_ceil(workgroup_size).max(1);
    let x = groups.min(MAX_WORKGROUPS_PER_DIM);
    [x, groups.div_ceil(x), 1]
}

pub(crate) fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{what} ({value}) does not fit in u32"))
}

/// Geometry and uniforms of one kernel launch.
pub(crate) trait KernelLaunch {
    type Uniforms: Pod;

    fn kind(&self) -> KernelKind;
    fn uniforms(&self) -> Self::Uniforms;
    fn workgroups(&self) -> [u32; 3];
}

/// A compiled compute pipeline and the layout its bind groups use.
///
/// Storage buffers bind at `0..n` in the order the shader declares them; the
/// uniform block always takes the last binding.
#[derive(Debug)]
pub(crate) struct ComputeKernel {
    kind: KernelKind,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ComputeKernel {
    pub(crate) fn new(
        kind: KernelKind,
        (pipeline, bind_group_layout): (wgpu::ComputePipeline, wgpu::BindGroupLayout),
    ) -> Self {
        Self {
            kind,
            pipeline,
            bind_group_layout,
        }
    }

    pub(crate) fn kind(&self) -> KernelKind {
        self.kind
    }

    pub(crate) fn bind(
        &self,
        device: &wgpu::Device,
        storage: &[&wgpu::Buffer],
        uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry<'_>> = storage
            .iter()
            .copied()
            .chain(std::iter::once(uniforms))
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("yolo_{}_bg", self.kind)),
            layout: &self.bind_group_layout,
            entries: &entries,
        })
    }

    pub(crate) fn encode(
        &self,
        pass: &mut wgpu::ComputePass<'_>,
        bind_group: &wgpu::BindGroup,
        workgroups: [u32; 3],
    ) {
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_workgroups_fold_large_dispatches() {
        assert_eq!(linear_workgroups(0, 256), [1, 1, 1]);
        assert_eq!(linear_workgroups(1000, 256), [4, 1, 1]);
        let [x, y, z] = linear_workgroups(40_000_000, 256);
        assert!(x <= MAX_WORKGROUPS_PER_DIM && y <= MAX_WORKGROUPS_PER_DIM);
        assert!(u64::from(x) * u64::from(y) * 256 >= 40_000_000);
        assert_eq!(z, 1);
    }

    #[test]
    fn output_dims_follow_padding_rules() {
        assert_eq!(compute_output_dim(640, 1, 3, 2).unwrap(), 320);
        assert_eq!(compute_output_dim(20, 2, 5, 1).unwrap(), 20);
        assert!(compute_output_dim(2, 0, 3, 1).is_err());
        assert!(compute_output_dim(2, 0, 1, 0).is_err());
    }
}
