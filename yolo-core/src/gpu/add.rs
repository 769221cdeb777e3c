use super::utils::{ComputeKernel, KernelLaunch, LINEAR_WORKGROUP, linear_workgroups, to_u32};
use crate::graph::KernelKind;

use anyhow::Result;
use yolo_utils::{create_gpu_pipeline, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry};

pub(crate) fn pipeline(device: &wgpu::Device) -> ComputeKernel {
    ComputeKernel::new(
        KernelKind::Add,
        create_gpu_pipeline!(
            device,
            "add",
            super::ADD_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_only),
                storage_buffer_entry!(2, read_write),
                uniform_buffer_entry!(3),
            ]
        ),
    )
}

#[derive(Debug, Clone, Copy)]
pub struct AddConfig {
    pub len: u32,
}

impl AddConfig {
    pub fn new(elements: usize) -> Result<Self> {
        anyhow::ensure!(elements > 0, "add requires non-empty tensors");
        Ok(Self {
            len: to_u32(elements, "add length")?,
        })
    }
}

gpu_uniforms!(pub(crate) AddUniforms, 3, { len: u32 });

impl KernelLaunch for AddConfig {
    type Uniforms = AddUniforms;

    fn kind(&self) -> KernelKind {
        KernelKind::Add
    }

    fn uniforms(&self) -> AddUniforms {
        AddUniforms {
            len: self.len,
            __padding: [0; 3],
        }
    }

    fn workgroups(&self) -> [u32; 3] {
        linear_workgroups(self.len, LINEAR_WORKGROUP)
    }
}
