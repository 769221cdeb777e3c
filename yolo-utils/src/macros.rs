//! Macros that cut the WGSL pipeline boilerplate shared by every kernel.
//!
//! Kernels in `yolo-core` all follow the same shape: one WGSL module, one bind
//! group layout made of storage buffers plus a trailing uniform, one compute
//! pipeline with a `main` entry point.

/// Creates a storage buffer bind group layout entry.
///
/// ```ignore
/// let entry = storage_buffer_entry!(0, read_only);
/// ```
#[macro_export]
macro_rules! storage_buffer_entry {
    (@entry $binding:expr, $read_only:expr) => {
        wgpu::BindGroupLayoutEntry {
            binding: $binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: $read_only,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    };
    ($binding:expr, read_only) => {
        $crate::storage_buffer_entry!(@entry $binding, true)
    };
    ($binding:expr, read_write) => {
        $crate::storage_buffer_entry!(@entry $binding, false)
    };
}

/// Creates a uniform buffer bind group layout entry.
#[macro_export]
macro_rules! uniform_buffer_entry {
    ($binding:expr) => {
        wgpu::BindGroupLayoutEntry {
            binding: $binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    };
}

/// Builds a compute pipeline and its bind group layout from WGSL source.
///
/// Returns `(wgpu::ComputePipeline, wgpu::BindGroupLayout)`.
///
/// ```ignore
/// let (pipeline, layout) = create_gpu_pipeline!(
///     device,
///     "add",
///     include_str!("add.wgsl"),
///     [
///         storage_buffer_entry!(0, read_only),
///         storage_buffer_entry!(1, read_only),
///         storage_buffer_entry!(2, read_write),
///         uniform_buffer_entry!(3),
///     ]
/// );
/// ```
#[macro_export]
macro_rules! create_gpu_pipeline {
    ($device:expr, $label:literal, $shader_source:expr, [$($entry:expr),* $(,)?]) => {{
        let shader = $device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(concat!("yolo_", $label, "_shader")),
            source: wgpu::ShaderSource::Wgsl($shader_source.into()),
        });

        let bind_group_layout = $device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(concat!("yolo_", $label, "_bgl")),
            entries: &[$($entry),*],
        });

        let pipeline_layout = $device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(concat!("yolo_", $label, "_layout")),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = $device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(concat!("yolo_", $label, "_pipeline")),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        (pipeline, bind_group_layout)
    }};
}

/// Maps a `MAP_READ` buffer, copies its contents out as `f32` and unmaps it.
///
/// Evaluates to `anyhow::Result<Vec<f32>>`; `$expected_len` is in elements.
/// The buffer is left unmapped on every path except a failed map request.
#[macro_export]
macro_rules! gpu_readback_f32 {
    ($readback:expr, $device:expr, $expected_len:expr, $operation:expr) => {{
        use std::sync::mpsc;

        let slice = $readback.slice(..);
        let mut guard = $crate::gpu::ReadbackGuard::new(&$readback);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });

        let outcome = (|| -> anyhow::Result<Vec<f32>> {
            if let Err(err) = $device.poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            }) {
                if let Ok(Err(_)) = receiver.try_recv() {
                    guard.disarm();
                }
                anyhow::bail!("device poll failed during {}: {err}", $operation);
            }

            let mapping = receiver
                .recv()
                .map_err(|_| anyhow::anyhow!("GPU {} map callback dropped", $operation))?;
            if let Err(err) = mapping {
                guard.disarm();
                anyhow::bail!("GPU {} map error: {err}", $operation);
            }

            let mapped = slice.get_mapped_range();
            let values: Vec<f32> = bytemuck::cast_slice(&mapped).to_vec();
            drop(mapped);

            anyhow::ensure!(
                values.len() >= $expected_len,
                "unexpected GPU {} output size (expected {}, got {})",
                $operation,
                $expected_len,
                values.len()
            );
            Ok(values)
        })();
        drop(guard);

        outcome.map(|mut values| {
            values.truncate($expected_len);
            values
        })
    }};
}

/// Defines a `#[repr(C)]` uniform block padded to a 16-byte multiple.
///
/// Padding is given in `u32` words: `(16 - (fields * 4) % 16) / 4`, or `0`
/// when the field count is already a multiple of four.
///
/// ```ignore
/// gpu_uniforms!(pub AddUniforms, 3, { len: u32 });
/// ```
#[macro_export]
macro_rules! gpu_uniforms {
    ($vis:vis $name:ident, $padding:expr, { $($field:ident: $ty:ty),+ $(,)? }) => {
        #[repr(C)]
        #[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
        $vis struct $name {
            $(pub $field: $ty,)+
            pub __padding: [u32; $padding],
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn uniform_blocks_are_sixteen_byte_multiples() {
        gpu_uniforms!(Three, 1, { a: u32, b: u32, c: f32 });
        assert_eq!(std::mem::size_of::<Three>(), 16);

        gpu_uniforms!(Seven, 1, {
            a: u32,
            b: u32,
            c: u32,
            d: u32,
            e: u32,
            f: u32,
            g: f32,
        });
        assert_eq!(std::mem::size_of::<Seven>(), 32);

        gpu_uniforms!(Eight, 0, {
            a: u32,
            b: u32,
            c: u32,
            d: u32,
            e: u32,
            f: u32,
            g: u32,
            h: u32,
        });
        assert_eq!(std::mem::size_of::<Eight>(), 32);
    }

    #[test]
    fn uniform_bytes_follow_field_order() {
        gpu_uniforms!(Pair, 2, { x: u32, y: f32 });
        let value = Pair {
            x: 7,
            y: 1.5,
            __padding: [0; 2],
        };
        let bytes = bytemuck::bytes_of(&value);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.5f32.to_le_bytes());
    }
}
