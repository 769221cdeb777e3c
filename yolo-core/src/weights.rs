//! Safetensors weight loading.
//!
//! Weight files are memory-mapped, parsed with the `safetensors` crate and
//! converted to host `f32` tensors. Half precision, bfloat16 and f64 payloads
//! are widened/narrowed on load so every downstream consumer sees `f32`.

use std::{collections::HashMap, fs::File, path::Path};

use anyhow::{Context, Result, bail};
use half::{bf16, f16};
use log::debug;
use memmap2::MmapOptions;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

/// Host-side tensor read from a weight file.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl WeightTensor {
    /// Build a tensor, checking that `data` matches the element count of `dims`.
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        anyhow::ensure!(
            expected == data.len(),
            "tensor shape {dims:?} expects {expected} values, got {}",
            data.len()
        );
        Ok(Self { dims, data })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Named collection of weight tensors.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: HashMap<String, WeightTensor>,
}

impl WeightStore {
    /// Load tensors from a `.safetensors` file.
    ///
    /// With `names = None` every floating point tensor is loaded and integer
    /// tensors (such as `num_batches_tracked`) are skipped. With an explicit
    /// list each name must exist and hold floating point data.
    pub fn load<P: AsRef<Path>>(path: P, names: Option<&[&str]>) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.exists(), "weights file not found: {}", path.display());

        let file = File::open(path)
            .with_context(|| format!("failed to open weights file {}", path.display()))?;
        // SAFETY: the map is read-only and does not outlive this call; the
        // parsed tensors are copied into owned buffers before it is dropped.
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("failed to memory-map {}", path.display()))?;

        Self::from_bytes(&mmap, names).with_context(|| format!("while loading {}", path.display()))
    }

    /// Parse an in-memory safetensors payload.
    pub fn from_bytes(bytes: &[u8], names: Option<&[&str]>) -> Result<Self> {
        let parsed = SafeTensors::deserialize(bytes).context("failed to parse safetensors header")?;
        let mut tensors = HashMap::new();

        match names {
            Some(names) => {
                for &name in names {
                    let view = parsed
                        .tensor(name)
                        .with_context(|| format!("tensor '{name}' missing from weights"))?;
                    tensors.insert(name.to_string(), convert(name, &view)?);
                }
            }
            None => {
                for (name, view) in parsed.tensors() {
                    if !is_float(view.dtype()) {
                        debug!("skipping non-float tensor '{name}' ({:?})", view.dtype());
                        continue;
                    }
                    let tensor = convert(&name, &view)?;
                    tensors.insert(name, tensor);
                }
            }
        }

        Ok(Self { tensors })
    }

    /// Build a store from already materialized tensors.
    pub fn from_tensors<I>(tensors: I) -> Self
    where
        I: IntoIterator<Item = (String, WeightTensor)>,
    {
        Self {
            tensors: tensors.into_iter().collect(),
        }
    }

    /// Look up a tensor by name.
    pub fn tensor(&self, name: &str) -> Result<&WeightTensor> {
        self.tensors
            .get(name)
            .with_context(|| format!("tensor '{name}' missing from weights"))
    }

    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: WeightTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Total size of the stored `f32` data in bytes.
    pub fn total_bytes(&self) -> usize {
        self.tensors
            .values()
            .map(|tensor| tensor.data.len() * std::mem::size_of::<f32>())
            .sum()
    }

    /// Serialize every tensor as `F32` into a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes: Vec<(&str, Vec<u8>, &[usize])> = self
            .names()
            .into_iter()
            .filter_map(|name| {
                let tensor = self.tensors.get(name)?;
                let raw = tensor.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                Some((name, raw, tensor.dims.as_slice()))
            })
            .collect();

        let views = bytes
            .iter()
            .map(|(name, raw, dims)| {
                TensorView::new(Dtype::F32, dims.to_vec(), raw)
                    .map(|view| (*name, view))
                    .with_context(|| format!("invalid tensor '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::serialize_to_file(views, &None, path)
            .with_context(|| format!("failed to write weights file {}", path.display()))
    }

    /// Deterministic pseudo-random weights for the given tensor names and shapes.
    ///
    /// Convolution kernels are scaled by `1/sqrt(fan_in)` and batchnorm
    /// statistics stay close to identity, so activations remain bounded
    /// through deep stacks. Used by smoke tests, benches and the CLI tests.
    pub fn synthetic<'a, I>(specs: I, seed: u64) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [usize])>,
    {
        let mut rng = SplitMix64(seed);
        let mut tensors = HashMap::new();
        for (name, dims) in specs {
            let len: usize = dims.iter().product();
            let fan_in: usize = dims.iter().skip(1).product::<usize>().max(1);
            let scale = 1.0 / (fan_in as f32).sqrt();
            let data: Vec<f32> = (0..len)
                .map(|_| {
                    let unit = rng.next_unit();
                    if name.ends_with("running_var") {
                        0.5 + unit.abs()
                    } else if name.ends_with("bn.weight") {
                        1.0 + 0.1 * unit
                    } else if name.ends_with("bias") || name.ends_with("running_mean") {
                        0.1 * unit
                    } else {
                        unit * scale
                    }
                })
                .collect();
            tensors.insert(
                name.to_string(),
                WeightTensor {
                    dims: dims.to_vec(),
                    data,
                },
            );
        }
        Self { tensors }
    }
}

fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F32 | Dtype::F16 | Dtype::BF16 | Dtype::F64)
}

fn convert(name: &str, view: &TensorView<'_>) -> Result<WeightTensor> {
    let bytes = view.data();
    let data: Vec<f32> = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                f64::from_le_bytes(raw) as f32
            })
            .collect(),
        other => bail!("tensor '{name}' has unsupported dtype {other:?}"),
    };
    WeightTensor::new(view.shape().to_vec(), data).with_context(|| format!("tensor '{name}'"))
}

/// Small deterministic generator; quality only needs to beat a constant.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform value in `[-1, 1)`.
    fn next_unit(&mut self) -> f32 {
        let bits = (self.next_u64() >> 40) as u32;
        bits as f32 / (1u32 << 23) as f32 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_safetensors(entries: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) -> NamedTempFile {
        let file = NamedTempFile::new().expect("tempfile");
        let views: Vec<(&str, TensorView<'_>)> = entries
            .iter()
            .map(|(name, dtype, dims, raw)| {
                (*name, TensorView::new(*dtype, dims.clone(), raw).unwrap())
            })
            .collect();
        safetensors::serialize_to_file(views, &None, file.path()).expect("serialize");
        file
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn loads_all_float_tensors_and_skips_integers() {
        let half: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        let file = write_safetensors(&[
            ("a.weight", Dtype::F32, vec![2, 2], f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
            ("a.bias", Dtype::F16, vec![2], half),
            ("a.num_batches_tracked", Dtype::I64, vec![1], 7i64.to_le_bytes().to_vec()),
        ]);

        let store = WeightStore::load(file.path(), None).expect("load");
        assert_eq!(store.len(), 2);
        assert_eq!(store.names(), vec!["a.bias", "a.weight"]);
        assert_eq!(store.tensor("a.weight").unwrap().dims(), &[2, 2]);
        assert_eq!(store.tensor("a.bias").unwrap().data(), &[1.5, -2.0]);
        assert_eq!(store.total_bytes(), 6 * 4);
    }

    #[test]
    fn explicit_names_must_exist() {
        let file = write_safetensors(&[("x", Dtype::F32, vec![1], f32_bytes(&[0.5]))]);
        let store = WeightStore::load(file.path(), Some(&["x"])).expect("load");
        assert_eq!(store.len(), 1);

        let err = WeightStore::load(file.path(), Some(&["x", "y"])).unwrap_err();
        assert!(format!("{err:#}").contains("tensor 'y' missing"));
    }

    #[test]
    fn explicit_integer_tensor_is_rejected() {
        let file =
            write_safetensors(&[("steps", Dtype::I64, vec![1], 1i64.to_le_bytes().to_vec())]);
        let err = WeightStore::load(file.path(), Some(&["steps"])).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported dtype"));
    }

    #[test]
    fn bfloat16_is_widened() {
        let raw: Vec<u8> = [0.25f32, 8.0]
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect();
        let file = write_safetensors(&[("t", Dtype::BF16, vec![2], raw)]);
        let store = WeightStore::load(file.path(), None).unwrap();
        assert_eq!(store.tensor("t").unwrap().data(), &[0.25, 8.0]);
    }

    #[test]
    fn missing_file_and_garbage_are_errors() {
        let err = WeightStore::load("no/such/weights.safetensors", None).unwrap_err();
        assert!(err.to_string().contains("weights file not found"));

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"definitely not safetensors").unwrap();
        let err = WeightStore::load(file.path(), None).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse safetensors"));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let mut store = WeightStore::default();
        store.insert(
            "layer.weight",
            WeightTensor::new(vec![1, 3], vec![0.1, 0.2, 0.3]).unwrap(),
        );
        let file = NamedTempFile::new().unwrap();
        store.save(file.path()).expect("save");

        let loaded = WeightStore::load(file.path(), None).expect("reload");
        assert_eq!(loaded.tensor("layer.weight").unwrap(), store.tensor("layer.weight").unwrap());
    }

    #[test]
    fn synthetic_weights_are_deterministic_and_well_formed() {
        let dims = [4usize, 2, 3, 3];
        let var = [4usize];
        let specs = [("c.conv.weight", &dims[..]), ("c.bn.running_var", &var[..])];
        let a = WeightStore::synthetic(specs, 7);
        let b = WeightStore::synthetic(specs, 7);
        assert_eq!(a.tensor("c.conv.weight").unwrap(), b.tensor("c.conv.weight").unwrap());
        assert!(a.tensor("c.bn.running_var").unwrap().data().iter().all(|v| *v >= 0.5));
        assert!(a.tensor("c.conv.weight").unwrap().data().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn tensor_shape_mismatch_is_rejected() {
        assert!(WeightTensor::new(vec![2, 2], vec![1.0; 3]).is_err());
    }
}
