use std::{borrow::Cow, fmt, path::Path, sync::Arc};

use anyhow::{Context, Result};
use log::debug;
use ndarray::{Array2, Array4};

use crate::{
    cpu::CpuExecutor,
    graph::{Graph, LayerParams},
    preprocess::InputSize,
    variant::{ModelVariant, detect_num_classes},
    weights::WeightStore,
};

/// A YOLOv8 network ready to run: the expanded graph plus folded parameters.
///
/// Backends share the graph and parameters through `Arc`s, so building a CPU
/// and a GPU backend from one model costs a single load.
#[derive(Debug, Clone)]
pub struct YoloModel {
    input_size: InputSize,
    graph: Arc<Graph>,
    params: Arc<Vec<LayerParams>>,
}

impl YoloModel {
    /// Load a `.safetensors` checkpoint for a specific input size.
    ///
    /// # Arguments
    ///
    /// * `model_path` - Path to the weight file.
    /// * `variant` - Model scale; detected from the stem convolution when `None`.
    /// * `input_size` - Network input resolution, a multiple of 32 on both sides.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        variant: Option<ModelVariant>,
        input_size: InputSize,
    ) -> Result<Self> {
        let path = model_path.as_ref();
        anyhow::ensure!(path.exists(), "model file not found: {}", path.display());
        let store = WeightStore::load(path, None)?;
        debug!(
            "loaded {} tensors ({:.1} MiB) from {}",
            store.len(),
            store.total_bytes() as f64 / (1024.0 * 1024.0),
            path.display()
        );
        Self::from_store(&store, variant, input_size)
            .with_context(|| format!("failed to build YOLOv8 model from {}", path.display()))
    }

    /// Build a model from weights already in memory.
    pub fn from_store(
        store: &WeightStore,
        variant: Option<ModelVariant>,
        input_size: InputSize,
    ) -> Result<Self> {
        input_size.validate()?;
        let variant = match variant {
            Some(variant) => variant,
            None => ModelVariant::detect(store)?,
        };
        let num_classes = detect_num_classes(store)?;
        let graph = Graph::yolov8(
            variant,
            num_classes,
            input_size.width as usize,
            input_size.height as usize,
        )?;
        let params = graph.fold_parameters(store)?;
        debug!(
            "{variant} with {num_classes} classes at {}x{}: {} nodes, {} layers",
            input_size.width,
            input_size.height,
            graph.nodes().len(),
            params.len()
        );
        Ok(Self {
            input_size,
            graph: Arc::new(graph),
            params: Arc::new(params),
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.graph.variant()
    }

    pub fn num_classes(&self) -> usize {
        self.graph.num_classes()
    }

    pub fn input_size(&self) -> InputSize {
        self.input_size
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn params(&self) -> &Arc<Vec<LayerParams>> {
        &self.params
    }

    /// Bytes of folded weights and biases.
    pub fn parameter_bytes(&self) -> u64 {
        self.params
            .iter()
            .map(|layer| {
                ((layer.weight.len() + layer.bias.len()) * std::mem::size_of::<f32>()) as u64
            })
            .sum()
    }
}

/// Something that can run the network on a preprocessed tensor.
pub trait DetectionBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs and reports.
    fn name(&self) -> &'static str;

    /// Run `[1, 3, H, W]` through the network, returning `[4 + classes, anchors]`.
    fn run(&self, input: &Array4<f32>) -> Result<Array2<f32>>;
}

/// CPU backend over the reference executor.
#[derive(Debug)]
pub struct CpuYolo {
    executor: CpuExecutor,
}

impl CpuYolo {
    pub fn new(model: &YoloModel) -> Result<Self> {
        Ok(Self {
            executor: CpuExecutor::new(model.graph().clone(), model.params().clone())?,
        })
    }
}

impl DetectionBackend for CpuYolo {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn run(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let graph = self.executor.graph();
        let data = input_slice(graph, input)?;
        let output = self.executor.run(&data)?;
        output_matrix(graph, output)
    }
}

/// Flatten `input` after checking it matches the graph input.
pub(crate) fn input_slice<'a>(graph: &Graph, input: &'a Array4<f32>) -> Result<Cow<'a, [f32]>> {
    let expected = graph.input_dims();
    anyhow::ensure!(
        input.shape() == expected,
        "input tensor has shape {:?}, model expects {expected:?}",
        input.shape()
    );
    Ok(match input.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(input.iter().copied().collect()),
    })
}

/// Reshape the flat head output into `[4 + classes, anchors]`.
pub(crate) fn output_matrix(graph: &Graph, data: Vec<f32>) -> Result<Array2<f32>> {
    let [_, rows, anchors, _] = graph.output_dims();
    Array2::from_shape_vec((rows, anchors), data).context("head output has an unexpected size")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn synthetic_store(classes: usize) -> WeightStore {
        let graph = Graph::yolov8(ModelVariant::Nano, classes, 64, 64).unwrap();
        let specs = graph.required_tensors();
        WeightStore::synthetic(specs.iter().map(|(n, d)| (n.as_str(), d.as_slice())), 11)
    }

    #[test]
    fn detects_variant_and_classes() {
        let model =
            YoloModel::from_store(&synthetic_store(3), None, InputSize::new(64, 64)).unwrap();
        assert_eq!(model.variant(), ModelVariant::Nano);
        assert_eq!(model.num_classes(), 3);
        assert_eq!(model.graph().output_dims(), [1, 7, 84, 1]);
        assert!(model.parameter_bytes() > 0);
    }

    #[test]
    fn rejects_unaligned_input() {
        let err = YoloModel::from_store(&synthetic_store(3), None, InputSize::new(60, 64))
            .unwrap_err();
        assert!(err.to_string().contains("multiple of 32"));
    }

    #[test]
    fn mismatched_variant_fails_on_shapes() {
        let err = YoloModel::from_store(
            &synthetic_store(3),
            Some(ModelVariant::Small),
            InputSize::new(64, 64),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("net.b1.0"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        let err = YoloModel::load(dir.path().join("absent.safetensors"), None, InputSize::default())
            .unwrap_err();
        assert!(err.to_string().contains("model file not found"));
    }

    #[test]
    fn cpu_backend_produces_head_matrix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        synthetic_store(2).save(&path).unwrap();

        let model = YoloModel::load(&path, None, InputSize::new(64, 64)).unwrap();
        let backend = CpuYolo::new(&model).unwrap();
        let input = Array4::from_elem((1, 3, 64, 64), 0.5f32);
        let output = backend.run(&input).unwrap();
        assert_eq!(output.dim(), (6, 84));
        assert!(output.iter().all(|v| v.is_finite()));
        // Class rows hold sigmoid scores.
        assert!(output.rows().into_iter().skip(4).flatten().all(|v| (0.0..=1.0).contains(v)));

        let wrong = Array4::zeros((1, 3, 32, 32));
        assert!(backend.run(&wrong).is_err());
    }
}
