use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Func, VarBuilder};
use candle_transformers::models::resnet;
use log::info;
use ort::{inputs, CPUExecutionProvider, GraphOptimizationLevel, Session, TensorElementType, ValueType};

use crate::config::ModelConfig;
use crate::preprocessing::{CanonicalTensor, IMAGE_INPUT_SIZE};

/// A pretrained convolutional backbone with its classification layer removed.
///
/// Implementations are read-only after construction; `embed()` takes `&self`
/// and may be called from many request workers at once.
pub trait EmbeddingModel: Send + Sync
{
    /// Length of the vectors returned by `embed()`.
    fn dimension(&self) -> usize;

    /// Runs the forward pass on one canonical image tensor and returns the
    /// raw (unnormalized) penultimate-layer activations.
    fn embed(&self, input: &CanonicalTensor) -> anyhow::Result<Vec<f64>>;

    fn name(&self) -> &'static str;
}

pub type ModelHandle = Arc<dyn EmbeddingModel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend
{
    /// An ONNX export of the backbone, run with ONNX Runtime.
    Onnx,
    /// ResNet-50 safetensors weights, run with candle.
    Candle,
}

impl Backend
{
    pub fn for_path(path: &Path) -> Option<Backend>
    {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "onnx" => Some(Backend::Onnx),
            "safetensors" => Some(Backend::Candle),
            _ => None,
        }
    }
}

/// Materializes the backbone described by `config`. This is the heavy,
/// one-time step guarded by `state::ModelProvider`.
pub fn load_model(config: &ModelConfig) -> anyhow::Result<ModelHandle>
{
    if !config.path.is_file() {
        bail!("Model weights not found at {:?}", config.path);
    }

    let backend = config.backend
        .or_else(|| Backend::for_path(&config.path))
        .ok_or(anyhow!("Unable to infer a backend from {:?}; pass --backend", config.path))?;

    let model: ModelHandle = match backend {
        Backend::Onnx => Arc::new(OnnxResNet::new(config)?),
        Backend::Candle => Arc::new(CandleResNet::new(&config.path, config.embedding_dim)?),
    };

    info!("Loaded {} backbone from {:?} ({} features)", model.name(), config.path, model.dimension());
    Ok(model)
}

/// ResNet-50 without its final fully-connected layer, built with candle.
///
/// Every parameter is materialized as f64 when the safetensors file is mapped,
/// so the whole forward pass runs in double precision. Batch norm layers use
/// their running statistics (evaluation mode); candle tracks no gradients for
/// weights loaded this way.
pub struct CandleResNet
{
    backbone: Func<'static>,
    device: Device,
    dimension: usize,
}

impl CandleResNet
{
    pub fn new(path: &Path, dimension: usize) -> anyhow::Result<Self>
    {
        let device = Device::Cpu;

        // SAFETY: the weights file must not be modified while it is mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F64, &device)? };
        Self::from_var_builder(vb, dimension)
            .with_context(|| format!("Weights in {:?} do not match ResNet-50", path))
    }

    /// Builds the backbone from already-resolved parameters; `vb` decides the dtype.
    pub fn from_var_builder(vb: VarBuilder<'static>, dimension: usize) -> anyhow::Result<Self>
    {
        let device = vb.device().clone();
        let backbone = resnet::resnet50_no_final_layer(vb)?;

        Ok(CandleResNet { backbone, device, dimension })
    }
}

impl EmbeddingModel for CandleResNet
{
    fn dimension(&self) -> usize
    {
        self.dimension
    }

    fn embed(&self, input: &CanonicalTensor) -> anyhow::Result<Vec<f64>>
    {
        let images = Tensor::from_vec(
            input.to_vec(),
            (1, 3, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE),
            &self.device)?;

        let mut features = self.backbone.forward(&images)?;
        if features.dtype() != DType::F64 {
            info!("Widening {:?} backbone output to f64", features.dtype());
            features = features.to_dtype(DType::F64)?;
        }

        Ok(features.flatten_all()?.to_vec1::<f64>()?)
    }

    fn name(&self) -> &'static str
    {
        "candle"
    }
}

/// The backbone as an ONNX graph, executed with ONNX Runtime.
///
/// ONNX Runtime cannot change the precision of weights baked into a graph, so
/// the graph has to be exported from a double-precision model. A graph whose
/// input is not float64 is rejected when the session is built rather than
/// silently feeding it narrowed data.
pub struct OnnxResNet
{
    session: Session,
    output_name: String,
    dimension: usize,
}

impl OnnxResNet
{
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self>
    {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .commit_from_file(&config.path)?;

        let input = session.inputs.first().ok_or(anyhow!("ONNX graph has no inputs"))?;
        match &input.input_type {
            ValueType::Tensor { ty: TensorElementType::Float64, .. } => {},
            other => bail!(
                "ONNX input {:?} has type {:?}; export the backbone with float64 parameters",
                input.name,
                other),
        }

        let output_name = match &config.onnx_output {
            Some(name) => {
                if !session.outputs.iter().any(|output| &output.name == name) {
                    bail!("ONNX graph has no output named {:?}", name);
                }
                name.clone()
            },
            None => session.outputs.first().ok_or(anyhow!("ONNX graph has no outputs"))?.name.clone(),
        };

        Ok(OnnxResNet { session, output_name, dimension: config.embedding_dim })
    }
}

impl EmbeddingModel for OnnxResNet
{
    fn dimension(&self) -> usize
    {
        self.dimension
    }

    fn embed(&self, input: &CanonicalTensor) -> anyhow::Result<Vec<f64>>
    {
        let outputs = self.session.run(inputs![input.view().to_owned()]?)?;
        let output = &outputs[self.output_name.as_str()];

        // Typically (1, 2048, 1, 1) straight out of the pooling layer.
        let features: Vec<f64> = match output.try_extract_tensor::<f64>() {
            Ok(tensor) => tensor.iter().copied().collect(),
            Err(_) => {
                let tensor = output.try_extract_tensor::<f32>()?;
                info!("Widening f32 ONNX output {:?} to f64", self.output_name);
                tensor.iter().map(|&value| value as f64).collect()
            }
        };

        Ok(features)
    }

    fn name(&self) -> &'static str
    {
        "onnx"
    }
}

#[cfg(test)]
mod tests
{
    use std::path::PathBuf;

    use image::RgbImage;

    use super::*;
    use crate::preprocessing::{Preprocessor, FEATURE_VECTOR_LENGTH};

    fn config_for(path: PathBuf) -> ModelConfig
    {
        ModelConfig {
            path,
            backend: None,
            embedding_dim: 2048,
            intra_threads: 1,
            onnx_output: None,
        }
    }

    #[test]
    fn backend_is_inferred_from_extension()
    {
        assert_eq!(Backend::for_path(Path::new("models/resnet50.onnx")), Some(Backend::Onnx));
        assert_eq!(Backend::for_path(Path::new("models/RESNET50.SafeTensors")), Some(Backend::Candle));
        assert_eq!(Backend::for_path(Path::new("models/resnet50.pth")), None);
        assert_eq!(Backend::for_path(Path::new("models/resnet50")), None);
    }

    #[test]
    fn missing_weights_fail_to_load()
    {
        let dir = tempfile::tempdir().unwrap();
        let result = load_model(&config_for(dir.path().join("absent.safetensors")));
        let message = result.err().unwrap().to_string();
        assert!(message.contains("not found"), "{}", message);
    }

    #[test]
    fn unknown_extension_requires_explicit_backend()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        std::fs::write(&path, b"not a model").unwrap();

        let message = load_model(&config_for(path)).err().unwrap().to_string();
        assert!(message.contains("--backend"), "{}", message);
    }

    #[test]
    fn garbage_safetensors_fail_to_load()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        assert!(load_model(&config_for(path)).is_err());
    }

    #[test]
    fn candle_backbone_without_classifier_yields_f64_features()
    {
        let vb = VarBuilder::zeros(DType::F64, &Device::Cpu);
        let model = CandleResNet::from_var_builder(vb, FEATURE_VECTOR_LENGTH).unwrap();
        let input = Preprocessor.preprocess(&RgbImage::new(300, 200)).unwrap();

        let images = Tensor::from_vec(input.to_vec(), (1, 3, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE), &Device::Cpu).unwrap();
        let pooled = model.backbone.forward(&images).unwrap();
        assert_eq!(pooled.dtype(), DType::F64);
        assert_eq!(pooled.dims(), &[1, FEATURE_VECTOR_LENGTH]);

        let features = model.embed(&input).unwrap();
        assert_eq!(features.len(), model.dimension());
        assert!(features.iter().all(|v| v.is_finite()));
    }
}
