use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use log::{error, info, warn};
use ndarray::Array1;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::decode::{DecodePath, DecodeStrategy, FallbackDecoder, HeaderInfo, PrimaryDecoder};
use crate::error::{Error, Result};
use crate::preprocessing::CanonicalTensor;
use crate::state::ModelProvider;

/// An L2-normalized, double-precision embedding.
/// Only constructed through `l2_normalized()`, so its norm is always 1 (within rounding).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Array1<f64>);

impl FeatureVector
{
    /// Divides `raw` by its Euclidean norm. A zero or non-finite norm has no
    /// direction and is an inference error.
    pub fn l2_normalized(raw: Vec<f64>) -> Result<Self>
    {
        let mut features = Array1::from_vec(raw);
        let norm = features.dot(&features).sqrt();
        if norm == 0.0 {
            return Err(Error::Inference("Feature vector has zero norm".to_string()));
        }
        if !norm.is_finite() {
            return Err(Error::Inference(format!("Feature vector norm is {}", norm)));
        }
        features /= norm;

        Ok(FeatureVector(features))
    }

    #[cfg(test)]
    pub(crate) fn from_raw_unchecked(values: Vec<f64>) -> Self
    {
        FeatureVector(Array1::from_vec(values))
    }

    pub fn len(&self) -> usize
    {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64>
    {
        self.0.iter()
    }

    pub fn norm(&self) -> f64
    {
        self.0.dot(&self.0).sqrt()
    }

    pub fn to_vec(&self) -> Vec<f64>
    {
        self.0.to_vec()
    }
}

#[derive(Debug, Clone)]
pub struct Extraction
{
    pub features: FeatureVector,
    pub decode_path: DecodePath,
}

/// Runs decode -> preprocess -> forward pass -> normalize for one image.
///
/// The primary strategy is always tried first. The fallback runs only when the
/// primary fails, and its result is logged as such: the fallback resizes
/// straight to 224x224 while the primary resizes and center-crops, so the two
/// paths give different vectors for the same image.
pub struct Extractor
{
    provider: Arc<ModelProvider>,
    primary: Box<dyn DecodeStrategy>,
    fallback: Box<dyn DecodeStrategy>,
}

impl Extractor
{
    pub fn new(provider: Arc<ModelProvider>) -> Self
    {
        Self::with_strategies(provider, Box::new(PrimaryDecoder::default()), Box::new(FallbackDecoder))
    }

    pub fn with_strategies(
        provider: Arc<ModelProvider>,
        primary: Box<dyn DecodeStrategy>,
        fallback: Box<dyn DecodeStrategy>,
    ) -> Self
    {
        Extractor { provider, primary, fallback }
    }

    pub fn provider(&self) -> &ModelProvider
    {
        &self.provider
    }

    pub fn extract(&self, image_path: &Path) -> Result<Extraction>
    {
        let now = Instant::now();
        let bytes = read_image(image_path)?;
        let model = self.provider.ensure_ready()?;

        let (tensor, decode_path) = self.decode(&bytes)?;

        let raw = model.embed(&tensor)
            .map_err(|e| Error::Inference(format!("{:#}", e)))?;
        if raw.len() != model.dimension() {
            return Err(Error::Inference(format!(
                "Model returned {} features, expected {}", raw.len(), model.dimension())));
        }

        let features = FeatureVector::l2_normalized(raw)?;
        info!("Extracted {} features from {:?} via {} path in {:?}",
            features.len(), image_path, decode_path, now.elapsed());

        Ok(Extraction { features, decode_path })
    }

    /// Extracts each image independently and in parallel.
    /// One failure does not affect the other results.
    pub fn extract_batch(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<Extraction>)>
    {
        paths.par_iter()
            .map(|path| (path.clone(), self.extract(path)))
            .collect()
    }

    fn decode(&self, bytes: &[u8]) -> Result<(CanonicalTensor, DecodePath)>
    {
        let primary_error = match load_guarded(self.primary.as_ref(), bytes) {
            Ok(tensor) => return Ok((tensor, DecodePath::Primary)),
            Err(e) => e,
        };
        error!("Primary decoder ({}) failed: {:#}", self.primary.name(), primary_error);
        info!("Trying fallback decoder ({})", self.fallback.name());

        match load_guarded(self.fallback.as_ref(), bytes) {
            Ok(tensor) => {
                warn!("Using fallback decode path; features are not comparable with primary-path features");
                Ok((tensor, DecodePath::Fallback))
            },
            Err(fallback_error) => Err(Error::Decode(format!(
                "{}: {:#}; {}: {:#}",
                self.primary.name(), primary_error,
                self.fallback.name(), fallback_error))),
        }
    }
}

/// A codec that panics on malformed data counts as a failed decode.
fn load_guarded(strategy: &dyn DecodeStrategy, bytes: &[u8]) -> anyhow::Result<CanonicalTensor>
{
    panic::catch_unwind(AssertUnwindSafe(|| strategy.load(bytes)))
        .unwrap_or_else(|payload| Err(anyhow!("{} decoder panicked: {}", strategy.name(), panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str
{
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Reads the whole file. Missing or unreadable paths are NotFound; an empty
/// file is a validation error. The declared extension is ignored.
fn read_image(path: &Path) -> Result<Vec<u8>>
{
    let display = path.display().to_string();

    let metadata = fs::metadata(path).map_err(|_| Error::NotFound(display.clone()))?;
    if !metadata.is_file() {
        return Err(Error::NotFound(format!("{} is not a file", display)));
    }
    if metadata.len() == 0 {
        return Err(Error::Validation(format!("Image file is empty: {}", display)));
    }

    let bytes = fs::read(path).map_err(|e| Error::NotFound(format!("{} ({})", display, e)))?;
    if bytes.is_empty() {
        return Err(Error::Validation(format!("Image file is empty: {}", display)));
    }

    info!("Processing image: {} ({} bytes)", display, bytes.len());
    HeaderInfo::inspect(&bytes).log();

    Ok(bytes)
}
