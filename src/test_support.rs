use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::model::{EmbeddingModel, ModelHandle};
use crate::preprocessing::{CanonicalTensor, FEATURE_VECTOR_LENGTH};
use crate::state::ModelProvider;

/// Deterministic stand-in for the pretrained backbone: folds the input tensor
/// into `dimension` buckets and adds a per-bucket offset so the output is
/// never all zeros.
pub struct FakeModel
{
    pub dimension: usize,
}

impl Default for FakeModel
{
    fn default() -> Self
    {
        FakeModel { dimension: FEATURE_VECTOR_LENGTH }
    }
}

impl EmbeddingModel for FakeModel
{
    fn dimension(&self) -> usize
    {
        self.dimension
    }

    fn embed(&self, input: &CanonicalTensor) -> anyhow::Result<Vec<f64>>
    {
        let mut features: Vec<f64> = (0..self.dimension).map(|i| (i + 1) as f64 * 1e-3).collect();
        for (i, value) in input.view().iter().enumerate() {
            features[i % self.dimension] += value;
        }
        Ok(features)
    }

    fn name(&self) -> &'static str
    {
        "fake"
    }
}

/// Always returns the zero vector, whose direction is undefined.
pub struct ZeroModel;

impl EmbeddingModel for ZeroModel
{
    fn dimension(&self) -> usize
    {
        FEATURE_VECTOR_LENGTH
    }

    fn embed(&self, _input: &CanonicalTensor) -> anyhow::Result<Vec<f64>>
    {
        Ok(vec![0.0; FEATURE_VECTOR_LENGTH])
    }

    fn name(&self) -> &'static str
    {
        "zero"
    }
}

pub fn provider_with(model: ModelHandle) -> Arc<ModelProvider>
{
    Arc::new(ModelProvider::new(Box::new(move || -> anyhow::Result<ModelHandle> { Ok(model.clone()) })))
}

pub fn fake_provider() -> Arc<ModelProvider>
{
    provider_with(Arc::new(FakeModel::default()))
}

pub fn failing_provider() -> Arc<ModelProvider>
{
    Arc::new(ModelProvider::new(Box::new(|| -> anyhow::Result<ModelHandle> {
        anyhow::bail!("no weights on this machine")
    })))
}

/// Writes a gradient image of the given size in `format` and returns its path.
pub fn write_image(dir: &Path, name: &str, width: u32, height: u32, format: ImageFormat) -> PathBuf
{
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, ((x + y) % 256) as u8])
    });
    let path = dir.join(name);
    DynamicImage::ImageRgb8(image).save_with_format(&path, format).unwrap();
    path
}
