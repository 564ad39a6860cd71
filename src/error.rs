#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The request or the referenced file is malformed or incomplete.
    #[error("{0}")]
    Validation(String),
    #[error("Image file not found: {0}")]
    NotFound(String),
    /// Both the primary and the fallback decoders rejected the image.
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Feature extraction failed: {0}")]
    Inference(String),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
      S: serde::ser::Serializer,
    {
      serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
