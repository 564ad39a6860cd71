use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::Backend;
use crate::preprocessing::FEATURE_VECTOR_LENGTH;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Parser)]
#[command(name = "feature-extractor", version, about = "Extract L2-normalized CNN image features")]
pub struct Cli
{
    #[command(flatten)]
    pub model: ModelConfig,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command
{
    /// Serve POST /extract and GET /health
    Serve(ServeConfig),
    /// Extract features for local images and print one JSON response per image
    Extract
    {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ModelConfig
{
    /// Backbone weights: .safetensors (candle) or .onnx (ONNX Runtime)
    #[arg(long = "model", global = true, env = "FEATURE_EXTRACTOR_MODEL", default_value = "models/resnet50.safetensors")]
    pub path: PathBuf,

    /// Overrides the backend inferred from the weights file extension
    #[arg(long, global = true, value_enum, env = "FEATURE_EXTRACTOR_BACKEND")]
    pub backend: Option<Backend>,

    #[arg(long, global = true, default_value_t = FEATURE_VECTOR_LENGTH)]
    pub embedding_dim: usize,

    /// ONNX Runtime intra-op threads
    #[arg(long, global = true, default_value_t = 4)]
    pub intra_threads: usize,

    /// ONNX graph output holding the pooled features (default: first output)
    #[arg(long, global = true)]
    pub onnx_output: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ServeConfig
{
    #[arg(long, env = "FEATURE_EXTRACTOR_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, env = "FEATURE_EXTRACTOR_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Defer loading the model until the first /extract request
    #[arg(long)]
    pub lazy: bool,
}

impl Default for ServeConfig
{
    fn default() -> Self
    {
        ServeConfig { host: DEFAULT_HOST.to_string(), port: DEFAULT_PORT, lazy: false }
    }
}

#[cfg(test)]
mod tests
{
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid()
    {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_uses_defaults()
    {
        let cli = Cli::try_parse_from(["feature-extractor"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.model.embedding_dim, 2048);
        assert_eq!(cli.model.intra_threads, 4);
        assert_eq!(cli.model.backend, None);
    }

    #[test]
    fn serve_flags()
    {
        let cli = Cli::try_parse_from([
            "feature-extractor", "serve", "--host", "0.0.0.0", "--port", "8080", "--lazy",
            "--model", "weights/resnet50.onnx", "--backend", "onnx",
        ]).unwrap();

        match cli.command {
            Some(Command::Serve(serve)) => {
                assert_eq!(serve.host, "0.0.0.0");
                assert_eq!(serve.port, 8080);
                assert!(serve.lazy);
            },
            other => panic!("expected serve, got {:?}", other),
        }
        assert_eq!(cli.model.path, PathBuf::from("weights/resnet50.onnx"));
        assert_eq!(cli.model.backend, Some(Backend::Onnx));
    }

    #[test]
    fn extract_requires_paths()
    {
        assert!(Cli::try_parse_from(["feature-extractor", "extract"]).is_err());

        let cli = Cli::try_parse_from(["feature-extractor", "extract", "a.jpg", "b.png"]).unwrap();
        match cli.command {
            Some(Command::Extract { paths }) => assert_eq!(paths, vec![PathBuf::from("a.jpg"), PathBuf::from("b.png")]),
            other => panic!("expected extract, got {:?}", other),
        }
    }
}
