use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use feature_extractor::config::{Cli, Command, ServeConfig};
use feature_extractor::extractor::Extractor;
use feature_extractor::serialize::serialize;
use feature_extractor::service::{self, AppState, ExtractResponse};
use feature_extractor::state::ModelProvider;
use log::error;
use log::info;
use log::LevelFilter;

#[cfg(debug_assertions)]
const LOG_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
const LOG_LEVEL: LevelFilter = LevelFilter::Info;


fn main() -> anyhow::Result<()> {
    // RUST_LOG, when set, takes precedence over LOG_LEVEL.
    env_logger::Builder::new()
        .filter_level(LOG_LEVEL)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let provider = Arc::new(ModelProvider::from_config(cli.model.clone()));
    let extractor = Arc::new(Extractor::new(provider));

    match cli.command.unwrap_or(Command::Serve(ServeConfig::default())) {
        Command::Serve(serve) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(serve_forever(extractor, serve))
        },
        Command::Extract { paths } => extract_to_stdout(&extractor, &paths),
    }
}

async fn serve_forever(extractor: Arc<Extractor>, config: ServeConfig) -> anyhow::Result<()> {
    info!("Starting feature extraction service...");

    // Requests that arrive while this is running wait on the same load.
    // A failure here is only logged; the first /extract request tries again.
    if !config.lazy {
        let preload = extractor.clone();
        tokio::task::spawn_blocking(move || {
            match preload.provider().ensure_ready() {
                Ok(_) => info!("Model pre-loaded successfully"),
                Err(e) => error!("Model pre-loading failed: {}", e),
            }
        });
    }

    let state = Arc::new(AppState { extractor });
    service::run_server(state, &config.host, config.port).await
}

fn extract_to_stdout(extractor: &Extractor, paths: &[PathBuf]) -> anyhow::Result<()> {
    let results = extractor.extract_batch(paths);

    let mut failures = 0;
    for (path, result) in results {
        let body = match result {
            Ok(extraction) => serde_json::to_value(ExtractResponse {
                success: true,
                feature_values: serialize(&extraction.features).values,
            })?,
            Err(e) => {
                failures += 1;
                error!("{:?}: {}", path, e);
                serde_json::json!({ "success": false, "error": e.to_string() })
            }
        };
        println!("{}", serde_json::json!({ "image_path": path, "response": body }));
    }

    if failures > 0 {
        anyhow::bail!("{} of {} extractions failed", failures, paths.len());
    }
    Ok(())
}
