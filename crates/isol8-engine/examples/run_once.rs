//! Boots a `LocalEngine` with no network access and runs one `execute()`
//! call, printing the `ExecutionResult` as JSON.
//!
//! This is not the CLI front-end described in `spec.md` §1 — argument
//! parsing, progress spinners, and human-readable formatting remain an
//! external collaborator. It exists purely to exercise the library the way
//! `sisyphus`'s `main.rs` exercises its compiler service.

use std::sync::Arc;

use isol8_engine::config::EngineConfig;
use isol8_engine::execution::ExecutionRequest;
use isol8_engine::host::DockerHost;
use isol8_engine::{Engine, LocalEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "isol8_engine=info".into()),
        )
        .init();

    let host = Arc::new(DockerHost::connect_local()?);
    let config = EngineConfig::default();
    let engine = LocalEngine::new(host, config)?;

    engine.start(Default::default()).await?;

    let request = ExecutionRequest {
        runtime: Some(isol8_common::Runtime::Python),
        code: Some("print(1 + 1)".to_string()),
        ..Default::default()
    };

    let result = engine.execute(request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    engine.stop().await?;
    Ok(())
}
