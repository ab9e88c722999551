//! Runtime assembly from configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use chat_runtime::rate_limit::UserType;
//! use chat_runtime::service::{bootstrap::build_runtime, ChatRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = build_runtime(Some("config/runtime")).await?;
//!
//!     let request = ChatRequest::new("user-1", UserType::Regular, "conv-1", "gpt-4o", "Hello!");
//!     let reply = runtime.generate_fast_response(request).await?;
//!     println!("{}", reply.text);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use super::ChatRuntime;
use crate::backend::{LlmBackend, OpenAiCompatibleBackend};
use crate::config::RuntimeConfig;
use crate::telemetry::init_tracing;
use anyhow::Context;
use std::sync::Arc;

/// Load configuration, install logging and start a runtime backed by an
/// OpenAI-compatible endpoint
pub async fn build_runtime(config_path: Option<&str>) -> anyhow::Result<Arc<ChatRuntime>> {
    let config = RuntimeConfig::load(config_path).context("failed to load runtime configuration")?;

    if let Err(e) = init_tracing(&config.logging) {
        // A host application may already own the subscriber
        eprintln!("tracing not installed: {}", e);
    }

    let backend: Arc<dyn LlmBackend> = Arc::new(
        OpenAiCompatibleBackend::new(config.backend.clone()).context("failed to create backend client")?,
    );

    build_runtime_with(config, backend)
}

/// Start a runtime around an existing backend
pub fn build_runtime_with(config: RuntimeConfig, backend: Arc<dyn LlmBackend>) -> anyhow::Result<Arc<ChatRuntime>> {
    let runtime = Arc::new(ChatRuntime::new(config, backend).context("failed to build chat runtime")?);
    runtime.start();

    tracing::info!(
        base_url = %runtime.config().backend.base_url,
        "Chat runtime ready"
    );
    Ok(runtime)
}
