//! TGI Gateway
//!
//! An OpenAI-compatible front end for Text Generation Inference. Chat
//! requests are rendered through a prompt template and forwarded to TGI's
//! native API (or passed through to an OpenAI-compatible server), with
//! validation, stop-sequence handling and cancellation done in the gateway.

mod api;
mod conversion;
mod core;
mod models;
mod pipeline;

use crate::api::endpoints::{AppState, create_router};
use crate::core::backend::{Backend, BackendType};
use crate::core::backends::{OpenAIBackend, TgiBackend};
use crate::core::config::Config;
use crate::core::logging::init_logging;
use crate::core::requests::RequestRegistry;
use crate::core::retry::RetryPolicy;
use crate::pipeline::TextGenerationPipeline;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Check for --help flag
    if std::env::args().any(|arg| arg == "--help") {
        print_help();
        return;
    }

    dotenv::dotenv().ok();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Configuration Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config.log_level);

    // Print startup banner
    print_startup_banner(&config);

    let registry = Arc::new(RequestRegistry::new());

    let backend = match build_backend(&config, registry.clone()) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to create backend: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("Using backend: {}", backend.backend_name());

    let pipeline = Arc::new(TextGenerationPipeline::new(
        backend,
        config.limits,
        config.model_id.clone(),
        config.served_model.clone(),
    ));

    // Create application state
    let app_state = AppState {
        config: config.clone(),
        pipeline,
        registry,
    };

    // Create router
    let app = create_router(app_state);

    // Bind to address
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Server stopped");
}

fn build_backend(
    config: &Config,
    registry: Arc<RequestRegistry>,
) -> anyhow::Result<Arc<dyn Backend>> {
    let retry = RetryPolicy::with_max_retries(config.max_retries);

    let backend: Arc<dyn Backend> = match config.backend {
        BackendType::Tgi => Arc::new(TgiBackend::new(
            config.backend_url.clone(),
            config.backend_api_key.clone(),
            config.chat_template,
            config.request_timeout,
            registry,
            retry,
        )?),
        BackendType::OpenAI => Arc::new(OpenAIBackend::new(
            config.backend_api_key.clone().unwrap_or_default(),
            config.backend_url.clone(),
            config.served_model.clone(),
            config.request_timeout,
            registry,
            retry,
        )?),
    };
    Ok(backend)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, draining connections"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

/// Print startup banner with configuration
fn print_startup_banner(config: &Config) {
    println!("🚀 TGI Gateway v{}", env!("CARGO_PKG_VERSION"));
    println!("✅ Configuration loaded successfully");
    println!("   Backend: {:?}", config.backend);
    println!("   Backend URL: {}", config.backend_url);
    println!("   Model: {}", config.model_id);
    if config.served_model != config.model_id {
        println!("   Served Model: {}", config.served_model);
    }
    println!("   Chat Template: {}", config.chat_template.name());
    println!(
        "   Max Tokens: default {}, range {}..={}",
        config.limits.default_max_tokens, config.limits.min_tokens, config.limits.max_tokens
    );
    println!("   Request Timeout: {}s", config.request_timeout);
    println!("   Max Retries: {}", config.max_retries);
    println!("   Server: {}:{}", config.host, config.port);
    println!(
        "   Client API Key Validation: {}",
        if config.client_api_key.is_some() {
            "Enabled"
        } else {
            "Disabled"
        }
    );
    println!();
}

/// Print help message
fn print_help() {
    println!("TGI Gateway v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: tgi-gateway [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --help    Display this help message");
    println!();
    println!("Environment variables:");
    println!("  CONFIG_PATH - Path to the TOML configuration file (default: config.toml)");
    println!("  RUST_LOG    - Overrides server.log_level when set");
    println!();
    println!("Configuration file sections:");
    println!("  backend = \"tgi\" | \"openai\"   Backend kind (default: tgi)");
    println!("  [tgi]      base_url, api_token");
    println!("  [openai]   api_key (required), base_url");
    println!("  [model]    id (required), served_model, chat_template");
    println!("  [server]   host, port (default: 3000), log_level, api_key");
    println!("  [request]  default_max_tokens, max_tokens_limit, min_tokens_limit,");
    println!("             max_messages_limit, max_input_chars, request_timeout, max_retries");
    println!();
    println!("Endpoints:");
    println!("  POST /v1/chat/completions       OpenAI-compatible chat (stream or not)");
    println!("  POST /generate                  TGI-style generation");
    println!("  POST /generate_stream           TGI-style token stream");
    println!("  POST /v1/requests/{{id}}/cancel   Cancel an in-flight request");
    println!("  GET  /v1/models, /info, /health");
}
