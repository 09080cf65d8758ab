//! API endpoint handlers
//!
//! This module implements the HTTP endpoints of the gateway: the
//! OpenAI-compatible chat API, the TGI-style generation API, request
//! cancellation, and service metadata.

use crate::api::error::{ApiError, ErrorFormat};
use crate::core::backend::{ChunkStream, TokenStream};
use crate::core::config::Config;
use crate::core::constants::{
    DONE_MARKER, MAX_REQUEST_ID_LEN, REQUEST_ID_HEADER, error_type, id_prefix, object,
};
use crate::core::requests::RequestRegistry;
use crate::models::openai::{ChatCompletionRequest, ModelCard, ModelList};
use crate::models::tgi::GenerateRequest;
use crate::pipeline::TextGenerationPipeline;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<TextGenerationPipeline>,
    pub registry: Arc<RequestRegistry>,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/info", get(info))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/generate", post(generate))
        .route("/generate_stream", post(generate_stream))
        .route("/v1/requests/{id}/cancel", post(cancel_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Validate API key from request headers
fn validate_api_key(headers: &HeaderMap, config: &Config) -> Result<(), ApiError> {
    if config.client_api_key.is_none() {
        return Ok(());
    }

    let client_api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match client_api_key {
        Some(key) if config.validate_client_api_key(key) => Ok(()),
        _ => {
            warn!("Invalid API key provided by client");
            Err(ApiError::unauthorized())
        }
    }
}

fn bad_json(rejection: JsonRejection, format: ErrorFormat) -> ApiError {
    ApiError::new(
        StatusCode::BAD_REQUEST,
        error_type::INVALID_REQUEST,
        rejection.body_text(),
    )
    .with_format(format)
}

fn new_request_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

fn json_event<T: Serialize>(value: &T) -> Event {
    Event::default().json_data(value).unwrap_or_else(|e| {
        error!("Failed to serialize SSE payload: {}", e);
        Event::default().data("{}")
    })
}

/// Take the client's `x-request-id`, or generate one
///
/// A client id must be 1-128 characters of `[A-Za-z0-9._:-]` and must not
/// belong to a request that is still in flight.
fn resolve_request_id(
    headers: &HeaderMap,
    registry: &RequestRegistry,
    prefix: &str,
) -> Result<String, ApiError> {
    let Some(value) = headers.get(REQUEST_ID_HEADER) else {
        return Ok(new_request_id(prefix));
    };

    let id = value
        .to_str()
        .ok()
        .filter(|id| is_valid_request_id(id))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                error_type::INVALID_REQUEST,
                format!(
                    "{} must be 1-{} characters of [A-Za-z0-9._:-]",
                    REQUEST_ID_HEADER, MAX_REQUEST_ID_LEN
                ),
            )
        })?;

    if registry.contains(id) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            error_type::INVALID_REQUEST,
            format!("Request {} is already in flight", id),
        ));
    }
    Ok(id.to_string())
}

fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}

/// Attach the request id header to a response or error
fn with_request_id(result: Result<Response, ApiError>, request_id: &str) -> Response {
    let mut response = result.into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// POST /v1/chat/completions - Create a chat completion
async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config)?;
    let Json(request) = payload.map_err(|e| bad_json(e, ErrorFormat::OpenAI))?;

    let request_id = resolve_request_id(&headers, &state.registry, id_prefix::CHAT)?;
    info!(
        "Incoming chat request {}: model={}, stream={}, messages={}",
        request_id,
        request.model,
        request.stream,
        request.messages.len()
    );
    debug!("Full request payload: {:?}", request);

    let result = serve_chat(&state, request, &request_id).await;
    Ok(with_request_id(result, &request_id))
}

async fn serve_chat(
    state: &AppState,
    request: ChatCompletionRequest,
    request_id: &str,
) -> Result<Response, ApiError> {
    if request.stream {
        let include_usage = request
            .stream_options
            .as_ref()
            .is_some_and(|o| o.include_usage);

        let chunks = state
            .pipeline
            .chat_stream(request, request_id)
            .await
            .map_err(|e| ApiError::from_pipeline(e, ErrorFormat::OpenAI))?;

        Ok(Sse::new(chat_event_stream(chunks, include_usage))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let response = state
            .pipeline
            .chat(request, request_id)
            .await
            .map_err(|e| ApiError::from_pipeline(e, ErrorFormat::OpenAI))?;

        Ok(Json(response).into_response())
    }
}

/// Chat chunks as SSE events, terminated by `data: [DONE]`
///
/// A failure mid-stream is sent as a final error event without `[DONE]`.
fn chat_event_stream(
    chunks: ChunkStream,
    include_usage: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        tokio::pin!(chunks);
        let mut failed = false;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(mut chunk) => {
                    if !include_usage {
                        // usage-only trailer the client did not ask for
                        if chunk.choices.is_empty() {
                            continue;
                        }
                        chunk.usage = None;
                    }
                    yield Ok(json_event(&chunk));
                }
                Err(e) => {
                    error!("Stream error: {}", e);
                    let err = ApiError::from_pipeline(e.into(), ErrorFormat::OpenAI);
                    yield Ok(json_event(&err.openai_body()));
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            yield Ok(Event::default().data(DONE_MARKER));
        }
    }
}

/// POST /generate - Run the text generation pipeline
async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config).map_err(|e| e.with_format(ErrorFormat::Tgi))?;
    let Json(request) = payload.map_err(|e| bad_json(e, ErrorFormat::Tgi))?;

    let request_id = resolve_request_id(&headers, &state.registry, id_prefix::GENERATE)
        .map_err(|e| e.with_format(ErrorFormat::Tgi))?;

    let result = if request.stream {
        generate_stream_response(&state, request, &request_id).await
    } else {
        serve_generate(&state, request, &request_id).await
    };
    Ok(with_request_id(result, &request_id))
}

async fn serve_generate(
    state: &AppState,
    request: GenerateRequest,
    request_id: &str,
) -> Result<Response, ApiError> {
    let response = state
        .pipeline
        .run(request, request_id)
        .await
        .map_err(|e| ApiError::from_pipeline(e, ErrorFormat::Tgi))?;

    Ok(Json(response).into_response())
}

/// POST /generate_stream - Token stream as SSE
async fn generate_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config).map_err(|e| e.with_format(ErrorFormat::Tgi))?;
    let Json(request) = payload.map_err(|e| bad_json(e, ErrorFormat::Tgi))?;

    let request_id = resolve_request_id(&headers, &state.registry, id_prefix::GENERATE)
        .map_err(|e| e.with_format(ErrorFormat::Tgi))?;

    let result = generate_stream_response(&state, request, &request_id).await;
    Ok(with_request_id(result, &request_id))
}

async fn generate_stream_response(
    state: &AppState,
    request: GenerateRequest,
    request_id: &str,
) -> Result<Response, ApiError> {
    let tokens = state
        .pipeline
        .run_stream(request, request_id)
        .await
        .map_err(|e| ApiError::from_pipeline(e, ErrorFormat::Tgi))?;

    Ok(Sse::new(token_event_stream(tokens))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Token events as SSE, one `data:` line per token
fn token_event_stream(tokens: TokenStream) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        tokio::pin!(tokens);
        while let Some(item) = tokens.next().await {
            match item {
                Ok(event) => yield Ok(json_event(&event)),
                Err(e) => {
                    error!("Stream error: {}", e);
                    let err = ApiError::from_pipeline(e.into(), ErrorFormat::Tgi);
                    yield Ok(json_event(&err.tgi_body()));
                    break;
                }
            }
        }
    }
}

/// POST /v1/requests/{id}/cancel - Cancel an in-flight request
async fn cancel_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config)?;

    if state.pipeline.backend().cancel_request(&id).await {
        Ok(Json(json!({ "id": id, "cancelled": true })).into_response())
    } else {
        Err(ApiError::not_found(format!("No in-flight request with id {}", id)))
    }
}

/// GET /v1/models - Advertised model
async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelList {
        object: object::LIST.to_string(),
        data: vec![ModelCard {
            id: state.config.model_id.clone(),
            object: object::MODEL.to_string(),
            created: 0,
            owned_by: state.pipeline.backend().backend_name().to_string(),
        }],
    })
}

/// GET /info - Backend information
async fn info(State(state): State<AppState>) -> Result<Response, ApiError> {
    let backend = state.pipeline.backend();
    let backend_info = backend
        .info()
        .await
        .map_err(|e| ApiError::from_pipeline(e.into(), ErrorFormat::Tgi))?;

    Ok(Json(json!({
        "model_id": state.config.model_id,
        "served_model": state.config.served_model,
        "backend": backend.backend_name(),
        "backend_info": backend_info,
        "chat_template": state.config.chat_template.name(),
        "max_tokens_limit": state.config.limits.max_tokens,
        "default_max_tokens": state.config.limits.default_max_tokens,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response())
}

/// GET / - Root endpoint
async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "message": format!("TGI Gateway v{}", env!("CARGO_PKG_VERSION")),
        "status": "running",
        "config": {
            "model": state.config.model_id,
            "backend": state.pipeline.backend().backend_name(),
            "backend_url": state.config.backend_url,
            "chat_template": state.config.chat_template.name(),
            "client_api_key_validation": state.config.client_api_key.is_some(),
        },
        "endpoints": {
            "chat_completions": "/v1/chat/completions",
            "models": "/v1/models",
            "generate": "/generate",
            "generate_stream": "/generate_stream",
            "cancel": "/v1/requests/{id}/cancel",
            "health": "/health",
            "info": "/info",
        },
    }))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Response {
    let backend = state.pipeline.backend();
    let timestamp = chrono::Utc::now().to_rfc3339();

    match backend.health().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "backend": backend.backend_name(),
            "in_flight_requests": state.registry.len(),
            "timestamp": timestamp,
        }))
        .into_response(),
        Err(e) => {
            warn!("Backend health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "backend": backend.backend_name(),
                    "error": e.to_string(),
                    "timestamp": timestamp,
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{Backend, BackendType};
    use crate::core::config::RequestLimits;
    use crate::core::template::ChatTemplate;
    use crate::pipeline::tests::{MockBackend, MockFailure};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_config(client_api_key: Option<&str>) -> Config {
        Config {
            backend: BackendType::Tgi,
            backend_url: "http://127.0.0.1:8080".to_string(),
            backend_api_key: None,
            model_id: "tgi-model".to_string(),
            served_model: "tgi".to_string(),
            chat_template: ChatTemplate::ChatMl,
            host: "127.0.0.1".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            client_api_key: client_api_key.map(str::to_string),
            limits: RequestLimits::default(),
            request_timeout: 30,
            max_retries: 0,
        }
    }

    fn app_with(backend: MockBackend, client_api_key: Option<&str>) -> Router {
        build_app(backend, client_api_key, Arc::new(RequestRegistry::new()))
    }

    fn build_app(
        backend: MockBackend,
        client_api_key: Option<&str>,
        registry: Arc<RequestRegistry>,
    ) -> Router {
        let config = Arc::new(test_config(client_api_key));
        let backend: Arc<dyn Backend> = Arc::new(backend);
        let pipeline = Arc::new(TextGenerationPipeline::new(
            backend,
            config.limits,
            config.model_id.clone(),
            config.served_model.clone(),
        ));
        create_router(AppState {
            config,
            pipeline,
            registry,
        })
    }

    fn app() -> Router {
        app_with(MockBackend::new("Roses are red"), None)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let response = app()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "tgi",
                    "messages": [{"role": "user", "content": "Write a poem"}],
                    "max_tokens": 20
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "tgi-model");
        assert_eq!(body["choices"][0]["message"]["content"], "Roses are red");
        assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }

    #[tokio::test]
    async fn test_chat_completion_stream() {
        let response = app()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "tgi",
                    "messages": [{"role": "user", "content": "Write a poem"}],
                    "stream": true
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.contains("Roses are red"));
        assert!(!text.contains("\"usage\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_messages() {
        let response = app()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "tgi", "messages": []}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generate() {
        let response = app()
            .oneshot(post_json(
                "/generate",
                json!({"prompt": "Write a poem", "parameters": {"max_new_tokens": 20}}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["generated_text"], "Roses are red");
    }

    #[tokio::test]
    async fn test_generate_empty_input_is_400() {
        let response = app()
            .oneshot(post_json("/generate", json!({"inputs": ""})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "inputs must not be empty");
        assert_eq!(body["error_type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_generate_backend_failure_is_500() {
        let response = app_with(MockBackend::failing(), None)
            .oneshot(post_json("/generate", json!({"inputs": "Hello"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("model is loading"));
    }

    #[tokio::test]
    async fn test_generate_stream() {
        let response = app()
            .oneshot(post_json("/generate_stream", json!({"inputs": "Hello"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        let events: Vec<Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|p| serde_json::from_str(p).unwrap())
            .collect();

        let last = events.last().unwrap();
        assert_eq!(last["generated_text"], "Roses are red");
        assert_eq!(last["details"]["finish_reason"], "eos_token");
        assert!(!text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_client_api_key_required() {
        let app = app_with(MockBackend::new("x"), Some("secret"));

        let response = app
            .clone()
            .oneshot(post_json("/generate", json!({"inputs": "Hello"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = post_json("/generate", json!({"inputs": "Hello"}));
        request
            .headers_mut()
            .insert("authorization", "Bearer secret".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["in_flight_requests"], 0);

        let response = app_with(MockBackend::failing(), None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_list_models() {
        let response = app()
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "tgi-model");
        assert_eq!(body["data"][0]["owned_by"], "Mock");
    }

    #[tokio::test]
    async fn test_info() {
        let response = app()
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["backend_info"]["model_id"], "mock/model");
        assert_eq!(body["chat_template"], "chatml");
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let response = app()
            .oneshot(post_json("/v1/requests/known/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app()
            .oneshot(post_json("/v1/requests/missing/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn data_lines(text: &str) -> Vec<&str> {
        text.lines().filter_map(|l| l.strip_prefix("data: ")).collect()
    }

    #[tokio::test]
    async fn test_generation_responses_carry_request_id() {
        let response = app()
            .oneshot(post_json("/generate", json!({"inputs": "Hello"})))
            .await
            .unwrap();
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(id.starts_with("gen-"));

        let response = app()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "Hi"}]}),
            ))
            .await
            .unwrap();
        let id = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(body_json(response).await["id"], id.as_str());

        let response = app_with(MockBackend::failing(), None)
            .oneshot(post_json("/generate_stream", json!({"inputs": "Hello"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_client_request_id() {
        let mut request = post_json("/generate", json!({"inputs": "Hello"}));
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, "job-42".parse().unwrap());
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "job-42");

        let mut request = post_json("/generate", json!({"inputs": "Hello"}));
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, "has spaces".parse().unwrap());
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let registry = Arc::new(RequestRegistry::new());
        let _busy = registry.register("job-43");
        let mut request = post_json("/generate", json!({"inputs": "Hello"}));
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, "job-43".parse().unwrap());
        let response = build_app(MockBackend::new("x"), None, registry)
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("already in flight"));
    }

    #[tokio::test]
    async fn test_cancel_in_flight_stream() {
        let registry = Arc::new(RequestRegistry::new());
        let app = build_app(
            MockBackend::hanging("Roses are red", registry.clone()),
            None,
            registry.clone(),
        );

        let response = app
            .clone()
            .oneshot(post_json("/generate_stream", json!({"inputs": "Write a poem"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert!(registry.contains(&id));

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("Roses "));

        let cancel = app
            .oneshot(post_json(&format!("/v1/requests/{}/cancel", id), json!({})))
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);

        let mut rest = String::new();
        while let Some(chunk) = body.next().await {
            rest.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
        }
        let last: Value = serde_json::from_str(data_lines(&rest).last().unwrap()).unwrap();
        assert_eq!(last["error"], "Request cancelled");

        drop(body);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_chat_stream_failure_after_start() {
        let response = app_with(
            MockBackend::with_failure("Roses are red", MockFailure::MidStream),
            None,
        )
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "Write a poem"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        let lines = data_lines(&text);
        assert!(lines[0].contains("Roses are red"));

        let last: Value = serde_json::from_str(lines.last().unwrap()).unwrap();
        assert_eq!(last["error"]["type"], "server_error");
        assert!(
            last["error"]["message"]
                .as_str()
                .unwrap()
                .contains("connection reset")
        );
        assert!(!text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_generate_stream_failure_after_start() {
        let response = app_with(
            MockBackend::with_failure("Roses are red", MockFailure::MidStream),
            None,
        )
        .oneshot(post_json("/generate_stream", json!({"inputs": "Write a poem"})))
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        let lines = data_lines(&text);
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["token"]["text"], "Roses ");
        let last: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["error_type"], "server_error");
        assert!(last["error"].as_str().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_upstream_bad_request_is_400() {
        let app = app_with(MockBackend::with_failure("", MockFailure::BadRequest), None);

        let response = app
            .clone()
            .oneshot(post_json("/generate", json!({"inputs": "Hello"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_type"], "invalid_request_error");
        assert!(body["error"].as_str().unwrap().contains("inputs too long"));

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "Hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }
}
