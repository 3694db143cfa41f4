use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

mod config;
mod extract;
mod gemini;
mod models;
mod pdf;
mod prompt;
mod sse;

use config::Config;
use gemini::{GeminiClient, GenerativeModel};
use models::{AttachmentKind, ChatRequest, ImagePart, PromptBundle, UploadedFile};
use pdf::{CommandRenderer, PdfRenderer, RenderError};

#[derive(Clone)]
struct AppState {
    model: Arc<dyn GenerativeModel>,
    renderer: Arc<dyn PdfRenderer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if config.google_api_key.is_none() {
        tracing::warn!("GOOGLE_API_KEY is not set; the model will reject requests");
    }

    let model = GeminiClient::new(config.gemini())?;
    let renderer = CommandRenderer::from_command_line(&config.pdf_renderer)?;
    tracing::info!(
        model = %config.model,
        renderer = renderer.program(),
        "configured backends"
    );

    let state = AppState {
        model: Arc::new(model),
        renderer: Arc::new(renderer),
    };

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat_endpoint))
        .route("/generate-pdf", post(generate_pdf_endpoint))
        .layer(DefaultBodyLimit::disable())
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin, method and header, with credentials. Origin and headers are
/// mirrored because a literal `*` is not allowed alongside credentials.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Field required: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::MissingField(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            ApiError::Render(e) => {
                tracing::error!(error = %e, "PDF rendering failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };
        (status, Json(json!({"detail": detail}))).into_response()
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn chat_endpoint(
    State(state): State<AppState>,
    ChatForm(request): ChatForm,
) -> Result<Response, ApiError> {
    let bundle = build_bundle(request).await;
    let events = sse::relay(state.model.stream_generate(bundle));

    Ok((
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(events),
    )
        .into_response())
}

async fn generate_pdf_endpoint(
    State(state): State<AppState>,
    HtmlContent(html): HtmlContent,
) -> Result<Response, ApiError> {
    let pdf = state.renderer.render(&pdf::wrap_html(&html)).await?;
    Ok(([(CONTENT_TYPE, "application/pdf")], pdf).into_response())
}

// ── Form parsing ─────────────────────────────────────────────────────────────

async fn read_chat_form(mut multipart: Multipart) -> Result<ChatRequest, ApiError> {
    let mut prompt = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "prompt" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                prompt = Some(text);
            }
            "files" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                // Browsers send an empty, nameless part when no file is picked.
                if filename.is_empty() {
                    continue;
                }
                files.push(UploadedFile {
                    filename,
                    content_type,
                    bytes,
                });
            }
            _ => {}
        }
    }

    let prompt = prompt.ok_or(ApiError::MissingField("prompt"))?;
    Ok(ChatRequest { prompt, files })
}

/// Route each upload, extract documents one at a time, and assemble the prompt.
async fn build_bundle(request: ChatRequest) -> PromptBundle {
    let mut images = Vec::new();
    let mut blocks = Vec::new();

    for file in request.files {
        let filename = file.filename.to_lowercase();
        match AttachmentKind::classify(&filename) {
            AttachmentKind::Image => {
                tracing::debug!(%filename, "forwarding image");
                images.push(ImagePart::from_upload(&file));
            }
            AttachmentKind::Document(kind) => {
                tracing::debug!(%filename, ?kind, "extracting document");
                let text = extract::extract_or_marker(file.bytes, &filename).await;
                blocks.push(prompt::document_block(&filename, &text));
            }
            AttachmentKind::Unsupported => {
                tracing::debug!(%filename, "ignoring unsupported attachment");
            }
        }
    }

    PromptBundle {
        text: prompt::assemble(&request.prompt, &blocks),
        images,
    }
}

fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

#[derive(Debug, Deserialize)]
struct PromptForm {
    prompt: Option<String>,
}

/// The `/chat` form: multipart with optional files, or a urlencoded prompt.
struct ChatForm(ChatRequest);

#[axum::async_trait]
impl<S> FromRequest<S> for ChatForm
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if is_multipart(&req) {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            return read_chat_form(multipart).await.map(ChatForm);
        }

        let Form(form) = Form::<PromptForm>::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let prompt = form.prompt.ok_or(ApiError::MissingField("prompt"))?;
        Ok(ChatForm(ChatRequest {
            prompt,
            files: Vec::new(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct PdfForm {
    html_content: Option<String>,
}

/// `html_content` from either a urlencoded or a multipart form.
struct HtmlContent(String);

#[axum::async_trait]
impl<S> FromRequest<S> for HtmlContent
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let html = if is_multipart(&req) {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            let mut html = None;
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?
            {
                if field.name() == Some("html_content") {
                    html = Some(
                        field
                            .text()
                            .await
                            .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                    );
                }
            }
            html
        } else {
            let Form(form) = Form::<PdfForm>::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            form.html_content
        };

        html.map(HtmlContent)
            .ok_or(ApiError::MissingField("html_content"))
    }
}
