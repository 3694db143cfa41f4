//! Streaming client for the Gemini `streamGenerateContent` endpoint.
//!
//! The model is reached through [`GenerativeModel`], which hands back a
//! lazily-driven stream of text chunks. Nothing is buffered beyond the SSE
//! event currently being decoded.

use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::{ImagePart, PromptBundle};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENT: &str = "docwriter-api/0.1";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("{0}")]
    Request(String),
    #[error("{status} {message}")]
    Api { status: u16, message: String },
    #[error("could not decode model response: {0}")]
    Decode(String),
    #[error("prompt was blocked: {0}")]
    Blocked(String),
    #[error("generation stopped: {0}")]
    Stopped(String),
}

// ── Model seam ───────────────────────────────────────────────────────────────

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

pub trait GenerativeModel: Send + Sync {
    /// Start one generation. The request is only sent once the stream is polled.
    fn stream_generate(&self, bundle: PromptBundle) -> ChunkStream;
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Url,
}

impl GeminiConfig {
    fn endpoint(&self) -> Result<Url, ModelError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut url = base
            .join(&format!("v1beta/models/{}:streamGenerateContent", self.model))
            .map_err(|e| ModelError::Request(format!("invalid model endpoint: {}", e)))?;
        url.query_pairs_mut().append_pair("alt", "sse");
        Ok(url)
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData(Blob),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

impl From<&ImagePart> for Part {
    fn from(image: &ImagePart) -> Self {
        Part::InlineData(Blob {
            mime_type: image.mime_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&image.data),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u16>,
    message: String,
}

impl GenerateContentResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

fn request_body(bundle: &PromptBundle) -> GenerateContentRequest {
    let mut parts = vec![Part::Text(bundle.text.clone())];
    parts.extend(bundle.images.iter().map(Part::from));
    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
    }
}

/// Turn one SSE payload into the text it carries, if any.
fn decode_chunk(payload: &str) -> Result<Option<String>, ModelError> {
    let response: GenerateContentResponse =
        serde_json::from_str(payload).map_err(|e| ModelError::Decode(e.to_string()))?;

    let text = response.text();

    if let Some(err) = response.error {
        return Err(ModelError::Api {
            status: err.code.unwrap_or(500),
            message: err.message,
        });
    }
    if !text.is_empty() {
        return Ok(Some(text));
    }

    match response.candidates.first() {
        None => match response.prompt_feedback.and_then(|f| f.block_reason) {
            Some(reason) => Err(ModelError::Blocked(reason)),
            None => Ok(None),
        },
        // A textless candidate is only fine when generation ended normally.
        Some(candidate) => match candidate.finish_reason.as_deref() {
            None | Some("STOP" | "MAX_TOKENS" | "FINISH_REASON_UNSPECIFIED") => Ok(None),
            Some(reason) => Err(ModelError::Stopped(reason.to_string())),
        },
    }
}

fn api_error(status: reqwest::StatusCode, body: &str) -> ModelError {
    let message = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|env| env.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let message = if message.is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    } else {
        message
    };
    ModelError::Api {
        status: status.as_u16(),
        message,
    }
}

// ── SSE decoding ─────────────────────────────────────────────────────────────

/// Incremental decoder for the upstream event stream. Bytes may be split
/// anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
    /// `buf[..scanned]` holds no newline.
    scanned: usize,
    data: Vec<String>,
}

impl SseDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            start = end + 1;
            self.scanned = start;
            if let Some(event) = self.line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        events
    }

    fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        let rest = String::from_utf8_lossy(&rest);
        let rest = rest.trim_end_matches(['\n', '\r']);
        if !rest.is_empty() {
            if let Some(event) = self.line(rest) {
                return Some(event);
            }
        }
        self.flush()
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.flush();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn flush(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, ModelError> {
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn request(&self, bundle: &PromptBundle) -> Result<reqwest::RequestBuilder, ModelError> {
        let mut request = self
            .http
            .post(self.config.endpoint()?)
            .json(&request_body(bundle));
        if let Some(key) = &self.config.api_key {
            request = request.header("x-goog-api-key", key);
        }
        Ok(request)
    }
}

impl GenerativeModel for GeminiClient {
    fn stream_generate(&self, bundle: PromptBundle) -> ChunkStream {
        let request = self.request(&bundle);
        let model = self.config.model.clone();
        let images = bundle.images.len();

        Box::pin(async_stream::stream! {
            let request = match request {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            tracing::debug!(%model, images, "calling generative model");

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(ModelError::Request(e.to_string()));
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(%status, error = %e, "failed to read model error body");
                        String::new()
                    }
                };
                yield Err(api_error(status, &body));
                return;
            }

            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            loop {
                let payloads = match body.next().await {
                    Some(Ok(bytes)) => decoder.feed(&bytes),
                    Some(Err(e)) => {
                        yield Err(ModelError::Request(e.to_string()));
                        return;
                    }
                    None => break,
                };
                for payload in payloads {
                    match decode_chunk(&payload) {
                        Ok(Some(text)) => yield Ok(text),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            if let Some(payload) = decoder.finish() {
                match decode_chunk(&payload) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str, key: Option<&str>) -> GeminiConfig {
        GeminiConfig {
            api_key: key.map(str::to_string),
            model: "gemini-test".into(),
            base_url: Url::parse(base).unwrap(),
        }
    }

    fn text_event(text: &str) -> String {
        let payload = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
        });
        format!("data: {}\r\n\r\n", payload)
    }

    async fn collect(client: &GeminiClient, bundle: PromptBundle) -> Vec<Result<String, ModelError>> {
        client.stream_generate(bundle).collect().await
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let cfg = config("https://proxy.example.com/google", None);
        assert_eq!(
            cfg.endpoint().unwrap().as_str(),
            "https://proxy.example.com/google/v1beta/models/gemini-test:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn request_body_text_only() {
        let bundle = PromptBundle {
            text: "hello".into(),
            images: vec![],
        };
        let value = serde_json::to_value(request_body(&bundle)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"contents": [{"role": "user", "parts": [{"text": "hello"}]}]})
        );
    }

    #[test]
    fn request_body_appends_images() {
        let bundle = PromptBundle {
            text: "describe".into(),
            images: vec![ImagePart {
                mime_type: "image/png".into(),
                data: Bytes::from_static(b"abc"),
            }],
        };
        let value = serde_json::to_value(request_body(&bundle)).unwrap();
        let parts = &value["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "describe");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "YWJj");
    }

    #[test]
    fn decoder_handles_split_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        assert!(decoder.feed(b":1}\r").is_empty());
        assert_eq!(decoder.feed(b"\n\r\ndata: x\n\n"), vec!["{\"a\":1}", "x"]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_handles_byte_at_a_time_input() {
        let long = "x".repeat(10_000);
        let input = format!("data: {long}\r\n\r\ndata: next\n\n");
        let mut decoder = SseDecoder::default();
        let mut events = Vec::new();
        for b in input.as_bytes() {
            events.extend(decoder.feed(std::slice::from_ref(b)));
        }
        assert_eq!(events, vec![long, "next".to_string()]);
        assert!(decoder.buf.is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn decode_chunk_variants() {
        assert_eq!(
            decode_chunk(r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#),
            Ok(Some("ab".into()))
        );
        assert_eq!(decode_chunk(r#"{"candidates":[{"finishReason":"STOP"}]}"#), Ok(None));
        assert_eq!(
            decode_chunk(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#),
            Err(ModelError::Blocked("SAFETY".into()))
        );
        assert!(matches!(decode_chunk("not json"), Err(ModelError::Decode(_))));
        assert_eq!(
            decode_chunk(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#),
            Err(ModelError::Stopped("SAFETY".into()))
        );
        assert_eq!(
            decode_chunk(r#"{"candidates":[{"content":{"parts":[]},"finishReason":"RECITATION"}]}"#),
            Err(ModelError::Stopped("RECITATION".into()))
        );
        assert_eq!(decode_chunk(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#), Ok(None));
        assert_eq!(
            decode_chunk(r#"{"candidates":[{"content":{"parts":[{"text":"tail"}]},"finishReason":"SAFETY"}]}"#),
            Ok(Some("tail".into()))
        );
    }

    #[test]
    fn api_error_falls_back_to_status_reason() {
        assert_eq!(
            api_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, ""),
            ModelError::Api {
                status: 503,
                message: "Service Unavailable".into()
            }
        );
    }

    #[tokio::test]
    async fn safety_stop_mid_stream_is_an_error() {
        let server = MockServer::start().await;
        let body = format!(
            "{}data: {}\r\n\r\n",
            text_event("Hi"),
            serde_json::json!({"candidates": [{"finishReason": "SAFETY"}]})
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = GeminiClient::new(config(&server.uri(), None)).unwrap();
        let chunks = collect(&client, PromptBundle::default()).await;
        assert_eq!(
            chunks,
            vec![Ok("Hi".into()), Err(ModelError::Stopped("SAFETY".into()))]
        );
    }

    #[tokio::test]
    async fn streams_chunks_in_order() {
        let server = MockServer::start().await;
        let body = format!("{}{}", text_event("Line1\nLine2"), text_event("End"));
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-test:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "contents": [{"role": "user", "parts": [{"text": "prompt"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(config(&server.uri(), Some("test-key"))).unwrap();
        let chunks = collect(
            &client,
            PromptBundle {
                text: "prompt".into(),
                images: vec![],
            },
        )
        .await;
        assert_eq!(chunks, vec![Ok("Line1\nLine2".into()), Ok("End".into())]);
    }

    #[tokio::test]
    async fn api_error_uses_google_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT"}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new(config(&server.uri(), None)).unwrap();
        let chunks = collect(&client, PromptBundle::default()).await;
        assert_eq!(
            chunks,
            vec![Err(ModelError::Api {
                status: 400,
                message: "API key not valid".into()
            })]
        );
    }

    #[tokio::test]
    async fn unreachable_host_is_request_error() {
        let client = GeminiClient::new(config("http://127.0.0.1:1/", None)).unwrap();
        let chunks = collect(&client, PromptBundle::default()).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(ModelError::Request(_))));
    }
}
