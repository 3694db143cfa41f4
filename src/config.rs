use std::net::SocketAddr;

use clap::Parser;
use url::Url;

use crate::gemini::{GeminiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::pdf::DEFAULT_RENDERER;

/// Process configuration, read once at startup.
#[derive(Debug, Clone, Parser)]
#[command(name = "docwriter-api", version, about = "Prompt + documents in, streamed HTML and PDFs out")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "DOCWRITER_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Google Generative Language API key.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub google_api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub gemini_base_url: Url,

    /// HTML-to-PDF command: reads HTML on stdin, writes PDF on stdout.
    #[arg(long, env = "PDF_RENDERER", default_value = DEFAULT_RENDERER)]
    pub pdf_renderer: String,
}

impl Config {
    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.google_api_key.clone().filter(|k| !k.is_empty()),
            model: self.model.clone(),
            base_url: self.gemini_base_url.clone(),
        }
    }
}
