//! HTML to PDF rendering through an external engine.
//!
//! The HTML fragment is inserted into the page template as-is. Nothing is
//! sanitized, so whatever the caller sends (remote images, huge tables,
//! hostile markup) reaches the engine unchanged.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const DEFAULT_RENDERER: &str = "weasyprint - -";

const STYLESHEET: &str = "\
@page { size: A4; margin: 2cm; }
body { font-family: Helvetica; line-height: 1.5; color: #333; }
h1 { color: #2563eb; border-bottom: 2px solid #eee; }
img { max-width: 100%; height: auto; }";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("PDF renderer command is empty")]
    NoCommand,
    #[error("failed to start PDF renderer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF renderer I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("PDF renderer produced no output")]
    EmptyOutput,
}

pub fn wrap_html(fragment: &str) -> String {
    format!(
        "<html>\n<head>\n<meta charset=\"utf-8\">\n<style>\n{}\n</style>\n</head>\n<body>{}</body>\n</html>\n",
        STYLESHEET, fragment
    )
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    /// Render a full HTML document to PDF bytes.
    async fn render(&self, html: &str) -> Result<Vec<u8>, RenderError>;
}

/// Runs a program that reads HTML on stdin and writes PDF on stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace separated command line such as `weasyprint - -`.
    pub fn from_command_line(line: &str) -> Result<Self, RenderError> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(RenderError::NoCommand)?;
        Ok(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl PdfRenderer for CommandRenderer {
    async fn render(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // stdin is written concurrently with draining stdout; pipe buffers are bounded.
        let mut stdin = child.stdin.take().ok_or_else(|| {
            RenderError::Io(std::io::Error::other("renderer stdin unavailable"))
        })?;
        let input = html.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;
        match writer.await {
            Ok(Ok(())) => {}
            // Early exit closes the pipe; the exit status is reported below.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(RenderError::Io(e)),
            Err(e) => return Err(RenderError::Io(std::io::Error::other(e))),
        }

        if !output.status.success() {
            return Err(RenderError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if output.stdout.is_empty() {
            return Err(RenderError::EmptyOutput);
        }
        tracing::debug!(
            program = %self.program,
            bytes = output.stdout.len(),
            "rendered PDF"
        );
        Ok(output.stdout)
    }
}
