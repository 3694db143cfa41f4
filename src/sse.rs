use std::convert::Infallible;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::gemini::ChunkStream;

/// One event frame. Newlines are escaped so the payload stays on one line.
pub fn data_event(text: &str) -> String {
    format!("data: {}\n\n", text.replace('\n', "\\n"))
}

pub fn error_event(message: &str) -> String {
    data_event(&format!("[ERROR] {}", message))
}

/// Forward model chunks as they arrive. The first failure becomes a single
/// `[ERROR]` event and ends the stream.
pub fn relay(mut chunks: ChunkStream) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    async_stream::stream! {
        let mut forwarded = 0usize;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) if text.is_empty() => {}
                Ok(text) => {
                    forwarded += 1;
                    yield Ok(Bytes::from(data_event(&text)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, forwarded, "model stream failed");
                    yield Ok(Bytes::from(error_event(&e.to_string())));
                    return;
                }
            }
        }
        tracing::debug!(forwarded, "model stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::ModelError;

    async fn run(items: Vec<Result<String, ModelError>>) -> Vec<String> {
        let chunks: ChunkStream = Box::pin(futures::stream::iter(items));
        relay(chunks)
            .map(|b| String::from_utf8(b.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[test]
    fn newlines_are_escaped() {
        assert_eq!(data_event("Line1\nLine2"), "data: Line1\\nLine2\n\n");
        assert_eq!(data_event("End"), "data: End\n\n");
    }

    #[test]
    fn error_event_format() {
        assert_eq!(error_event("quota exceeded"), "data: [ERROR] quota exceeded\n\n");
    }

    #[tokio::test]
    async fn chunks_forwarded_in_order() {
        let events = run(vec![Ok("Line1\nLine2".into()), Ok("End".into())]).await;
        assert_eq!(events, vec!["data: Line1\\nLine2\n\n", "data: End\n\n"]);
    }

    #[tokio::test]
    async fn error_terminates_stream() {
        let events = run(vec![
            Ok("partial".into()),
            Err(ModelError::Request("connection reset".into())),
            Ok("never sent".into()),
        ])
        .await;
        assert_eq!(
            events,
            vec!["data: partial\n\n", "data: [ERROR] connection reset\n\n"]
        );
    }

    #[tokio::test]
    async fn empty_chunks_skipped() {
        let events = run(vec![Ok(String::new()), Ok("x".into())]).await;
        assert_eq!(events, vec!["data: x\n\n"]);
    }
}
