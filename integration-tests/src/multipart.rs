//! Streaming multipart/form-data bodies.
//!
//! A producer task writes the form fields, then the file part, into a
//! bounded channel that backs the request body. A read error is forwarded
//! as the last item so the request fails instead of sending a truncated
//! body.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const CHUNK_SIZE: usize = 64 * 1024;
const PIPE_DEPTH: usize = 8;

type Chunk = Result<Bytes, io::Error>;

/// Returns the `Content-Type` (with boundary) and the streaming body.
pub fn stream_body<R>(reader: R, filename: &str, fields: Vec<(String, String)>) -> (String, reqwest::Body)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let boundary = format!("sandbox-{}", Uuid::new_v4().simple());
    let content_type = format!("multipart/form-data; boundary={boundary}");
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    tokio::spawn(write_parts(reader, boundary, filename.to_string(), fields, tx));
    (content_type, reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
}

fn escape(name: &str) -> String {
    name.replace('"', "%22").replace(['\r', '\n'], " ")
}

async fn write_parts<R>(
    mut reader: R,
    boundary: String,
    filename: String,
    fields: Vec<(String, String)>,
    tx: mpsc::Sender<Chunk>,
) where
    R: AsyncRead + Unpin,
{
    for (name, value) in &fields {
        let part = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{value}\r\n",
            escape(name)
        );
        if tx.send(Ok(Bytes::from(part))).await.is_err() {
            return;
        }
    }

    let header = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        escape(&filename)
    );
    if tx.send(Ok(Bytes::from(header))).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    let _ = tx
        .send(Ok(Bytes::from(format!("\r\n--{boundary}--\r\n"))))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk went away")))
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Chunk>) -> (Vec<u8>, Option<io::Error>) {
        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(e) => return (body, Some(e)),
            }
        }
        (body, None)
    }

    #[tokio::test]
    async fn test_fields_precede_file_part() {
        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        let fields = vec![("permissions".to_string(), "0600".to_string())];
        tokio::spawn(write_parts(&b"payload"[..], "b0".into(), "data.bin".into(), fields, tx));

        let (body, err) = collect(rx).await;
        assert!(err.is_none());
        let body = String::from_utf8(body).unwrap();
        let field_at = body.find("name=\"permissions\"").unwrap();
        let file_at = body.find("name=\"file\"; filename=\"data.bin\"").unwrap();
        assert!(field_at < file_at);
        assert!(body.contains("\r\n\r\npayload\r\n--b0--\r\n"));
    }

    #[tokio::test]
    async fn test_read_errors_reach_the_consumer() {
        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        tokio::spawn(write_parts(FailingReader, "b1".into(), "x".into(), Vec::new(), tx));

        let (body, err) = collect(rx).await;
        assert_eq!(err.unwrap().to_string(), "disk went away");
        assert!(!String::from_utf8_lossy(&body).contains("--b1--"));
    }
}
