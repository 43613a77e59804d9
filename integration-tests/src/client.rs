//! HTTP client for the sandbox API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncRead;
use tracing::{debug, error, info};

use crate::multipart;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const BASE_URL_ENV: &str = "API_BASE_URL";

#[derive(Debug, Clone)]
pub struct SandboxClient {
    base_url: String,
    http: reqwest::Client,
}

impl SandboxClient {
    /// `$API_BASE_URL`, else `http://localhost:8080`.
    pub fn from_env() -> Result<Self> {
        let base = std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(base)
    }

    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send `body` as JSON when present. The content type is always JSON.
    pub async fn make_request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        debug!(%method, path, "Sending request");
        req.send()
            .await
            .with_context(|| format!("{method} {path} failed"))
    }

    /// Buffered multipart upload: a `file` part followed by `fields`.
    pub async fn make_multipart_request(
        &self,
        method: Method,
        path: &str,
        file: Vec<u8>,
        filename: &str,
        fields: &[(&str, &str)],
    ) -> Result<Response> {
        let mut form = Form::new().part("file", Part::bytes(file).file_name(filename.to_string()));
        for (name, value) in fields {
            form = form.text(name.to_string(), value.to_string());
        }
        self.http
            .request(method.clone(), self.url(path))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("multipart {method} {path} failed"))
    }

    /// Streamed multipart upload. The body is produced while it is sent, so
    /// `reader` is never held in memory; a read error fails the request.
    pub async fn make_multipart_request_stream<R>(
        &self,
        method: Method,
        path: &str,
        reader: R,
        filename: &str,
        fields: &[(&str, &str)],
    ) -> Result<Response>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let (content_type, body) = multipart::stream_body(reader, filename, fields);
        self.http
            .request(method.clone(), self.url(path))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("streamed multipart {method} {path} failed"))
    }

    /// Read the whole body and decode it, whatever the status.
    pub async fn parse_json_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let status = resp.status();
        let bytes = resp.bytes().await.context("Failed to read response body")?;
        serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "Failed to decode {status} response: {}",
                String::from_utf8_lossy(&bytes)
            )
        })
    }

    /// Like `parse_json_response`, but any status >= 400 is an error.
    pub async fn parse_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let status = resp.status();
        if status.as_u16() >= 400 {
            let body = resp.text().await.unwrap_or_default();
            bail!("request failed with status {status}: {body}");
        }
        Self::parse_json_response(resp).await
    }

    pub async fn make_request_and_parse<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let resp = self.make_request(method, path, body).await?;
        Self::parse_response(resp).await
    }

    /// Poll `/health` until it answers 200.
    pub async fn wait_for_api(&self, max_retries: u32, retry_delay: Duration) -> Result<()> {
        for attempt in 1..=max_retries {
            match self.http.get(self.url("/health")).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(attempt, "Sandbox API is ready");
                    return Ok(());
                }
                Ok(resp) => debug!(attempt, status = %resp.status(), "Sandbox API not ready"),
                Err(e) => debug!(attempt, "Sandbox API not reachable: {e}"),
            }
            tokio::time::sleep(retry_delay).await;
        }
        bail!(
            "sandbox API at {} not ready after {max_retries} attempts",
            self.base_url
        )
    }

    /// `wait_for_api`, exiting the process with status 1 on failure.
    pub async fn wait_for_api_or_exit(&self, max_retries: u32, retry_delay: Duration) {
        if let Err(e) = self.wait_for_api(max_retries, retry_delay).await {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = SandboxClient::new("http://127.0.0.1:9000/").unwrap();
        assert_eq!(client.url("/health"), "http://127.0.0.1:9000/health");
    }

    #[tokio::test]
    async fn test_wait_for_api_gives_up() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = SandboxClient::new(format!("http://127.0.0.1:{port}")).unwrap();
        let err = client
            .wait_for_api(2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready after 2 attempts"));
    }
}
