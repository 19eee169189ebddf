//! Mistral OCR (`POST /v1/ocr`).
//!
//! The page image is sent inline as a `data:` URI, so nothing has to be
//! uploaded to object storage first. The response carries one Markdown
//! string per page; for a single image that is one entry.

use super::OcrBackend;
use crate::credential::Credential;
use crate::error::{OcrBatchError, OcrCallError};
use crate::pipeline::encode::data_uri;
use crate::pipeline::render::PageUnit;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: DocumentChunk,
    include_image_base64: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DocumentChunk {
    ImageUrl { image_url: String },
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    index: usize,
    markdown: String,
}

/// Client for Mistral's OCR endpoint.
#[derive(Debug, Clone)]
pub struct MistralOcrBackend {
    client: Client,
    endpoint: String,
    model: String,
}

impl MistralOcrBackend {
    /// `base_url` without the `/v1/ocr` suffix, e.g. `https://api.mistral.ai`.
    pub fn new(base_url: &str, model: impl Into<String>) -> Result<Self, OcrBatchError> {
        // No client-level timeout: OcrClient bounds every call itself.
        let client = Client::builder()
            .user_agent(concat!("edgequake-ocrbatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OcrBatchError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/ocr", base_url.trim_end_matches('/')),
            model: model.into(),
        })
    }
}

#[async_trait]
impl OcrBackend for MistralOcrBackend {
    fn name(&self) -> &str {
        "mistral"
    }

    async fn recognize(
        &self,
        unit: &PageUnit,
        credential: &Credential,
    ) -> Result<String, OcrCallError> {
        let request = OcrRequest {
            model: &self.model,
            document: DocumentChunk::ImageUrl {
                image_url: data_uri(&unit.payload, unit.format),
            },
            include_image_base64: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.expose())
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = truncate(body.trim(), 300);
            return Err(
                OcrCallError::from_status(status, detail, retry_after, unit.payload.len())
                    .unwrap_or_else(|| OcrCallError::InvalidResponse(format!("HTTP {}", status))),
            );
        }

        let mut parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| OcrCallError::InvalidResponse(e.to_string()))?;
        if parsed.pages.is_empty() {
            return Err(OcrCallError::InvalidResponse("response has no pages".into()));
        }
        parsed.pages.sort_by_key(|p| p.index);
        debug!(
            "Page {}: mistral returned {} page(s)",
            unit.page_num(),
            parsed.pages.len()
        );
        Ok(parsed
            .pages
            .into_iter()
            .map(|p| p.markdown)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

fn transport_error(e: reqwest::Error) -> OcrCallError {
    if e.is_timeout() {
        OcrCallError::Timeout { secs: 0 }
    } else if e.is_decode() {
        OcrCallError::InvalidResponse(e.to_string())
    } else {
        OcrCallError::Connection(e.to_string())
    }
}

/// Longest `Retry-After` honoured; larger values are clamped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// `Retry-After` as delta-seconds or an HTTP date, clamped to [`MAX_RETRY_AFTER`].
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let after = match raw.parse::<f64>() {
        Ok(secs) if secs.is_nan() || secs < 0.0 => return None,
        Ok(secs) => Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
            (at - Utc::now()).to_std().ok()?
        }
    };
    Some(after.min(MAX_RETRY_AFTER))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormat;
    use crate::document::DocumentId;
    use reqwest::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + len {
                        break;
                    }
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (base, handle)
    }

    fn http(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
            body.len()
        )
    }

    fn unit() -> PageUnit {
        PageUnit {
            document: DocumentId::from("doc"),
            index: 0,
            payload: vec![0xFF, 0xD8, 0xFF],
            format: ImageFormat::Jpeg,
            quality: 85,
            dpi: 150,
        }
    }

    #[tokio::test]
    async fn posts_data_uri_with_bearer_and_joins_pages() {
        let body = r##"{"pages":[{"index":1,"markdown":"second"},{"index":0,"markdown":"# first"}],"model":"mistral-ocr-latest"}"##;
        let (base, server) = serve_once(http("200 OK", "", body)).await;
        let backend = MistralOcrBackend::new(&base, "mistral-ocr-latest").unwrap();

        let md = backend.recognize(&unit(), &Credential::new("sk-test")).await.unwrap();
        assert_eq!(md, "# first\n\nsecond");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/ocr "), "got {request}");
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains("\"type\":\"image_url\""));
        assert!(request.contains("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn maps_429_with_retry_after() {
        let (base, _server) =
            serve_once(http("429 Too Many Requests", "Retry-After: 12\r\n", "{}")).await;
        let backend = MistralOcrBackend::new(&base, "m").unwrap();
        match backend.recognize(&unit(), &Credential::new("k")).await {
            Err(OcrCallError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(12)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn retry_after(value: &str) -> Option<Duration> {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        parse_retry_after(&headers)
    }

    #[test]
    fn retry_after_is_clamped() {
        assert_eq!(retry_after("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(retry_after("1e30"), Some(MAX_RETRY_AFTER));
        assert_eq!(retry_after("1e19"), Some(MAX_RETRY_AFTER));
        assert_eq!(retry_after("inf"), Some(MAX_RETRY_AFTER));
        assert_eq!(retry_after("-3"), None);
        assert_eq!(retry_after("NaN"), None);
        assert_eq!(retry_after("soon"), None);
    }

    #[tokio::test]
    async fn maps_401_to_invalid_credential() {
        let (base, _server) =
            serve_once(http("401 Unauthorized", "", r#"{"message":"Unauthorized"}"#)).await;
        let backend = MistralOcrBackend::new(&base, "m").unwrap();
        let err = backend.recognize(&unit(), &Credential::new("bad")).await.unwrap_err();
        assert!(matches!(err, OcrCallError::InvalidCredential(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn garbled_body_is_invalid_response() {
        let (base, _server) = serve_once(http("200 OK", "", "not json")).await;
        let backend = MistralOcrBackend::new(&base, "m").unwrap();
        let err = backend.recognize(&unit(), &Credential::new("k")).await.unwrap_err();
        assert!(matches!(err, OcrCallError::InvalidResponse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let backend = MistralOcrBackend::new(&base, "m").unwrap();
        let err = backend.recognize(&unit(), &Credential::new("k")).await.unwrap_err();
        assert!(matches!(err, OcrCallError::Connection(_)), "got {err:?}");
    }

    #[test]
    fn retry_after_forms() {
        let mut h = HeaderMap::new();
        assert_eq!(parse_retry_after(&h), None);
        h.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&h), Some(Duration::from_secs(3)));
        h.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&h), None);
        h.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&h), None);
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
