//! The external renderer: ZPL payload + label size in, multi-page PDF out.
//!
//! [`Renderer`] is the seam the dispatcher talks to. [`LabelaryRenderer`]
//! implements it against a Labelary-compatible HTTP API; tests plug in
//! scripted renderers instead.
//!
//! The renderer is an opaque black box: it returns one PDF page per `^XA…^XZ`
//! block it received, in submission order, or an error. HTTP 413 is the only
//! error with structural meaning (too many labels in one call); everything
//! else is treated as transient.

use crate::config::{LabelSize, ServiceConfig};
use crate::error::{RenderError, Zpl2PdfError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// One renderer call.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Concatenated `^XA…^XZ` blocks.
    pub zpl: String,
    pub label_size: LabelSize,
    /// Labels in `zpl` as counted by the caller.
    pub label_count: usize,
}

/// Anything that can turn a ZPL payload into a PDF.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `request.zpl`, returning PDF bytes with one page per label.
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError>;
}

/// HTTP client for a Labelary-compatible rendering API.
///
/// `POST {base_url}/printers/{dpmm}dpmm/labels/{width}x{height}/` with the
/// ZPL as the request body and `Accept: application/pdf`.
#[derive(Debug, Clone)]
pub struct LabelaryRenderer {
    client: reqwest::Client,
    base_url: String,
    dpmm: u8,
}

impl LabelaryRenderer {
    /// Build a renderer client from the service config.
    pub fn new(config: &ServiceConfig) -> Result<Self, Zpl2PdfError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Zpl2PdfError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.renderer_url.clone(),
            dpmm: config.dpmm,
        })
    }

    /// Endpoint URL for a given label size.
    pub fn endpoint(&self, size: &LabelSize) -> String {
        format!(
            "{}/printers/{}dpmm/labels/{}/",
            self.base_url, self.dpmm, size
        )
    }
}

#[async_trait]
impl Renderer for LabelaryRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        let url = self.endpoint(&request.label_size);
        debug!(
            "POST {} ({} labels, {} bytes)",
            url,
            request.label_count,
            request.zpl.len()
        );

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/pdf")
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(request.zpl.clone())
            .send()
            .await
            .map_err(|e| RenderError::Transient {
                status: e.status().map(|s| s.as_u16()),
                detail: if e.is_timeout() {
                    format!("renderer timed out: {e}")
                } else {
                    format!("renderer request failed: {e}")
                },
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
            return Err(RenderError::PayloadTooLarge);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenderError::Transient {
                status: Some(status.as_u16()),
                detail: format!("HTTP {}: {}", status, body.trim()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| RenderError::Transient {
            status: Some(status.as_u16()),
            detail: format!("failed to read renderer response: {e}"),
        })?;

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_density_and_size() {
        let config = ServiceConfig::builder()
            .renderer_url("http://localhost:9000/v1/")
            .dpmm(12)
            .build()
            .unwrap();
        let renderer = LabelaryRenderer::new(&config).unwrap();
        assert_eq!(
            renderer.endpoint(&LabelSize::new(4.0, 6.0).unwrap()),
            "http://localhost:9000/v1/printers/12dpmm/labels/4x6/"
        );
        assert_eq!(
            renderer.endpoint(&LabelSize::new(2.25, 1.25).unwrap()),
            "http://localhost:9000/v1/printers/12dpmm/labels/2.25x1.25/"
        );
    }

    #[tokio::test]
    async fn unreachable_renderer_is_transient() {
        let config = ServiceConfig::builder()
            // Port 9 (discard) on localhost is practically never listening.
            .renderer_url("http://127.0.0.1:9")
            .request_timeout_secs(2)
            .build()
            .unwrap();
        let renderer = LabelaryRenderer::new(&config).unwrap();
        let err = renderer
            .render(&RenderRequest {
                zpl: "^XA^XZ".into(),
                label_size: LabelSize::default(),
                label_count: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Transient { .. }));
    }
}
