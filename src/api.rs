//! Client for the remote conversion service.
//!
//! The orchestrator only sees the [`ConversionApi`] trait; [`HttpConversionApi`]
//! is the reqwest implementation speaking the service's multipart/JSON protocol.

use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::{Result, ToolkitError};
use crate::model::{
    ComplexityAnalysis, ConvertedFile, ExportMode, MultiTablePreview, PreviewPage, SourceFile,
    TargetFormat,
};

/// Parameters of one `preview` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewRequest {
    pub page: u32,
    pub page_size: u32,
    pub export_mode: ExportMode,
}

/// Operations offered by the conversion service.
#[async_trait::async_trait]
pub trait ConversionApi: Send + Sync {
    /// Pre-flight complexity check of a JSON file.
    async fn analyze(&self, file: &SourceFile) -> Result<ComplexityAnalysis>;

    async fn preview(&self, file: &SourceFile, request: PreviewRequest) -> Result<PreviewPage>;

    /// Decompose a complex JSON file into named tables, `rows_per_table` rows each.
    async fn preview_all_tables(
        &self,
        file: &SourceFile,
        rows_per_table: u32,
    ) -> Result<MultiTablePreview>;

    async fn convert(
        &self,
        file: &SourceFile,
        format: TargetFormat,
        mode: ExportMode,
    ) -> Result<ConvertedFile>;

    /// Opaque feedback passthrough.
    async fn feedback(&self, email: Option<&str>, message: &str) -> Result<()>;

    async fn health(&self) -> Result<String> {
        Ok("ok".to_string())
    }
}

/// reqwest-backed client for the conversion service.
#[derive(Clone)]
pub struct HttpConversionApi {
    client: Client,
    base_url: String,
}

impl HttpConversionApi {
    /// `base_url` is the API root, e.g. `http://localhost:8000/api`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn file_part(file: &SourceFile) -> Result<Part> {
        Part::bytes(file.content().to_vec())
            .file_name(file.name().to_string())
            .mime_str(file.content_type())
            .map_err(|e| ToolkitError::InvalidInput(format!("Invalid content type: {}", e)))
    }

    async fn post_form(&self, path: &str, form: Form, fallback: &str) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self.client.post(&url).multipart(form).send().await?;
        check_status(response, fallback).await
    }
}

#[async_trait::async_trait]
impl ConversionApi for HttpConversionApi {
    async fn analyze(&self, file: &SourceFile) -> Result<ComplexityAnalysis> {
        let form = Form::new().part("file", Self::file_part(file)?);
        let response = self.post_form("analyze", form, "Failed to analyze file").await?;
        let analysis: ComplexityAnalysis = response.json().await?;

        info!(
            "Analyzed {}: complex={}, {} arrays, ~{} rows",
            file.name(),
            analysis.is_complex,
            analysis.arrays_found.len(),
            analysis.estimated_rows
        );
        Ok(analysis)
    }

    async fn preview(&self, file: &SourceFile, request: PreviewRequest) -> Result<PreviewPage> {
        let form = Form::new()
            .part("file", Self::file_part(file)?)
            .text("page", request.page.to_string())
            .text("page_size", request.page_size.to_string())
            .text("export_mode", request.export_mode.as_str());

        let response = self.post_form("preview", form, "Failed to preview file").await?;
        let page: PreviewPage = response.json().await?;

        info!(
            "Preview of {}: page {}/{}, {} rows of {}",
            file.name(),
            page.current_page,
            page.total_pages,
            page.rows.len(),
            page.total_rows
        );
        Ok(page)
    }

    async fn preview_all_tables(
        &self,
        file: &SourceFile,
        rows_per_table: u32,
    ) -> Result<MultiTablePreview> {
        let form = Form::new()
            .part("file", Self::file_part(file)?)
            .text("rows_per_table", rows_per_table.to_string());

        let response = self
            .post_form("preview-all-tables", form, "Failed to preview tables")
            .await?;
        let preview: MultiTablePreview = response.json().await?;

        info!("Multi-table preview of {}: {} tables", file.name(), preview.tables.len());
        Ok(preview)
    }

    async fn convert(
        &self,
        file: &SourceFile,
        format: TargetFormat,
        mode: ExportMode,
    ) -> Result<ConvertedFile> {
        let form = Form::new()
            .part("file", Self::file_part(file)?)
            .text("output_format", format.as_str())
            .text("export_mode", mode.as_str());

        let response = self.post_form("convert", form, "Failed to convert file").await?;

        let disposition = header_str(&response, "content-disposition");
        let filename = filename_from_disposition(disposition.as_deref(), format);
        let content_type = header_str(&response, "content-type")
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = response.bytes().await?;

        info!("Converted {} to {} ({} bytes)", file.name(), filename, bytes.len());
        Ok(ConvertedFile {
            filename,
            content_type,
            bytes,
        })
    }

    async fn feedback(&self, email: Option<&str>, message: &str) -> Result<()> {
        let body = FeedbackRequest {
            email: email.unwrap_or_default(),
            message,
        };

        let response = self.client.post(self.url("feedback")).json(&body).send().await?;
        check_status(response, "Failed to send feedback").await?;

        info!("Feedback sent");
        Ok(())
    }

    async fn health(&self) -> Result<String> {
        let response = self.client.get(self.url("health")).send().await?;
        let response = check_status(response, "Health check failed").await?;
        let body: HealthResponse = response.json().await?;
        Ok(body.status)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct FeedbackRequest<'a> {
    email: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Error body of the service (`detail`) or of the offline stand-in (`error`).
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Turn a non-2xx response into a [`ToolkitError`].
async fn check_status(response: reqwest::Response, fallback: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let err = error_from_body(status.as_u16(), &text, fallback);
    warn!("Conversion service returned {}: {}", status, err);
    Err(err)
}

/// Classify an error body. `detail` is surfaced verbatim; a 503 carrying only
/// `error` is the cache policy's offline response.
pub fn error_from_body(status: u16, body: &str, fallback: &str) -> ToolkitError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

    match (parsed.detail, parsed.error) {
        (Some(serde_json::Value::String(detail)), _) if !detail.is_empty() => {
            ToolkitError::RemoteRequestFailed { status, detail }
        }
        // FastAPI validation errors carry a list here
        (Some(detail), _) if !detail.is_null() => ToolkitError::RemoteRequestFailed {
            status,
            detail: detail.to_string(),
        },
        (_, Some(offline)) if status == 503 && !offline.is_empty() => {
            ToolkitError::OfflineSynthesized { detail: offline }
        }
        _ => ToolkitError::RemoteRequestFailed {
            status,
            detail: fallback.to_string(),
        },
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Suggested download name from a `Content-Disposition` value.
///
/// Prefers the RFC 5987 `filename*=UTF-8''...` form, then `filename="..."`,
/// then `converted.<format>`.
pub fn filename_from_disposition(disposition: Option<&str>, format: TargetFormat) -> String {
    static EXTENDED: OnceLock<Regex> = OnceLock::new();
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    static BARE: OnceLock<Regex> = OnceLock::new();

    let fallback = format!("converted.{}", format.as_str());
    let Some(disposition) = disposition else {
        return fallback;
    };

    let extended = EXTENDED.get_or_init(|| {
        Regex::new(r"(?i)filename\*\s*=\s*UTF-8''([^;\s]+)").expect("static regex")
    });
    if let Some(encoded) = extended.captures(disposition).and_then(|c| c.get(1)) {
        if let Ok(name) = percent_decode_str(encoded.as_str()).decode_utf8() {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    let quoted = QUOTED.get_or_init(|| Regex::new(r#"(?i)filename\s*=\s*"([^"]+)""#).expect("static regex"));
    if let Some(name) = quoted.captures(disposition).and_then(|c| c.get(1)) {
        return name.as_str().to_string();
    }

    let bare = BARE.get_or_init(|| Regex::new(r"(?i)filename\s*=\s*([^;\s]+)").expect("static regex"));
    if let Some(name) = bare.captures(disposition).and_then(|c| c.get(1)) {
        return name.as_str().to_string();
    }

    fallback
}
