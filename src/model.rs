//! Data types exchanged with the conversion service and held by the session.
//!
//! Wire types mirror the service's JSON bodies field for field; everything else
//! (file identity, kinds, formats) is local bookkeeping.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, ToolkitError};

// ============================================================================
// File kinds and formats
// ============================================================================

/// Input kinds the conversion service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Json,
    Csv,
    Xlsx,
    Xls,
}

impl FileKind {
    /// Parse an extension or a service `detected_type` (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('.').to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
        }
    }

    /// Kinds whose raw bytes a user can repair by hand in the editor.
    pub fn is_text_parseable(&self) -> bool {
        matches!(self, Self::Json | Self::Csv)
    }

    /// Allowed output formats for this input kind.
    pub fn conversion_targets(&self) -> &'static [TargetFormat] {
        match self {
            Self::Json => &[TargetFormat::Csv, TargetFormat::Xlsx],
            Self::Csv => &[TargetFormat::Json, TargetFormat::Xlsx],
            Self::Xlsx | Self::Xls => &[TargetFormat::Json, TargetFormat::Csv],
        }
    }

    pub fn can_convert_to(&self, target: TargetFormat) -> bool {
        self.conversion_targets().contains(&target)
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::Xls => "application/vnd.ms-excel",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output formats accepted by the `convert` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Csv,
    Xlsx,
    Json,
}

impl TargetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Json => "json",
        }
    }

    /// Label used on the download buttons.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Csv => "CSV",
            Self::Xlsx => "Excel",
            Self::Json => "JSON",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFormat {
    type Err = ToolkitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "xlsx" | "excel" => Ok(Self::Xlsx),
            "json" => Ok(Self::Json),
            other => Err(ToolkitError::InvalidInput(format!(
                "Unknown output format: {}. Supported: csv, xlsx, json",
                other
            ))),
        }
    }
}

/// How nested JSON is flattened for preview and conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    #[default]
    Normal,
    /// Arrays kept as embedded text, one row per record.
    SingleRow,
    /// Each array becomes its own table.
    MultiTable,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::SingleRow => "single_row",
            Self::MultiTable => "multi_table",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportMode {
    type Err = ToolkitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "normal" => Ok(Self::Normal),
            "single_row" => Ok(Self::SingleRow),
            "multi_table" => Ok(Self::MultiTable),
            other => Err(ToolkitError::InvalidInput(format!("Unknown export mode: {}", other))),
        }
    }
}

// ============================================================================
// Source file
// ============================================================================

/// Identity of one selected (or rebuilt) file. A fresh id is minted for every
/// selection and every edit-retry, so late responses can be matched against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user-selected file, or the edited text that replaced it.
#[derive(Debug, Clone)]
pub struct SourceFile {
    id: FileId,
    name: String,
    content_type: String,
    content: Bytes,
}

impl SourceFile {
    /// Wrap selected content. The content type is taken from the extension.
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let name = name.into();
        let content_type = FileKind::parse(&extension_of(&name))
            .map(|k| k.mime_type())
            .unwrap_or("application/octet-stream")
            .to_string();

        Self {
            id: FileId::new(),
            name,
            content_type,
            content: content.into(),
        }
    }

    /// Read a file from disk, keeping only its final path component as the name.
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self::new(name, content))
    }

    /// Rebuild a file from hand-edited text, keeping the original name.
    pub fn from_edited_text(original: &SourceFile, text: impl Into<String>) -> Self {
        let text: String = text.into();
        let content_type = match original.kind() {
            Some(FileKind::Json) => "application/json",
            Some(FileKind::Csv) => "text/csv",
            _ => "text/plain",
        };

        Self {
            id: FileId::new(),
            name: original.name.clone(),
            content_type: content_type.to_string(),
            content: Bytes::from(text),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Lowercased extension without the dot; empty if the name has none.
    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::parse(&self.extension())
    }

    /// Decode the content as UTF-8 for the editor.
    pub fn read_text(&self) -> Result<String> {
        String::from_utf8(self.content.to_vec()).map_err(|_| ToolkitError::UnreadableFile {
            name: self.name.clone(),
        })
    }
}

fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => String::new(),
    }
}

// ============================================================================
// Service payloads
// ============================================================================

/// One array found by the complexity analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayInfo {
    pub path: String,
    pub count: u64,
}

/// Pre-flight inspection of a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    pub is_complex: bool,
    #[serde(default)]
    pub arrays_found: Vec<ArrayInfo>,
    #[serde(default)]
    pub estimated_rows: u64,
    #[serde(default)]
    pub expansion_formula: String,
}

/// One page of tabular preview data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewPage {
    pub detected_type: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub total_rows: u64,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default = "first_page")]
    pub total_pages: u32,
}

fn first_page() -> u32 {
    1
}

impl PreviewPage {
    pub fn detected_kind(&self) -> Option<FileKind> {
        FileKind::parse(&self.detected_type)
    }
}

/// One named table of a multi-table decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePreview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub total_rows: u64,
}

/// A complex JSON file decomposed into several named tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiTablePreview {
    pub tables: BTreeMap<String, TablePreview>,
}

/// Binary payload returned by `convert`, ready to be saved.
#[derive(Debug, Clone)]
pub struct ConvertedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl ConvertedFile {
    /// Write the payload into `dir`. Only the final component of the suggested
    /// name is used.
    pub async fn save_into(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let name = Path::new(&self.filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "download".to_string());
        let path = dir.join(name);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

/// Render a cell for display: null is blank, structured values are compact JSON.
pub fn format_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}
