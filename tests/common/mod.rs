#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::Notify;

use parsewiz::api::{ConversionApi, PreviewRequest};
use parsewiz::config::ClientConfig;
use parsewiz::model::{
    ArrayInfo, ComplexityAnalysis, ConvertedFile, ExportMode, MultiTablePreview, PreviewPage,
    SourceFile, TablePreview, TargetFormat,
};
use parsewiz::{Result, ToolkitError};

type AnalyzeFn = Box<dyn Fn(&SourceFile) -> Result<ComplexityAnalysis> + Send + Sync>;
type PreviewFn = Box<dyn Fn(&SourceFile, PreviewRequest) -> Result<PreviewPage> + Send + Sync>;
type TablesFn = Box<dyn Fn(&SourceFile, u32) -> Result<MultiTablePreview> + Send + Sync>;
type ConvertFn = Box<dyn Fn(&SourceFile, TargetFormat, ExportMode) -> Result<ConvertedFile> + Send + Sync>;

/// In-memory conversion service with per-operation scripts and a call log.
pub struct ScriptedApi {
    analyze: AnalyzeFn,
    preview: PreviewFn,
    tables: TablesFn,
    convert: ConvertFn,
    /// Preview calls for these file names block until the gate is opened.
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self {
            analyze: Box::new(|_| Ok(simple_analysis())),
            preview: Box::new(|file, req| Ok(page_for(file, req, 3))),
            tables: Box::new(|_, rows| Ok(items_tables(rows))),
            convert: Box::new(|file, format, _| {
                Ok(ConvertedFile {
                    filename: format!("{}.{}", stem(file.name()), format),
                    content_type: "application/octet-stream".to_string(),
                    bytes: Bytes::from_static(b"converted"),
                })
            }),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedApi {
    pub fn with_analyze(
        mut self,
        f: impl Fn(&SourceFile) -> Result<ComplexityAnalysis> + Send + Sync + 'static,
    ) -> Self {
        self.analyze = Box::new(f);
        self
    }

    pub fn with_preview(
        mut self,
        f: impl Fn(&SourceFile, PreviewRequest) -> Result<PreviewPage> + Send + Sync + 'static,
    ) -> Self {
        self.preview = Box::new(f);
        self
    }

    pub fn with_tables(
        mut self,
        f: impl Fn(&SourceFile, u32) -> Result<MultiTablePreview> + Send + Sync + 'static,
    ) -> Self {
        self.tables = Box::new(f);
        self
    }

    pub fn with_convert(
        mut self,
        f: impl Fn(&SourceFile, TargetFormat, ExportMode) -> Result<ConvertedFile> + Send + Sync + 'static,
    ) -> Self {
        self.convert = Box::new(f);
        self
    }

    /// Hold previews of `name` until the returned gate is notified.
    pub fn gate(&self, name: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(op)).count()
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

#[async_trait::async_trait]
impl ConversionApi for ScriptedApi {
    async fn analyze(&self, file: &SourceFile) -> Result<ComplexityAnalysis> {
        self.log(format!("analyze {}", file.name()));
        (self.analyze)(file)
    }

    async fn preview(&self, file: &SourceFile, request: PreviewRequest) -> Result<PreviewPage> {
        self.log(format!(
            "preview {} page={} size={} mode={}",
            file.name(),
            request.page,
            request.page_size,
            request.export_mode
        ));
        let gate = self.gates.lock().unwrap().get(file.name()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        (self.preview)(file, request)
    }

    async fn preview_all_tables(&self, file: &SourceFile, rows_per_table: u32) -> Result<MultiTablePreview> {
        self.log(format!("tables {} rows={}", file.name(), rows_per_table));
        (self.tables)(file, rows_per_table)
    }

    async fn convert(&self, file: &SourceFile, format: TargetFormat, mode: ExportMode) -> Result<ConvertedFile> {
        self.log(format!("convert {} to={} mode={}", file.name(), format, mode));
        (self.convert)(file, format, mode)
    }

    async fn feedback(&self, email: Option<&str>, message: &str) -> Result<()> {
        self.log(format!("feedback {} {}", email.unwrap_or("anonymous"), message));
        Ok(())
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        api_base: "http://service.test/api".to_string(),
        ..ClientConfig::default()
    }
}

pub fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name)
}

pub fn simple_analysis() -> ComplexityAnalysis {
    ComplexityAnalysis {
        is_complex: false,
        arrays_found: Vec::new(),
        estimated_rows: 1,
        expansion_formula: "1".to_string(),
    }
}

pub fn complex_analysis(count: u64) -> ComplexityAnalysis {
    ComplexityAnalysis {
        is_complex: true,
        arrays_found: vec![ArrayInfo {
            path: "items".to_string(),
            count,
        }],
        estimated_rows: count,
        expansion_formula: count.to_string(),
    }
}

/// A one-page preview of `rows` rows whose cells name the file they came from.
pub fn page_for(file: &SourceFile, req: PreviewRequest, rows: usize) -> PreviewPage {
    PreviewPage {
        detected_type: file.extension(),
        columns: vec!["source".to_string(), "n".to_string()],
        rows: (0..rows).map(|i| vec![json!(file.name()), json!(i)]).collect(),
        total_rows: rows as u64,
        current_page: req.page,
        total_pages: 1,
    }
}

pub fn items_tables(rows: u32) -> MultiTablePreview {
    let mut preview = MultiTablePreview::default();
    preview.tables.insert(
        "root".to_string(),
        TablePreview {
            columns: vec!["order_id".to_string()],
            rows: vec![vec![json!(1)]],
            total_rows: 1,
        },
    );
    preview.tables.insert(
        "items".to_string(),
        TablePreview {
            columns: vec!["order_id".to_string(), "sku".to_string()],
            rows: (0..rows).map(|i| vec![json!(1), json!(format!("SKU-{}", i))]).collect(),
            total_rows: 10_000,
        },
    );
    preview
}

pub fn remote_error(detail: &str) -> ToolkitError {
    ToolkitError::RemoteRequestFailed {
        status: 400,
        detail: detail.to_string(),
    }
}
