//! Session state machine of the preview/export workflow.
//!
//! All transitions are pure: [`transition`] takes the current [`SessionState`]
//! and an [`Event`] and returns the next state. Network calls live in the
//! orchestrator, which feeds their outcomes back in as events.

use crate::config::DEFAULT_PAGE_SIZE;
use crate::model::{
    ComplexityAnalysis, ExportMode, FileId, FileKind, MultiTablePreview, PreviewPage, SourceFile,
    TargetFormat,
};

/// Workflow phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Previewing,
    Editing,
    ChoosingExportMode,
    Error,
}

/// Which cached structure is rendered in the complex-JSON branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewView {
    Multi,
    Single,
}

/// Raw-text editor shown when a structured file fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorState {
    pub text: String,
    pub message: String,
}

/// Visible error banner. `id` lets a delayed dismissal clear only the notice it was scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub id: u64,
    pub message: String,
}

/// Displayed row window of the current preview page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

/// Everything the orchestrator knows about the active session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub file: Option<SourceFile>,
    pub current_page: u32,
    pub total_pages: u32,
    /// Rows per page for regular previews.
    pub page_size: u32,
    pub cached_columns: Vec<String>,
    pub cached_detected_type: Option<String>,
    pub export_mode: ExportMode,
    pub analysis: Option<ComplexityAnalysis>,
    pub preview: Option<PreviewPage>,
    /// Page size the current `preview` was requested with.
    pub preview_page_size: u32,
    pub multi_table: Option<MultiTablePreview>,
    /// Set only in the complex-JSON branch.
    pub view: Option<PreviewView>,
    pub editor: Option<EditorState>,
    pub error: Option<ErrorNotice>,
    /// Generation of the newest primary request.
    pub generation: u64,
    notice_seq: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new file was selected; everything cached for the previous one is dropped.
    FileSelected(SourceFile),
    /// Edited text replaced the active file (same name, new identity).
    FileEdited(SourceFile),
    /// A primary request (analyze/preview/dual preview) went out.
    RequestIssued { page: u32 },
    AnalysisComplex(ComplexityAnalysis),
    PreviewLoaded { preview: PreviewPage, page_size: u32 },
    PreviewFailed { page: u32, message: String },
    ExportModeResolved {
        multi_table: MultiTablePreview,
        single_row: PreviewPage,
        page_size: u32,
    },
    ExportModeFailed { message: String },
    ViewToggled(PreviewView),
    /// Export failed; session data stays as it is.
    ExportFailed { message: String },
    ErrorDismissed { id: u64 },
    Reset,
}

impl SessionState {
    pub fn new(page_size: u32) -> Self {
        Self {
            phase: Phase::Idle,
            file: None,
            current_page: 1,
            total_pages: 1,
            page_size,
            cached_columns: Vec::new(),
            cached_detected_type: None,
            export_mode: ExportMode::Normal,
            analysis: None,
            preview: None,
            preview_page_size: page_size,
            multi_table: None,
            view: None,
            editor: None,
            error: None,
            generation: 0,
            notice_seq: 0,
        }
    }

    pub fn active_file_id(&self) -> Option<FileId> {
        self.file.as_ref().map(|f| f.id())
    }

    /// Whether a response tagged with `(file_id, generation)` may still be applied.
    pub fn accepts(&self, file_id: FileId, generation: u64) -> bool {
        self.active_file_id() == Some(file_id) && self.generation == generation
    }

    /// Whether `goToPage(page)` would do anything.
    pub fn can_go_to(&self, page: u32) -> bool {
        self.file.is_some() && page >= 1 && page <= self.total_pages
    }

    pub fn can_go_previous(&self) -> bool {
        self.current_page > 1
    }

    pub fn can_go_next(&self) -> bool {
        self.current_page < self.total_pages
    }

    pub fn row_range(&self) -> Option<RowRange> {
        let preview = self.preview.as_ref()?;
        let start = u64::from(preview.current_page.max(1) - 1) * u64::from(self.preview_page_size) + 1;
        let end = (start + preview.rows.len() as u64)
            .saturating_sub(1)
            .min(preview.total_rows);
        Some(RowRange {
            start,
            end,
            total: preview.total_rows,
        })
    }

    /// "Showing 1-3 of 3 rows".
    pub fn row_range_label(&self) -> Option<String> {
        self.row_range()
            .map(|r| format!("Showing {}-{} of {} rows", r.start, r.end, r.total))
    }

    /// "Page 1 of 4".
    pub fn page_label(&self) -> String {
        format!("Page {} of {}", self.current_page, self.total_pages)
    }

    pub fn detected_kind(&self) -> Option<FileKind> {
        self.cached_detected_type.as_deref().and_then(FileKind::parse)
    }

    /// Download targets offered for the detected type.
    pub fn conversion_options(&self) -> &'static [TargetFormat] {
        self.detected_kind()
            .map(|k| k.conversion_targets())
            .unwrap_or(&[])
    }

    /// The structure currently rendered in the complex branch, if any.
    pub fn shows_multi_table(&self) -> bool {
        self.view == Some(PreviewView::Multi) && self.multi_table.is_some()
    }

    fn raise(&mut self, message: String) {
        self.notice_seq += 1;
        self.error = Some(ErrorNotice {
            id: self.notice_seq,
            message,
        });
    }

    /// Clear everything but configuration and counters.
    fn cleared(self) -> Self {
        Self {
            generation: self.generation,
            notice_seq: self.notice_seq,
            ..Self::new(self.page_size)
        }
    }

    fn take_preview(&mut self, preview: PreviewPage, page_size: u32) {
        self.current_page = preview.current_page.max(1);
        self.total_pages = preview.total_pages.max(1);
        self.cached_columns = preview.columns.clone();
        self.cached_detected_type = Some(preview.detected_type.clone());
        self.preview_page_size = page_size;
        self.preview = Some(preview);
    }
}

/// Apply one event. Pure: no I/O, no clocks.
pub fn transition(state: SessionState, event: Event) -> SessionState {
    let mut state = state;

    match event {
        Event::FileSelected(file) => {
            let mut next = state.cleared();
            next.file = Some(file);
            next
        }

        Event::FileEdited(file) => {
            // Structures derived from the replaced content go with it; the edit
            // goes through the complexity check again.
            state.file = Some(file);
            state.analysis = None;
            state.export_mode = ExportMode::Normal;
            state.multi_table = None;
            state.view = None;
            state
        }

        Event::RequestIssued { page } => {
            state.generation += 1;
            state.current_page = page;
            state.phase = Phase::Loading;
            state.error = None;
            state
        }

        Event::AnalysisComplex(analysis) => {
            state.analysis = Some(analysis);
            state.phase = Phase::ChoosingExportMode;
            state
        }

        Event::PreviewLoaded { preview, page_size } => {
            state.take_preview(preview, page_size);
            state.editor = None;
            if state.export_mode == ExportMode::Normal {
                state.multi_table = None;
                state.view = None;
            }
            state.phase = Phase::Previewing;
            state
        }

        Event::PreviewFailed { page, message } => {
            if page > 1 {
                // Keep what is already on screen.
                if let Some(shown) = state.preview.as_ref() {
                    state.current_page = shown.current_page.max(1);
                }
                state.phase = Phase::Error;
                state.raise(message);
                return state;
            }

            let editable = state
                .file
                .as_ref()
                .filter(|f| f.kind().map(|k| k.is_text_parseable()).unwrap_or(false))
                .map(|f| f.read_text());

            match editable {
                Some(Ok(text)) => {
                    state.editor = Some(EditorState {
                        text,
                        message: message.clone(),
                    });
                    state.phase = Phase::Editing;
                    state.raise(message);
                    state
                }
                Some(Err(unreadable)) => {
                    let mut next = state.cleared();
                    next.phase = Phase::Error;
                    next.raise(unreadable.user_message());
                    next
                }
                None => {
                    let mut next = state.cleared();
                    next.phase = Phase::Error;
                    next.raise(message);
                    next
                }
            }
        }

        Event::ExportModeResolved {
            multi_table,
            single_row,
            page_size,
        } => {
            state.take_preview(single_row, page_size);
            state.multi_table = Some(multi_table);
            state.export_mode = ExportMode::MultiTable;
            state.view = Some(PreviewView::Multi);
            state.editor = None;
            state.phase = Phase::Previewing;
            state
        }

        Event::ExportModeFailed { message } => {
            state.phase = Phase::Error;
            state.raise(message);
            state
        }

        Event::ViewToggled(view) => {
            if state.multi_table.is_none() || state.view.is_none() {
                return state;
            }
            state.view = Some(view);
            state.export_mode = match view {
                PreviewView::Multi => ExportMode::MultiTable,
                PreviewView::Single => ExportMode::SingleRow,
            };
            state
        }

        Event::ExportFailed { message } => {
            state.raise(message);
            state
        }

        Event::ErrorDismissed { id } => {
            if state.error.as_ref().map(|e| e.id) == Some(id) {
                state.error = None;
            }
            state
        }

        Event::Reset => state.cleared(),
    }
}
