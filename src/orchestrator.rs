//! Preview/export workflow orchestrator.
//!
//! Owns the [`SessionState`] and issues every remote call. Each primary request is
//! tagged with the identity of the file it was issued for plus the session
//! generation; a response whose tag is no longer current is dropped instead of
//! being applied over newer state. Nothing is cancelled.

use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::api::{ConversionApi, PreviewRequest};
use crate::config::ClientConfig;
use crate::error::{Result, ToolkitError};
use crate::model::{ConvertedFile, ExportMode, FileId, FileKind, SourceFile, TargetFormat};
use crate::session::{transition, Event, Phase, PreviewView, SessionState};

/// Drives the workflow against a [`ConversionApi`].
pub struct Orchestrator<A: ConversionApi> {
    api: Arc<A>,
    config: ClientConfig,
    state: Arc<RwLock<SessionState>>,
}

impl<A: ConversionApi> Clone for Orchestrator<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Tag carried by an in-flight request.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    file_id: FileId,
    generation: u64,
}

impl<A: ConversionApi + 'static> Orchestrator<A> {
    pub fn new(api: A, config: ClientConfig) -> Self {
        Self::with_shared_api(Arc::new(api), config)
    }

    pub fn with_shared_api(api: Arc<A>, config: ClientConfig) -> Self {
        let state = SessionState::new(config.page_size);
        Self {
            api,
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Copy of the current session state for rendering.
    pub fn snapshot(&self) -> SessionState {
        self.read(|s| s.clone())
    }

    pub fn phase(&self) -> Phase {
        self.read(|s| s.phase)
    }

    /// Select `file` (if it is not already the active one) and load `page`.
    ///
    /// Returns the phase the session ends up in. If a newer request superseded
    /// this one while it was in flight, the phase of that newer state is returned.
    pub async fn submit_file(&self, file: SourceFile, page: u32) -> Phase {
        let page = page.max(1);

        let (ticket, export_mode) = self.write(|state| {
            let mut next = std::mem::take(state);
            if next.active_file_id() != Some(file.id()) {
                info!("Selected file {} ({} bytes)", file.name(), file.content().len());
                next = transition(next, Event::FileSelected(file.clone()));
            }
            next = transition(next, Event::RequestIssued { page });
            *state = next;
            (
                Ticket {
                    file_id: file.id(),
                    generation: state.generation,
                },
                state.export_mode,
            )
        });

        if page == 1 && file.kind() == Some(FileKind::Json) && export_mode == ExportMode::Normal {
            match self.api.analyze(&file).await {
                Ok(analysis) if analysis.is_complex => {
                    info!(
                        "{} is complex: {} ({} rows estimated)",
                        file.name(),
                        analysis.expansion_formula,
                        analysis.estimated_rows
                    );
                    return self.apply_for(ticket, Event::AnalysisComplex(analysis));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("Analysis of {} failed: {}", file.name(), err);
                    return self.apply_for(
                        ticket,
                        Event::PreviewFailed {
                            page,
                            message: err.user_message(),
                        },
                    );
                }
            }
        }

        let request = PreviewRequest {
            page,
            page_size: self.config.page_size,
            export_mode,
        };

        let event = match self.api.preview(&file, request).await {
            Ok(preview) => Event::PreviewLoaded {
                preview,
                page_size: request.page_size,
            },
            Err(err) => {
                warn!("Preview of {} page {} failed: {}", file.name(), page, err);
                Event::PreviewFailed {
                    page,
                    message: err.user_message(),
                }
            }
        };

        self.apply_for(ticket, event)
    }

    /// Load page `n` of the active file. Returns `None` (and does nothing) when
    /// no file is active or `n` is outside `1..=total_pages`.
    pub async fn go_to_page(&self, n: u32) -> Option<Phase> {
        let file = self.read(|s| s.file.clone().filter(|_| s.can_go_to(n)))?;
        Some(self.submit_file(file, n).await)
    }

    /// Replace the active file with hand-edited text and preview it again.
    pub async fn retry_parse(&self, edited_text: impl Into<String>) -> Result<Phase> {
        let original = self.read(|s| s.file.clone()).ok_or(ToolkitError::NoActiveFile)?;
        let edited = SourceFile::from_edited_text(&original, edited_text);

        info!("Retrying {} with edited content ({} bytes)", edited.name(), edited.content().len());
        self.apply(Event::FileEdited(edited.clone()));

        Ok(self.submit_file(edited, 1).await)
    }

    /// Answer the complex-JSON prompt. Declining abandons the file.
    ///
    /// Proceeding fetches the multi-table preview and a small single-row preview
    /// concurrently; state is committed only if both succeed.
    pub async fn resolve_export_mode(&self, proceed: bool) -> Result<Phase> {
        if !proceed {
            info!("Complex export declined, resetting session");
            return Ok(self.reset());
        }

        let (file, ticket) = self.try_write(|state| {
            if state.phase != Phase::ChoosingExportMode {
                return Err(ToolkitError::InvalidInput(
                    "No export mode choice is pending".to_string(),
                ));
            }
            let file = state.file.clone().ok_or(ToolkitError::NoActiveFile)?;
            *state = transition(std::mem::take(state), Event::RequestIssued { page: 1 });
            let ticket = Ticket {
                file_id: file.id(),
                generation: state.generation,
            };
            Ok((file, ticket))
        })?;

        let single_request = PreviewRequest {
            page: 1,
            page_size: self.config.single_row_preview_rows,
            export_mode: ExportMode::SingleRow,
        };

        let (tables, single) = tokio::join!(
            self.api.preview_all_tables(&file, self.config.table_preview_rows),
            self.api.preview(&file, single_request),
        );

        let event = match (tables, single) {
            (Ok(multi_table), Ok(single_row)) => {
                info!(
                    "Resolved {} into {} tables",
                    file.name(),
                    multi_table.tables.len()
                );
                Event::ExportModeResolved {
                    multi_table,
                    single_row,
                    page_size: single_request.page_size,
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!("Export mode resolution for {} failed: {}", file.name(), err);
                Event::ExportModeFailed {
                    message: err.user_message(),
                }
            }
        };

        Ok(self.apply_for(ticket, event))
    }

    /// Switch between the cached multi-table and single-row structures. No network call.
    pub fn toggle_view(&self, view: PreviewView) -> ExportMode {
        self.apply(Event::ViewToggled(view));
        self.read(|s| s.export_mode)
    }

    /// Convert the active file on the service and return the payload to save.
    ///
    /// Targets outside the compatibility table of the detected type are rejected
    /// locally. Failures are shown as a notice but never touch the session data.
    pub async fn export_as(&self, format: TargetFormat) -> Result<ConvertedFile> {
        let (file, kind, mode) = self.read(|s| {
            let file = s.file.clone();
            let kind = s.detected_kind().or_else(|| file.as_ref().and_then(|f| f.kind()));
            (file, kind, s.export_mode)
        });

        let file = file.ok_or(ToolkitError::NoActiveFile)?;
        let kind = kind.ok_or_else(|| {
            ToolkitError::InvalidInput(format!("Unknown source type for {}", file.name()))
        })?;
        if !kind.can_convert_to(format) {
            return Err(ToolkitError::UnsupportedConversion {
                from: kind,
                to: format,
            });
        }

        info!("Exporting {} as {} (mode={})", file.name(), format, mode);
        match self.api.convert(&file, format, mode).await {
            Ok(converted) => Ok(converted),
            Err(err) => {
                warn!("Export of {} failed: {}", file.name(), err);
                let still_active = self.read(|s| s.active_file_id() == Some(file.id()));
                if still_active {
                    self.apply(Event::ExportFailed {
                        message: err.user_message(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Pass user feedback through to the service.
    pub async fn send_feedback(&self, email: Option<&str>, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(ToolkitError::InvalidInput("Message is required".to_string()));
        }
        let email = email.map(str::trim).filter(|e| !e.is_empty());
        self.api.feedback(email, message).await
    }

    /// Drop the file and every cached result.
    pub fn reset(&self) -> Phase {
        self.apply(Event::Reset)
    }

    pub fn dismiss_error(&self, id: u64) {
        self.apply(Event::ErrorDismissed { id });
    }

    // ------------------------------------------------------------------------
    // State plumbing
    // ------------------------------------------------------------------------

    fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn try_write<R>(&self, f: impl FnOnce(&mut SessionState) -> Result<R>) -> Result<R> {
        self.write(f)
    }

    fn apply(&self, event: Event) -> Phase {
        self.commit(None, event)
    }

    fn apply_for(&self, ticket: Ticket, event: Event) -> Phase {
        self.commit(Some(ticket), event)
    }

    /// Apply `event` under the write lock, unless `ticket` is stale.
    fn commit(&self, ticket: Option<Ticket>, event: Event) -> Phase {
        let (phase, raised) = self.write(|state| {
            if let Some(t) = ticket {
                if !state.accepts(t.file_id, t.generation) {
                    debug!(
                        "Discarding stale response for file {} (generation {}, current {})",
                        t.file_id, t.generation, state.generation
                    );
                    return (state.phase, None);
                }
            }

            let before = state.error.as_ref().map(|e| e.id);
            *state = transition(std::mem::take(state), event);
            let after = state.error.as_ref().map(|e| e.id);

            debug!("Session phase: {:?}", state.phase);
            (state.phase, after.filter(|id| Some(*id) != before))
        });

        if let Some(id) = raised {
            self.schedule_dismiss(id);
        }
        phase
    }

    /// Clear notice `id` after the configured delay, unless a newer one replaced it.
    fn schedule_dismiss(&self, id: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let delay = self.config.error_dismiss_after;

        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
            *guard = transition(std::mem::take(&mut *guard), Event::ErrorDismissed { id });
        });
    }
}
