//! Command-line front end driving the orchestrator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use parsewiz::api::{ConversionApi, HttpConversionApi};
use parsewiz::cache::{CachePolicy, CacheStorage, ReqwestNetwork};
use parsewiz::config::{CacheConfig, ClientConfig};
use parsewiz::model::{format_cell, ExportMode, SourceFile, TargetFormat};
use parsewiz::orchestrator::Orchestrator;
use parsewiz::proxy;
use parsewiz::session::{Phase, PreviewView, SessionState};

#[derive(Debug, Parser)]
#[command(name = "parsewiz", about = "Preview and convert JSON, CSV and Excel files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Preview one page of a file.
    Preview {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Accept the multi-table export choice for complex JSON.
        #[arg(long)]
        proceed_complex: bool,
        /// Show the single-row structure instead of the table set.
        #[arg(long)]
        single_row: bool,
        /// Corrected text to retry with if the file fails to parse.
        #[arg(long)]
        edited: Option<PathBuf>,
    },
    /// Convert a file and save the result.
    Export {
        file: PathBuf,
        /// Target format: csv, xlsx (excel) or json.
        #[arg(long)]
        to: String,
        /// Export mode for complex JSON: multi_table or single_row.
        #[arg(long)]
        mode: Option<String>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Send feedback to the maintainers.
    Feedback {
        #[arg(long)]
        message: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Check that the conversion service is up.
    Health,
    /// Run the caching proxy in front of the web origin.
    Serve,
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve => {
            let config = CacheConfig::from_env()?;
            let policy = CachePolicy::new(
                config.clone(),
                CacheStorage::new(),
                Arc::new(ReqwestNetwork::default()),
            )?;
            proxy::serve(config, Arc::new(policy)).await
        }
        Command::Health => {
            let config = ClientConfig::from_env()?;
            let api = HttpConversionApi::new(&config.api_base);
            let status = api.health().await?;
            println!("{}", status);
            Ok(())
        }
        Command::Feedback { message, email } => {
            let orchestrator = orchestrator()?;
            orchestrator.send_feedback(email.as_deref(), &message).await?;
            println!("Thank you for your feedback!");
            Ok(())
        }
        Command::Preview {
            file,
            page,
            proceed_complex,
            single_row,
            edited,
        } => {
            let orchestrator = orchestrator()?;
            let choice = ComplexChoice {
                proceed: proceed_complex,
                declined: "Complex JSON export declined; pass --proceed-complex to continue",
            };
            open(&orchestrator, &file, choice, edited.as_deref()).await?;

            if single_row {
                orchestrator.toggle_view(PreviewView::Single);
            }
            if page > 1 && orchestrator.go_to_page(page).await.is_none() {
                anyhow::bail!("Page {} is out of range", page);
            }

            let state = orchestrator.snapshot();
            fail_on_error(&state)?;
            render(&state)
        }
        Command::Export {
            file,
            to,
            mode,
            out,
        } => {
            let format: TargetFormat = to.parse()?;
            let mode = mode.map(|m| m.parse::<ExportMode>()).transpose()?;

            let orchestrator = orchestrator()?;
            open(&orchestrator, &file, export_choice(mode), None).await?;
            if mode == Some(ExportMode::SingleRow) {
                orchestrator.toggle_view(PreviewView::Single);
            }
            fail_on_error(&orchestrator.snapshot())?;

            let converted = orchestrator.export_as(format).await?;
            let path = converted
                .save_into(&out)
                .await
                .with_context(|| format!("Failed to save into {:?}", out))?;
            println!("Saved {}", path.display());
            Ok(())
        }
    }
}

/// How to answer the complex-JSON prompt, and what to say when declining it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComplexChoice {
    proceed: bool,
    declined: &'static str,
}

/// Only the two flattening modes accept the prompt; `normal` cannot express nested arrays.
fn export_choice(mode: Option<ExportMode>) -> ComplexChoice {
    match mode {
        Some(ExportMode::MultiTable | ExportMode::SingleRow) => ComplexChoice {
            proceed: true,
            declined: "",
        },
        Some(ExportMode::Normal) => ComplexChoice {
            proceed: false,
            declined: "Export mode 'normal' is not available for complex JSON; use --mode multi_table or --mode single_row",
        },
        None => ComplexChoice {
            proceed: false,
            declined: "Complex JSON needs --mode multi_table or --mode single_row",
        },
    }
}

fn orchestrator() -> Result<Orchestrator<HttpConversionApi>> {
    let config = ClientConfig::from_env()?;
    info!("Using conversion service at {}", config.api_base);
    let api = HttpConversionApi::new(&config.api_base);
    Ok(Orchestrator::new(api, config))
}

/// Select the file and walk it through the complex-JSON and edit-fallback branches.
async fn open(
    orchestrator: &Orchestrator<HttpConversionApi>,
    path: &Path,
    choice: ComplexChoice,
    edited: Option<&Path>,
) -> Result<()> {
    let file = SourceFile::load(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;

    let mut phase = orchestrator.submit_file(file, 1).await;

    if phase == Phase::ChoosingExportMode {
        let state = orchestrator.snapshot();
        if let Some(analysis) = &state.analysis {
            eprintln!(
                "Complex JSON: {} arrays, ~{} rows ({})",
                analysis.arrays_found.len(),
                analysis.estimated_rows,
                analysis.expansion_formula
            );
            for array in &analysis.arrays_found {
                eprintln!("  {} ({} items)", array.path, array.count);
            }
        }
        phase = orchestrator.resolve_export_mode(choice.proceed).await?;
        if !choice.proceed {
            anyhow::bail!("{}", choice.declined);
        }
    }

    if phase == Phase::Editing {
        let state = orchestrator.snapshot();
        let message = state.editor.map(|e| e.message).unwrap_or_default();
        let Some(edited) = edited else {
            anyhow::bail!("{} (fix the file and pass it with --edited)", message);
        };
        eprintln!("Parse failed: {}; retrying with {:?}", message, edited);
        let text = tokio::fs::read_to_string(edited)
            .await
            .with_context(|| format!("Failed to read {:?}", edited))?;
        orchestrator.retry_parse(text).await?;
    }

    Ok(())
}

fn fail_on_error(state: &SessionState) -> Result<()> {
    match (&state.phase, &state.error) {
        (Phase::Error | Phase::Editing, Some(notice)) => anyhow::bail!("{}", notice.message),
        (Phase::Error | Phase::Editing, None) => anyhow::bail!("Failed to preview file"),
        _ => Ok(()),
    }
}

fn render(state: &SessionState) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if let Some(file) = &state.file {
        let detected = state.cached_detected_type.as_deref().unwrap_or("?").to_uppercase();
        writeln!(out, "{} ({})", file.name(), detected)?;
    }

    if state.shows_multi_table() {
        if let Some(multi) = &state.multi_table {
            for (name, table) in &multi.tables {
                writeln!(out, "## {} ({} rows)", name, table.total_rows)?;
                write_csv(&mut out, &table.columns, &table.rows)?;
            }
        }
    } else if let Some(preview) = &state.preview {
        if let Some(label) = state.row_range_label() {
            writeln!(out, "{}", label)?;
        }
        writeln!(out, "{}", state.page_label())?;
        write_csv(&mut out, &preview.columns, &preview.rows)?;
    }

    let options: Vec<String> = state
        .conversion_options()
        .iter()
        .map(|f| format!("Download as {}", f.label()))
        .collect();
    if !options.is_empty() {
        writeln!(out, "{}", options.join(" | "))?;
    }
    Ok(())
}

fn write_csv<W: Write>(out: &mut W, columns: &[String], rows: &[Vec<serde_json::Value>]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(out);
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(row.iter().map(format_cell))?;
    }
    writer.flush()?;
    Ok(())
}
