//! CLI binary for loan-intake.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `IntakeConfig`, runs one intake and prints the report.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use loan_intake::{
    IntakeConfig, IntakePipeline, IntakeReport, IntakeUpload, PageWindow, ReconciliationVerdict,
};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Application only (identifier checks report "missing or invalid")
  loan-intake application.pdf

  # Full intake with both supporting images
  loan-intake application.docx \
      --industry-license il.jpg --commercial-registration cr.png

  # Machine-readable report
  loan-intake application.pdf --json > report.json

  # Different template: identifiers on page 2, blank fields on last 3 pages
  loan-intake --identifier-page 2 --missing-pages 3 application.pdf

ENVIRONMENT VARIABLES:
  ANTHROPIC_API_KEY       Anthropic API key (default models are Claude)
  OPENAI_API_KEY          OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Provider name when --provider is not given
  PDFIUM_LIB_PATH         Directory or file of an existing libpdfium
  RUST_LOG                Overrides the log filter

  Values may also be placed in a .env file in the working directory.

REQUIREMENTS:
  DOCX input needs LibreOffice (`soffice`) on PATH or --soffice.
"#;

/// Check a loan application against its supporting licences with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "loan-intake",
    version,
    about = "Check a loan application against its supporting licences with Vision LLMs",
    long_about = "Rasterise a loan-application PDF or DOCX, extract identifiers, blank fields \
and inconsistencies with a vision model, read the industry license and commercial registration \
images, and report whether the registration numbers match.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Loan application (.pdf or .docx).
    application: PathBuf,

    /// Industry license image (.jpg / .png).
    #[arg(long, env = "LOAN_INTAKE_INDUSTRY_LICENSE")]
    industry_license: Option<PathBuf>,

    /// Commercial registration image (.jpg / .png).
    #[arg(long, env = "LOAN_INTAKE_COMMERCIAL_REGISTRATION")]
    commercial_registration: Option<PathBuf>,

    /// Directory holding the prompt templates.
    #[arg(long, env = "LOAN_INTAKE_PROMPTS_DIR", default_value = "prompts")]
    prompts_dir: PathBuf,

    /// LLM provider: anthropic, openai, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model for the loan application.
    #[arg(long, env = "LOAN_INTAKE_MODEL", default_value = loan_intake::config::DEFAULT_MODEL)]
    model: String,

    /// Model for the supporting images.
    #[arg(long, env = "LOAN_INTAKE_SUPPORTING_MODEL", default_value = loan_intake::config::DEFAULT_MODEL)]
    supporting_model: String,

    /// Rendering DPI (72–600).
    #[arg(long, env = "LOAN_INTAKE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Concurrent model calls per sub-task.
    #[arg(short, long, env = "LOAN_INTAKE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Page (1-indexed) carrying the registration numbers.
    #[arg(long, env = "LOAN_INTAKE_IDENTIFIER_PAGE", default_value_t = 3)]
    identifier_page: usize,

    /// Number of trailing pages checked for blank fields.
    #[arg(long, env = "LOAN_INTAKE_MISSING_PAGES", default_value_t = 4)]
    missing_pages: usize,

    /// Apply digit extraction to supporting-document values before comparing.
    #[arg(long, env = "LOAN_INTAKE_NORMALIZE_SUPPORTING")]
    normalize_supporting: bool,

    /// LibreOffice executable used for DOCX conversion.
    #[arg(long, env = "LOAN_INTAKE_SOFFICE", default_value = "soffice")]
    soffice: PathBuf,

    /// Directory (or file) of the pdfium library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Retries per model call.
    #[arg(long, env = "LOAN_INTAKE_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-call model timeout in seconds.
    #[arg(long, env = "LOAN_INTAKE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Per-task timeout in seconds.
    #[arg(long, env = "LOAN_INTAKE_TASK_TIMEOUT", default_value_t = 600)]
    task_timeout: u64,

    /// Output the full report as JSON.
    #[arg(long)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "LOAN_INTAKE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the report.
    #[arg(short, long, env = "LOAN_INTAKE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner is the user's feedback; library INFO logs would tear it.
    let show_progress = !cli.quiet && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let pipeline = IntakePipeline::from_config(config).context("Failed to set up model provider")?;

    let upload = IntakeUpload::from_paths(
        &cli.application,
        cli.industry_license.as_deref(),
        cli.commercial_registration.as_deref(),
    )
    .await
    .context("Failed to read uploads")?;

    let spinner = show_progress.then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Processing");
        bar.set_message(upload.application.name.clone());
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let report = pipeline.run(&upload).await;

    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else {
        print!("{report}");
        if !cli.quiet {
            print_summary(&report);
        }
    }

    Ok(())
}

fn print_summary(report: &IntakeReport) {
    let mark = |v: ReconciliationVerdict| match v {
        ReconciliationVerdict::Matched => green("✔"),
        ReconciliationVerdict::Mismatched => red("✘"),
        ReconciliationVerdict::Unavailable => cyan("?"),
    };
    eprintln!(
        "{} industry license  {} commercial registration  {}",
        mark(report.industry_license.verdict),
        mark(report.commercial_registration.verdict),
        dim(&format!(
            "{} calls, {} tokens in / {} out, {}ms",
            report.stats.usage.calls,
            report.stats.usage.input_tokens,
            report.stats.usage.output_tokens,
            report.stats.total_duration_ms
        )),
    );
}

/// Map CLI args to `IntakeConfig`.
fn build_config(cli: &Cli) -> Result<IntakeConfig> {
    let mut builder = IntakeConfig::builder()
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .document_model(cli.model.clone())
        .supporting_model(cli.supporting_model.clone())
        .prompts_dir(cli.prompts_dir.clone())
        .soffice_path(cli.soffice.clone())
        .identifier_pages(PageWindow::Page(cli.identifier_page))
        .missing_field_pages(PageWindow::Last(cli.missing_pages))
        .normalize_supporting_identifiers(cli.normalize_supporting)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .task_timeout_secs(cli.task_timeout);

    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref dir) = cli.pdfium_lib {
        builder = builder.pdfium_lib_path(dir.clone());
    }

    builder.build().context("Invalid configuration")
}
