//! CLI binary for edgequake-ocrbatch.
//!
//! A thin shim over the library crate: maps flags onto `BatchConfig`, turns
//! progress events into a terminal progress bar, and wires Ctrl-C to
//! cooperative cancellation.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocrbatch::{
    convert_batch, BackendKind, BatchConfig, BatchReport, CredentialStore, DocumentReport,
    EnvCredentialStore, ImageFormat, JobStatus, PageSeparator, ProgressEvent, ProgressSink,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one file into ./out/report.md
  ocrbatch report.pdf -o out

  # Convert every PDF in a folder
  ocrbatch scans/ -o out

  # Gentler on the API: 20 requests per minute, one page per render chunk
  ocrbatch --rpm 20 --single-page scans/

  # Use a vision LLM instead of the OCR endpoint
  ocrbatch --backend vision --model gpt-4.1-mini paper.pdf

  # Machine-readable batch report
  ocrbatch --json scans/ > report.json

RESUMING:
  Every converted page is checkpointed under <output>/.ocrbatch-checkpoints
  (or --checkpoint-dir). Re-run the same command after a crash, Ctrl-C, or a
  rejected key: only pages without a successful checkpoint are sent again.

EXIT CODES:
  0  every document completed with every page converted
  1  at least one document failed, was cancelled, or has failed pages
  2  the batch could not start (bad input, configuration)

ENVIRONMENT VARIABLES:
  MISTRAL_API_KEY         Key for the Mistral OCR backend
  OPENAI_API_KEY          Key for the vision backend (or ANTHROPIC_API_KEY, ...)
  EDGEQUAKE_LLM_PROVIDER  Vision backend provider override
  RUST_LOG                Log filter, e.g. RUST_LOG=edgequake_ocrbatch=debug
"#;

/// Convert PDF files to Markdown through a remote OCR service, resumably.
#[derive(Parser, Debug)]
#[command(
    name = "ocrbatch",
    version,
    about = "Resumable, rate-limited PDF → Markdown conversion through a remote OCR service",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files or folders containing PDFs.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for the Markdown output files.
    #[arg(short, long, env = "OCRBATCH_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Directory for page checkpoints [default: <output-dir>/.ocrbatch-checkpoints].
    #[arg(long, env = "OCRBATCH_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Keep checkpoints after a document completes cleanly.
    #[arg(long, env = "OCRBATCH_KEEP_CHECKPOINTS")]
    keep_checkpoints: bool,

    /// OCR backend.
    #[arg(long, env = "OCRBATCH_BACKEND", value_enum, default_value = "mistral")]
    backend: BackendArg,

    /// Model ID [default: mistral-ocr-latest / gpt-4.1-nano].
    #[arg(long, env = "OCRBATCH_MODEL")]
    model: Option<String>,

    /// Vision LLM provider (vision backend only).
    #[arg(long, env = "OCRBATCH_PROVIDER")]
    provider: Option<String>,

    /// Base URL of the OCR service (mistral backend only).
    #[arg(long, env = "OCRBATCH_API_BASE_URL", default_value = "https://api.mistral.ai")]
    api_base_url: String,

    /// Environment variable holding the OCR API key.
    #[arg(long, env = "OCRBATCH_KEY_VAR", default_value = EnvCredentialStore::DEFAULT_VAR)]
    key_var: String,

    /// Rendering DPI (72–400).
    #[arg(long, env = "OCRBATCH_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Upload image format.
    #[arg(long, env = "OCRBATCH_IMAGE_FORMAT", value_enum, default_value = "jpeg")]
    image_format: FormatArg,

    /// JPEG quality (1–100).
    #[arg(long, env = "OCRBATCH_IMAGE_QUALITY", default_value_t = 85,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    image_quality: u8,

    /// Pages rendered per chunk.
    #[arg(long, env = "OCRBATCH_CHUNK_SIZE", default_value_t = 5)]
    chunk_size: usize,

    /// Render one page at a time (lowest memory).
    #[arg(long, env = "OCRBATCH_SINGLE_PAGE")]
    single_page: bool,

    /// Nominal request rate.
    #[arg(long = "rpm", env = "OCRBATCH_REQUESTS_PER_MINUTE", default_value_t = 60)]
    requests_per_minute: u32,

    /// Retries per page on transient failure.
    #[arg(long, env = "OCRBATCH_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call timeout in seconds.
    #[arg(long, env = "OCRBATCH_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "OCRBATCH_SEPARATOR", default_value = "none")]
    separator: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "OCRBATCH_PASSWORD")]
    password: Option<String>,

    /// Print the batch report as JSON on stdout.
    #[arg(long, env = "OCRBATCH_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "OCRBATCH_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCRBATCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCRBATCH_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum BackendArg {
    Mistral,
    Vision,
}

impl From<BackendArg> for BackendKind {
    fn from(v: BackendArg) -> Self {
        match v {
            BackendArg::Mistral => BackendKind::Mistral,
            BackendArg::Vision => BackendKind::Vision,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum FormatArg {
    Jpeg,
    Png,
}

impl From<FormatArg> for ImageFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Jpeg => ImageFormat::Jpeg,
            FormatArg::Png => ImageFormat::Png,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(report) if report.all_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<BatchReport> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-page feedback, so library logs drop to
    // errors while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentialStore::new(&cli.key_var));

    // ── Ctrl-C → cooperative cancel ──────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let quiet = cli.quiet;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if !quiet {
                    eprintln!(
                        "\n{} Cancelling after the current page; completed pages are kept…",
                        yellow("⚠")
                    );
                }
                cancel.cancel();
            }
        });
    }

    // ── Progress display ─────────────────────────────────────────────────
    let (sink, events) = if show_progress {
        let (sink, rx) = ProgressSink::channel();
        (sink, Some(rx))
    } else {
        (ProgressSink::noop(), None)
    };
    let display = events.map(|rx| tokio::spawn(render_progress(rx)));

    // ── Run ──────────────────────────────────────────────────────────────
    let result = convert_batch(&cli.inputs, &config, credentials, &cancel, &sink).await;
    drop(sink);
    if let Some(task) = display {
        let _ = task.await;
    }
    let report = result.context("Batch could not start")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_summary(&report);
    }

    Ok(report)
}

/// Map CLI args to `BatchConfig`.
fn build_config(cli: &Cli) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .output_dir(&cli.output_dir)
        .keep_checkpoints(cli.keep_checkpoints)
        .backend(cli.backend.clone().into())
        .api_base_url(&cli.api_base_url)
        .dpi(cli.dpi)
        .image_format(cli.image_format.clone().into())
        .image_quality(cli.image_quality)
        .chunk_size(cli.chunk_size)
        .single_page_mode(cli.single_page)
        .requests_per_minute(cli.requests_per_minute)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .page_separator(parse_separator(&cli.separator));

    if let Some(ref dir) = cli.checkpoint_dir {
        builder = builder.checkpoint_dir(dir);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}

/// Drive one progress bar per document from engine events.
async fn render_progress(mut events: UnboundedReceiver<ProgressEvent>) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS),
    );
    bar.set_prefix("Preparing");
    bar.set_message("Opening PDF…");
    bar.enable_steady_tick(Duration::from_millis(80));

    let page_style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>3}/{len} pages  \
         ⏱ {elapsed_precise}  ETA {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS);

    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::DocumentStarted {
                document,
                total_pages,
                already_completed,
            } => {
                bar.set_style(page_style.clone());
                bar.set_length(total_pages as u64);
                bar.set_position(already_completed as u64);
                bar.set_prefix(short_name(&document));
                bar.reset_eta();
                if already_completed > 0 {
                    bar.println(format!(
                        "{} {}  {}",
                        cyan("◆"),
                        bold(&document),
                        dim(&format!("resuming, {already_completed}/{total_pages} pages on disk"))
                    ));
                } else {
                    bar.println(format!("{} {}", cyan("◆"), bold(&document)));
                }
            }
            ProgressEvent::PageCompleted { .. } => bar.inc(1),
            ProgressEvent::PageFailed {
                page,
                total_pages,
                reason,
                ..
            } => {
                let msg = if reason.chars().count() > 80 {
                    format!("{}…", reason.chars().take(79).collect::<String>())
                } else {
                    reason
                };
                bar.println(format!(
                    "  {} Page {:>3}/{:<3}  {}",
                    red("✗"),
                    page,
                    total_pages,
                    red(&msg)
                ));
                bar.inc(1);
            }
            ProgressEvent::DocumentFinished(report) => {
                bar.println(format!("  {}", document_line(&report)));
            }
            ProgressEvent::BatchFinished(_) => break,
        }
    }
    bar.finish_and_clear();
}

fn short_name(document: &str) -> String {
    // Drop the hash suffix of the document id.
    match document.rsplit_once('-') {
        Some((stem, hash)) if hash.len() == 16 => stem.to_string(),
        _ => document.to_string(),
    }
}

fn document_line(report: &DocumentReport) -> String {
    let pages = match report.total_pages {
        Some(total) => format!("{}/{} pages", report.completed_pages, total),
        None => "-".to_string(),
    };
    match report.status {
        JobStatus::Completed if report.failed_pages.is_empty() => format!(
            "{} {}  {}  →  {}",
            green("✔"),
            report.source.display(),
            pages,
            report
                .output
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
        JobStatus::Completed => format!(
            "{} {}  {}  failed pages {:?} (re-run to retry them)",
            yellow("⚠"),
            report.source.display(),
            pages,
            report.failed_pages
        ),
        JobStatus::Cancelled => format!(
            "{} {}  {}  cancelled",
            yellow("■"),
            report.source.display(),
            pages
        ),
        JobStatus::Pending | JobStatus::Running => format!(
            "{} {}  not started{}",
            dim("○"),
            report.source.display(),
            report
                .error
                .as_ref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        ),
        JobStatus::Failed => format!(
            "{} {}  {}  {}",
            red("✘"),
            report.source.display(),
            pages,
            red(report.error.as_deref().unwrap_or("failed"))
        ),
    }
}

fn print_summary(report: &BatchReport) {
    let done = report.count(JobStatus::Completed);
    let total = report.documents.len();
    if report.all_clean() {
        eprintln!("{} {} document(s) converted", green("✔"), bold(&done.to_string()));
    } else {
        eprintln!(
            "{} {}/{} document(s) completed  ({} failed, {} cancelled, {} not started)",
            if done == 0 { red("✘") } else { cyan("⚠") },
            bold(&done.to_string()),
            total,
            report.count(JobStatus::Failed),
            report.count(JobStatus::Cancelled),
            report.count(JobStatus::Pending),
        );
    }
    if let Some(ref reason) = report.halted {
        eprintln!("  {} batch halted: {}", red("✘"), reason);
    }
}
