//! CLI binary for edgequake-alttext.
//!
//! A thin shim over the library crate: reads a JSON manifest of candidate
//! images, maps CLI flags onto `DescriberConfig`, runs one batch and prints
//! the resulting alt text.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_alttext::{
    read_manifest, CandidateImage, DescribeProgressCallback, Describer, DescriberConfig,
    ImageError, Outcome, PageImage, ProgressCallback, SkipReason,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar plus a log line per finished image.
/// Images finish out of order, so start times are keyed by locator.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        bar.set_style(style);
        bar.set_prefix("Describing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, locator: &str) -> String {
        let ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(locator)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }
}

impl DescribeProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_images: usize) {
        self.bar.set_length(total_images as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Describing {total_images} images…"))
        ));
    }

    fn on_image_start(&self, locator: &str) {
        self.start_times
            .lock()
            .unwrap()
            .insert(locator.to_string(), Instant::now());
        self.bar.set_message(shorten(locator, 48));
    }

    fn on_image_complete(&self, locator: &str, description: &str) {
        self.bar.println(format!(
            "  {} {}  {}  {}",
            green("✓"),
            shorten(locator, 48),
            dim(&shorten(description, 60)),
            self.elapsed(locator),
        ));
        self.bar.inc(1);
    }

    fn on_image_skipped(&self, locator: &str, reason: SkipReason) {
        self.bar.println(format!(
            "  {} {}  {}",
            dim("·"),
            shorten(locator, 48),
            dim(skip_label(reason)),
        ));
        self.bar.inc(1);
    }

    fn on_image_error(&self, locator: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            shorten(locator, 48),
            red(&shorten(error, 80)),
            self.elapsed(locator),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_images: usize, described: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);

        if failed == 0 {
            eprintln!(
                "{} {}/{} images described",
                green("✔"),
                bold(&described.to_string()),
                total_images
            );
        } else {
            eprintln!(
                "{} {}/{} images described  ({} failed)",
                if failed == total_images {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&described.to_string()),
                total_images,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Describe every image in a manifest, TSV on stdout
  alttext images.json

  # JSON report written to a file
  alttext --json images.json -o report.json

  # Slow model server: one request at a time, 2s apart
  alttext --concurrency 1 --delay-ms 2000 images.json

  # Load settings from a config file, override the endpoint
  alttext --config alttext.json --endpoint http://10.0.0.5:8000/describe images.json

MANIFEST FORMAT:
  [
    {"src": "https://example.com/hero.jpg", "width": 1200, "height": 800},
    {"src": "data:image/png;base64,iVBORw0KGgo...", "width": 32, "height": 32, "alt": "icon"}
  ]

ENVIRONMENT VARIABLES:
  ALTTEXT_ENDPOINT        Description service URL
  ALTTEXT_CONFIG          Path to a JSON config file
  ALTTEXT_CONCURRENCY     Max concurrent description requests
  ALTTEXT_DELAY_MS        Pause between dispatches per slot
  RUST_LOG                Overrides the log filter
"#;

/// Generate alt text for page images with a local vision service.
#[derive(Parser, Debug)]
#[command(
    name = "alttext",
    version,
    about = "Generate alt text for page images with a local vision service",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON manifest of candidate images.
    manifest: PathBuf,

    /// Write the report to this file instead of stdout.
    #[arg(short, long, env = "ALTTEXT_OUTPUT")]
    output: Option<PathBuf>,

    /// JSON config file; flags override its values.
    #[arg(long, env = "ALTTEXT_CONFIG")]
    config: Option<PathBuf>,

    /// Description service URL.
    #[arg(long, env = "ALTTEXT_ENDPOINT")]
    endpoint: Option<String>,

    /// Multipart field carrying the image.
    #[arg(long, env = "ALTTEXT_FORM_FIELD")]
    form_field: Option<String>,

    /// Max concurrent description requests.
    #[arg(short, long, env = "ALTTEXT_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Pause between dispatches per slot, in milliseconds.
    #[arg(long, env = "ALTTEXT_DELAY_MS")]
    delay_ms: Option<u64>,

    /// Attempts per image, including the first.
    #[arg(long, env = "ALTTEXT_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Base retry backoff in milliseconds (doubles per attempt).
    #[arg(long, env = "ALTTEXT_RETRY_BACKOFF_MS")]
    retry_backoff_ms: Option<u64>,

    /// Per-request timeout for the description service, in milliseconds.
    #[arg(long, env = "ALTTEXT_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Timeout for fetching image bytes, in milliseconds.
    #[arg(long, env = "ALTTEXT_FETCH_TIMEOUT_MS")]
    fetch_timeout_ms: Option<u64>,

    /// Skip images whose payload exceeds this many megabytes.
    #[arg(long, env = "ALTTEXT_MAX_SIZE_MB")]
    max_size_mb: Option<u64>,

    /// JPEG quality for rendered rasters (0.0–1.0).
    #[arg(long, env = "ALTTEXT_QUALITY")]
    quality: Option<f32>,

    /// Output a JSON report instead of TSV.
    #[arg(long, env = "ALTTEXT_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "ALTTEXT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "ALTTEXT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "ALTTEXT_QUIET")]
    quiet: bool,
}

/// One row of the report.
#[derive(Debug, Serialize)]
struct ReportRow {
    src: String,
    width: u32,
    height: u32,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar gives all the feedback that matters; keep library logs quiet
    // while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress;
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

    // ── Build describer ──────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let mut describer = Describer::new(config).context("Failed to start describer")?;
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        describer = describer.with_progress(cb);
    }

    // ── Run batch ────────────────────────────────────────────────────────
    let entries = read_manifest(&cli.manifest)
        .await
        .context("Failed to load manifest")?;
    let images: Vec<PageImage> = entries.into_iter().map(PageImage::from).collect();

    let report = describer.process_batch(&images).await;
    describer.shutdown();

    let rows: Vec<ReportRow> = images
        .iter()
        .zip(&report.outcomes)
        .map(|(image, outcome)| report_row(image, &outcome.result))
        .collect();

    // ── Write report ─────────────────────────────────────────────────────
    let rendered = if cli.json {
        let mut json = serde_json::to_string_pretty(&rows).context("Failed to serialise report")?;
        json.push('\n');
        json
    } else {
        render_tsv(&rows)
    };

    match &cli.output {
        Some(path) => tokio::fs::write(path, rendered)
            .await
            .with_context(|| format!("Failed to write report to {:?}", path))?,
        None => io::stdout()
            .lock()
            .write_all(rendered.as_bytes())
            .context("Failed to write to stdout")?,
    }

    if !cli.quiet && !show_progress {
        eprintln!(
            "Described {}/{} images in {}ms ({} restored, {} skipped, {} failed)",
            report.described,
            report.total,
            report.duration_ms,
            report.restored,
            report.skipped,
            report.failed
        );
    }

    if report.total > 0 && report.failed == report.total {
        anyhow::bail!("Every image failed; is the description service running?");
    }
    Ok(())
}

/// Map CLI args onto `DescriberConfig`, layered over an optional config file.
fn build_config(cli: &Cli) -> Result<DescriberConfig> {
    let base = match &cli.config {
        Some(path) => DescriberConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => DescriberConfig::default(),
    };

    let mut builder = base.to_builder();
    if let Some(endpoint) = &cli.endpoint {
        builder = builder.endpoint(endpoint.clone());
    }
    if let Some(field) = &cli.form_field {
        builder = builder.form_field(field.clone());
    }
    if let Some(n) = cli.concurrency {
        builder = builder.max_concurrent(n);
    }
    if let Some(ms) = cli.delay_ms {
        builder = builder.request_delay_ms(ms);
    }
    if let Some(n) = cli.max_retries {
        builder = builder.max_retries(n);
    }
    if let Some(ms) = cli.retry_backoff_ms {
        builder = builder.retry_backoff_ms(ms);
    }
    if let Some(ms) = cli.timeout_ms {
        builder = builder.request_timeout_ms(ms);
    }
    if let Some(ms) = cli.fetch_timeout_ms {
        builder = builder.fetch_timeout_ms(ms);
    }
    if let Some(mb) = cli.max_size_mb {
        builder = builder.max_image_size_mb(mb);
    }
    if let Some(q) = cli.quality {
        builder = builder.jpeg_quality(q);
    }

    builder.build().context("Invalid configuration")
}

fn report_row(image: &PageImage, result: &Result<Outcome, ImageError>) -> ReportRow {
    let (width, height) = image.natural_size();
    let (status, error) = match result {
        Ok(Outcome::Described(_)) => ("described", None),
        Ok(Outcome::Restored(_)) => ("restored", None),
        Ok(Outcome::Skipped(reason)) => (skip_label(*reason), None),
        Err(e) => ("failed", Some(e.to_string())),
    };
    ReportRow {
        src: image.locator().to_string(),
        width,
        height,
        status,
        alt: image.alt_text(),
        error,
    }
}

fn render_tsv(rows: &[ReportRow]) -> String {
    let mut out = String::from("src\tstatus\talt\n");
    for row in rows {
        let alt = row.alt.as_deref().or(row.error.as_deref()).unwrap_or("");
        out.push_str(&format!(
            "{}\t{}\t{}\n",
            tsv_field(&row.src),
            row.status,
            tsv_field(alt)
        ));
    }
    out
}

fn tsv_field(s: &str) -> String {
    s.replace(['\t', '\n', '\r'], " ")
}

fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::AlreadyProcessed => "already-processed",
        SkipReason::InFlight => "in-flight",
        SkipReason::TooLarge { .. } => "too-large",
    }
}

fn shorten(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\u{2026}", &s[..idx]),
        None => s.to_string(),
    }
}
