//! CLI binary for zpl2pdf.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ServiceConfig`, converts one file directly or several files as a batch,
//! and prints results.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use zpl2pdf::{
    inspect, BatchFile, BatchOrchestrator, BatchRequest, BatchStatus, ConversionProgressCallback,
    ConvertOptions, Converter, FileStatus, InMemoryJobStore, LabelSize, LabelaryRenderer,
    LocalDirStore, OutputFormat, PdfiumEngine, PlanTier, ProgressCallback, RenderDispatcher,
    ServiceConfig, UnlimitedUsage,
};

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

// ── CLI progress callback using indicatif ────────────────────────────────────

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// Terminal progress callback: one bar over renderer chunks plus a log line
/// per chunk. Chunks may finish out of order once `--max-in-flight` > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-chunk start times (queue wait included).
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_conversion_start` reports the chunk count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Parsing ZPL…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Rendering");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, chunk_num: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&chunk_num))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_chunks: usize) {
        self.activate_bar(total_chunks);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Queueing {total_chunks} renderer chunks…"))
        ));
    }

    fn on_chunk_start(&self, chunk_num: usize, _total_chunks: usize, label_count: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(chunk_num, Instant::now());
        }
        self.bar
            .set_message(format!("chunk {chunk_num} ({label_count} labels)"));
    }

    fn on_chunk_complete(&self, chunk_num: usize, total_chunks: usize, pdf_len: usize) {
        let secs = self.elapsed_secs(chunk_num);
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            chunk_num,
            total_chunks,
            dim(&format!("{:>7} bytes", pdf_len)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, chunk_num: usize, total_chunks: usize, error: &str) {
        let secs = self.elapsed_secs(chunk_num);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}  {}",
            red("✗"),
            chunk_num,
            total_chunks,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_chunks: usize, rendered: usize) {
        self.bar.finish_and_clear();
        let failed = total_chunks.saturating_sub(rendered);
        if failed == 0 {
            eprintln!(
                "{} {} chunks rendered",
                green("✔"),
                bold(&rendered.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} chunks rendered  ({} failed)",
                red("✘"),
                bold(&rendered.to_string()),
                total_chunks,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document to PDF (writes labels.pdf)
  zpl2pdf labels.zpl

  # Choose the output path and label size
  zpl2pdf labels.zpl -o out/shipment.pdf --label-size 4x6

  # One PNG per label, packed in a .tar.gz
  zpl2pdf --format png labels.zpl -o labels.tar.gz

  # Batch: several files, one archive in the output directory
  zpl2pdf a.zpl b.zpl c.zpl -o out/

  # Show how a document would be chunked (no renderer calls)
  zpl2pdf --inspect-only --json labels.zpl

  # Self-hosted renderer with more headroom
  zpl2pdf --renderer-url http://localhost:8080/v1 --max-in-flight 4 \
          --min-interval-ms 0 labels.zpl

ENVIRONMENT VARIABLES:
  ZPL2PDF_RENDERER_URL    Renderer base URL (default: http://api.labelary.com/v1)
  ZPL2PDF_LABEL_CAP       Labels per renderer call (default: 50)
  ZPL2PDF_MAX_IN_FLIGHT   Concurrent renderer calls (default: 1)
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Overrides the log filter

NOTES:
  Identical labels are rendered once and copied locally, so a document of
  thousands of repeated labels costs a single renderer call. Output page
  order always matches the order of labels in the input, with ^PQ copies
  expanded in place.
"#;

/// Convert ZPL label documents to PDF or images.
#[derive(Parser, Debug)]
#[command(
    name = "zpl2pdf",
    version,
    about = "Convert ZPL label documents to PDF, PNG or JPEG",
    long_about = "Convert ZPL (Zebra Programming Language) label documents to PDF, PNG or JPEG \
through a Labelary-compatible renderer. Duplicate labels are rendered once and every renderer \
call is paced to stay inside the renderer's rate limits.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// ZPL files to convert. More than one file runs a batch.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output file (single input) or directory (batch).
    #[arg(short, long, env = "ZPL2PDF_OUTPUT")]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(long, env = "ZPL2PDF_FORMAT", value_enum, default_value = "pdf")]
    format: FormatArg,

    /// Label size in inches, e.g. 4x6 or 2.25x1.25.
    #[arg(long, env = "ZPL2PDF_LABEL_SIZE", default_value = "4x6")]
    label_size: String,

    /// Print density in dots per millimetre (6, 8, 12 or 24).
    #[arg(long, env = "ZPL2PDF_DPMM", default_value_t = 8)]
    dpmm: u8,

    /// Queue priority: free, pro, enterprise.
    #[arg(long, env = "ZPL2PDF_TIER", default_value = "free")]
    tier: String,

    /// Renderer base URL.
    #[arg(long, env = "ZPL2PDF_RENDERER_URL")]
    renderer_url: Option<String>,

    /// Maximum labels per renderer call.
    #[arg(long, env = "ZPL2PDF_LABEL_CAP", default_value_t = 50)]
    label_cap: usize,

    /// Renderer calls allowed in flight at once.
    #[arg(long, env = "ZPL2PDF_MAX_IN_FLIGHT", default_value_t = 1)]
    max_in_flight: usize,

    /// Minimum spacing between renderer calls, in milliseconds.
    #[arg(long, env = "ZPL2PDF_MIN_INTERVAL_MS", default_value_t = 350)]
    min_interval_ms: u64,

    /// Per-call renderer timeout in seconds.
    #[arg(long, env = "ZPL2PDF_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// JPEG quality (1–100).
    #[arg(long, env = "ZPL2PDF_JPEG_QUALITY", default_value_t = 85,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Raster width in pixels for image output.
    #[arg(long, env = "ZPL2PDF_WIDTH", default_value_t = 1200)]
    width: u32,

    /// Refuse documents that expand to more labels than this.
    #[arg(long, env = "ZPL2PDF_MAX_LABELS", default_value_t = 10_000)]
    max_labels: usize,

    /// Batch files converted at the same time.
    #[arg(long, env = "ZPL2PDF_BATCH_CONCURRENCY", default_value_t = 1)]
    batch_concurrency: usize,

    /// Parse and plan only; print label and chunk counts.
    #[arg(long)]
    inspect_only: bool,

    /// Print results as JSON on stdout.
    #[arg(long, env = "ZPL2PDF_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "ZPL2PDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "ZPL2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "ZPL2PDF_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Pdf,
    Png,
    Jpeg,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Pdf => OutputFormat::Pdf,
            FormatArg::Png => OutputFormat::Png,
            FormatArg::Jpeg => OutputFormat::Jpeg,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar covers what INFO logs would say.
    let single = cli.inputs.len() == 1;
    let show_progress = single && !cli.quiet && !cli.no_progress && !cli.json && !cli.inspect_only;
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

    let config = Arc::new(build_config(&cli)?);
    let tier: PlanTier = cli.tier.parse().context("Invalid --tier")?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        for path in &cli.inputs {
            let zpl = read_input(path).await?;
            let summary = inspect(&zpl, &config)
                .with_context(|| format!("Failed to plan {}", path.display()))?
                .summary();
            if cli.json {
                let json = serde_json::to_string_pretty(&summary)
                    .context("Failed to serialise summary")?;
                println!("{json}");
            } else {
                println!("File:           {}", path.display());
                println!("Blocks:         {}", summary.blocks);
                println!("Labels:         {}", summary.total_labels);
                println!("Unique labels:  {}", summary.unique_labels);
                println!("Renderer calls: {}", summary.chunks);
                println!("Largest chunk:  {}", summary.largest_chunk);
            }
        }
        return Ok(());
    }

    // ── Build the pipeline ───────────────────────────────────────────────
    let renderer = Arc::new(LabelaryRenderer::new(&config).context("Invalid renderer settings")?);
    let dispatcher = RenderDispatcher::new(renderer, &config);
    let engine = Arc::new(PdfiumEngine::new().context("pdfium is not available")?);
    let converter = Arc::new(Converter::new(dispatcher, engine, Arc::clone(&config)));

    if single {
        convert_single(&cli, &converter, tier, show_progress).await
    } else {
        convert_batch(&cli, converter, tier).await
    }
}

async fn convert_single(
    cli: &Cli,
    converter: &Converter<PdfiumEngine>,
    tier: PlanTier,
    show_progress: bool,
) -> Result<()> {
    let input = &cli.inputs[0];
    let zpl = read_input(input).await?;
    let format: OutputFormat = cli.format.into();
    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(input, format));

    let mut opts = ConvertOptions::new(job_label(input), "local", tier).with_format(format);
    if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        opts = opts.with_progress(cb as ProgressCallback);
    }

    let stats = converter
        .convert_to_file(&zpl, &output_path, &opts)
        .await
        .context("Conversion failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&stats).context("Failed to serialise stats")?;
        println!("{json}");
    } else if !cli.quiet {
        eprintln!(
            "{}  {}/{} labels  {} unique  {} renderer calls  {}ms  →  {}",
            if stats.skipped_units == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            stats.output_units,
            stats.total_labels,
            stats.unique_labels,
            stats.renderer_calls,
            stats.total_duration_ms,
            bold(&output_path.display().to_string()),
        );
        if stats.skipped_units > 0 {
            eprintln!(
                "   {} labels could not be assembled",
                red(&stats.skipped_units.to_string())
            );
        }
    }
    Ok(())
}

async fn convert_batch(
    cli: &Cli,
    converter: Arc<Converter<PdfiumEngine>>,
    tier: PlanTier,
) -> Result<()> {
    let mut files = Vec::with_capacity(cli.inputs.len());
    for path in &cli.inputs {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        files.push(BatchFile {
            name,
            zpl: read_input(path).await?,
        });
    }

    let out_dir = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let store = Arc::new(LocalDirStore::new(&out_dir));

    let orchestrator = BatchOrchestrator::new(
        converter,
        Arc::clone(&store) as Arc<dyn zpl2pdf::ObjectStore>,
        Arc::new(UnlimitedUsage),
        Arc::new(InMemoryJobStore::new()),
    );
    let batch = orchestrator
        .run(BatchRequest {
            user_id: "local".to_string(),
            tier,
            files,
            format: Some(cli.format.into()),
            label_size: None,
        })
        .await
        .context("Batch failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&batch).context("Failed to serialise batch")?;
        println!("{json}");
    } else if !cli.quiet {
        for file in &batch.files {
            match file.status {
                FileStatus::Completed => eprintln!(
                    "  {} {:<32} {}",
                    green("✓"),
                    file.file_name,
                    dim(&format!("{} labels", file.label_count))
                ),
                _ => eprintln!(
                    "  {} {:<32} {}",
                    red("✗"),
                    file.file_name,
                    red(file.error.as_deref().unwrap_or("failed"))
                ),
            }
        }
        let archive = batch
            .archive
            .as_ref()
            .map(|obj| store.path_of(obj).display().to_string())
            .unwrap_or_else(|| "no archive".to_string());
        eprintln!(
            "{}  {}/{} files  →  {}",
            match batch.status {
                BatchStatus::Completed => green("✔"),
                BatchStatus::Partial => cyan("⚠"),
                _ => red("✘"),
            },
            batch.completed_files(),
            batch.files.len(),
            bold(&archive),
        );
    }

    if batch.status == BatchStatus::Failed {
        bail!("No file in the batch could be converted");
    }
    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let label_size: LabelSize = cli.label_size.parse().context("Invalid --label-size")?;

    let mut builder = ServiceConfig::builder()
        .label_cap(cli.label_cap)
        .max_in_flight(cli.max_in_flight)
        .min_call_interval_ms(cli.min_interval_ms)
        .request_timeout_secs(cli.timeout)
        .dpmm(cli.dpmm)
        .label_size(label_size)
        .output_format(cli.format.into())
        .jpeg_quality(cli.jpeg_quality)
        .raster_width_px(cli.width)
        .max_labels(cli.max_labels)
        .batch_concurrency(cli.batch_concurrency);

    if let Some(ref url) = cli.renderer_url {
        builder = builder.renderer_url(url);
    }

    builder.build().context("Invalid configuration")
}

async fn read_input(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// `labels.zpl` → `labels.pdf` / `labels.tar.gz`, next to the input.
fn default_output(input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "labels".to_string());
    input.with_file_name(format!("{stem}.{}", format.artifact_extension()))
}

/// Job id used in logs: the input's file name, so log lines are greppable.
fn job_label(input: &Path) -> String {
    input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".to_string())
}
