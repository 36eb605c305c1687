//! CLI binary for edgequake-fileconv.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, runs every input through `ConversionService` and
//! prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_fileconv::engine::tools::EngineTools;
use edgequake_fileconv::{
    CancellationToken, ConversionConfig, ConversionService, ConvertError, ConvertOptions,
    ErrorKind, InspectReport, JobEvent, JobObserver, WrittenOutput,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Terminal observer: one bar over all inputs; the message shows which
/// engine is busy with what. Per-input result lines are printed by `main`.
struct CliObserver {
    bar: ProgressBar,
    engine_started: Mutex<HashMap<Uuid, Instant>>,
}

impl CliObserver {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            engine_started: Mutex::new(HashMap::new()),
        })
    }

    fn engine_secs(&self, job_id: &Uuid) -> Option<f64> {
        self.engine_started
            .lock()
            .ok()?
            .remove(job_id)
            .map(|t| t.elapsed().as_secs_f64())
    }
}

impl JobObserver for CliObserver {
    fn on_job_admitted(&self, job: &JobEvent) {
        self.bar
            .set_message(format!("{} → {}", job.filename, job.target));
    }

    fn on_engine_start(&self, job: &JobEvent) {
        if let Ok(mut m) = self.engine_started.lock() {
            m.insert(job.job_id, Instant::now());
        }
        self.bar
            .set_message(format!("{} → {} ({})", job.filename, job.target, job.engine));
    }

    fn on_job_complete(&self, job: &JobEvent, _output_len: Option<u64>) {
        if let Some(secs) = self.engine_secs(&job.job_id) {
            self.bar.set_message(format!("{} done in {secs:.1}s", job.filename));
        }
    }

    fn on_job_failed(&self, job: &JobEvent, _kind: ErrorKind, _message: &str) {
        self.engine_secs(&job.job_id);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Office document to PDF (written next to the current directory)
  fileconv report.docx

  # Explicit target and output path
  fileconv slides.pptx --to pdf -o out/slides.pdf

  # Resize an image to fit 800 px wide, as WebP
  fileconv photo.jpg --to webp --width 800

  # Extract the audio track of a video
  fileconv talk.mp4 --to mp3

  # Several inputs into one directory, JSON result per input
  fileconv *.odt --to pdf -o converted/ --json

  # Write to stdout
  fileconv diagram.png --to jpg -o - > diagram.jpg

  # Convert from URL
  fileconv https://example.com/files/sheet.xlsx --to csv

  # What is this file and what can it become?
  fileconv --inspect-only mystery.bin

  # Are the engines installed?
  fileconv --check-engines

TARGETS:
  Office documents  pdf docx doc odt rtf txt html xlsx xls ods csv pptx ppt odp
  Images            png jpg jpeg webp tiff gif avif
  Audio / video     mp3 wav ogg opus flac aac m4a mp4 webm mkv mov avi

  Without --to: office → pdf, image → png, audio/video → mp3.

ENGINES:
  soffice   LibreOffice, for office documents (--soffice / FILECONV_SOFFICE)
  ffmpeg    FFmpeg, for audio and video (--ffmpeg / FILECONV_FFMPEG)
  Both are looked up on PATH unless given explicitly. Images need no engine.

EXIT STATUS:
  0 if every input converted, 1 otherwise.
"#;

/// Convert office documents, images, audio and video files.
#[derive(Parser, Debug)]
#[command(
    name = "fileconv",
    version,
    about = "Convert office documents, images, audio and video files",
    long_about = "Convert files (local paths or URLs) between formats. Office documents go \
through headless LibreOffice, images are converted in-process, and audio/video goes through \
FFmpeg. File types are detected from content, not from the extension.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file paths or HTTP/HTTPS URLs.
    #[arg(required_unless_present = "check_engines")]
    inputs: Vec<String>,

    /// Output file, or directory for several inputs. `-` writes to stdout.
    #[arg(short, long, env = "FILECONV_OUTPUT")]
    output: Option<PathBuf>,

    /// Target format (pdf, png, mp3, …). Default depends on the input type.
    #[arg(long = "to", env = "FILECONV_TO")]
    to: Option<String>,

    /// Fit images within this width (pixels).
    #[arg(long, env = "FILECONV_WIDTH")]
    width: Option<u32>,

    /// Fit images within this height (pixels).
    #[arg(long, env = "FILECONV_HEIGHT")]
    height: Option<u32>,

    /// Allow images to be enlarged to reach --width/--height.
    #[arg(long, env = "FILECONV_UPSCALE")]
    upscale: bool,

    /// Concurrent office/media conversions.
    #[arg(long, env = "FILECONV_HEAVY_JOBS", default_value_t = 2)]
    heavy_jobs: usize,

    /// Concurrent image conversions.
    #[arg(long, env = "FILECONV_LIGHT_JOBS", default_value_t = 8)]
    light_jobs: usize,

    /// LibreOffice timeout in seconds.
    #[arg(long, env = "FILECONV_OFFICE_TIMEOUT", default_value_t = 60)]
    office_timeout: u64,

    /// Base FFmpeg timeout in seconds (plus 2 s per MiB of input).
    #[arg(long, env = "FILECONV_MEDIA_TIMEOUT", default_value_t = 30)]
    media_timeout: u64,

    /// Largest accepted input, in MiB.
    #[arg(long, env = "FILECONV_MAX_UPLOAD_MB", default_value_t = 200)]
    max_upload_mb: u64,

    /// Path to the soffice binary.
    #[arg(long, env = "FILECONV_SOFFICE")]
    soffice: Option<PathBuf>,

    /// Path to the ffmpeg binary.
    #[arg(long, env = "FILECONV_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    /// Directory for per-job scratch files. Default: system temp dir.
    #[arg(long, env = "FILECONV_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "FILECONV_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Detect file types and list possible targets; convert nothing.
    #[arg(long, env = "FILECONV_INSPECT_ONLY")]
    inspect_only: bool,

    /// Report which engines are installed, then exit.
    #[arg(long)]
    check_engines: bool,

    /// Print one JSON object per input instead of human-readable lines.
    #[arg(long, env = "FILECONV_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "FILECONV_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "FILECONV_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "FILECONV_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let writes_stdout = cli.output.as_deref() == Some(Path::new("-"));
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !writes_stdout;
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

    // ── Engine check ─────────────────────────────────────────────────────
    if cli.check_engines {
        let config = build_config(&cli, None)?;
        return check_engines(&config, cli.json);
    }

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let service = ConversionService::new(build_config(&cli, None)?);
        let mut failed = 0usize;
        for input in &cli.inputs {
            match service.inspect_file(input).await {
                Ok(report) => print_report(input, &report, cli.json)?,
                Err(e) => {
                    failed += 1;
                    print_failure(input, &e, cli.json)?;
                }
            }
        }
        if failed > 0 {
            anyhow::bail!("{failed} of {} inputs could not be inspected", cli.inputs.len());
        }
        return Ok(());
    }

    if writes_stdout && cli.inputs.len() != 1 {
        anyhow::bail!("-o - writes to stdout and takes exactly one input");
    }

    // ── Build service ────────────────────────────────────────────────────
    let observer = show_progress.then(|| CliObserver::new(cli.inputs.len()));
    let config = build_config(&cli, observer.clone().map(|o| o as Arc<dyn JobObserver>))?;
    let ledger = edgequake_fileconv::ScratchLedger::new();
    let service = ConversionService::builder(config)
        .ledger(Arc::clone(&ledger))
        .build();

    let options = ConvertOptions {
        target: cli.to.clone(),
        width: cli.width,
        height: cli.height,
        upscale: cli.upscale,
    };

    // Several inputs go into a directory, created if needed.
    let out_dir = match (&cli.output, cli.inputs.len()) {
        (Some(p), n) if n > 1 && !writes_stdout => {
            tokio::fs::create_dir_all(p)
                .await
                .with_context(|| format!("Failed to create output directory {}", p.display()))?;
            Some(p.clone())
        }
        _ => None,
    };

    // ── Ctrl-C cancels every running job ─────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // ── Run conversions ──────────────────────────────────────────────────
    // Heavy jobs are the bottleneck; more in flight would only be rejected.
    let concurrency = service.config().heavy_limit.max(1);
    let bar = observer.as_ref().map(|o| o.bar.clone());
    let results: Vec<(String, Result<Option<WrittenOutput>, ConvertError>)> =
        stream::iter(cli.inputs.iter().cloned())
            .map(|input| {
                let service = service.clone();
                let options = options.clone();
                let cancel = cancel.child_token();
                let target_path = if writes_stdout {
                    None
                } else {
                    out_dir.clone().or_else(|| cli.output.clone())
                };
                async move {
                    let result = if writes_stdout {
                        to_stdout(&service, &input, &options, cancel).await
                    } else {
                        service
                            .convert_to_file(&input, &options, target_path.as_deref(), cancel)
                            .await
                            .map(Some)
                    };
                    (input, result)
                }
            })
            .buffer_unordered(concurrency)
            .inspect(|(input, result)| {
                if let Some(bar) = &bar {
                    bar.println(result_line(input, result));
                    bar.inc(1);
                }
            })
            .collect()
            .await;

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    // ── Report ───────────────────────────────────────────────────────────
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    for (input, result) in &results {
        match result {
            Ok(written) if cli.json => {
                let value = serde_json::json!({ "input": input, "ok": true, "output": written });
                println!("{}", serde_json::to_string(&value).context("Failed to serialise result")?);
            }
            Ok(_) if show_progress || cli.quiet => {}
            Ok(_) => eprintln!("{}", result_line(input, result)),
            Err(e) => {
                if !show_progress || cli.json {
                    print_failure(input, e, cli.json)?;
                }
            }
        }
    }

    if !cli.quiet && !cli.json {
        let ok = results.len() - failed;
        eprintln!(
            "{} {}/{} files converted",
            if failed == 0 { green("✔") } else { red("✘") },
            bold(&ok.to_string()),
            results.len(),
        );
    }
    if cli.verbose {
        eprintln!(
            "   {}",
            dim(&format!(
                "scratch: {} acquired, {} released, {} failed deletions, {} outstanding",
                ledger.acquired(),
                ledger.released(),
                ledger.failed_deletions(),
                ledger.outstanding()
            ))
        );
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} inputs failed", results.len());
    }
    Ok(())
}

/// Convert one input and copy the body to stdout.
async fn to_stdout(
    service: &ConversionService,
    input: &str,
    options: &ConvertOptions,
    cancel: CancellationToken,
) -> Result<Option<WrittenOutput>, ConvertError> {
    let output = service.convert_file(input, options, cancel).await?;
    let mut stdout = tokio::io::stdout();
    output
        .body
        .write_to(&mut stdout)
        .await
        .map_err(|source| ConvertError::OutputWriteFailed {
            path: PathBuf::from("<stdout>"),
            source,
        })?;
    Ok(None)
}

fn result_line(input: &str, result: &Result<Option<WrittenOutput>, ConvertError>) -> String {
    match result {
        Ok(Some(w)) => format!(
            "  {} {}  →  {}  {}",
            green("✓"),
            input,
            bold(&w.path.display().to_string()),
            dim(&format!(
                "{} bytes, {:.1}s",
                w.bytes_written,
                w.stats.total_duration_ms as f64 / 1000.0
            )),
        ),
        Ok(None) => format!("  {} {}  →  stdout", green("✓"), input),
        Err(e) => failure_line(input, e),
    }
}

fn failure_line(input: &str, e: &ConvertError) -> String {
    let body = e.to_body();
    format!(
        "  {} {}  {}  {}",
        red("✗"),
        input,
        dim(&format!("[{} {}]", body.error.status_code(), body.error)),
        red(&body.message),
    )
}

fn print_failure(input: &str, e: &ConvertError, json: bool) -> Result<()> {
    let body = e.to_body();
    if json {
        let value = serde_json::json!({
            "input": input,
            "ok": false,
            "status": body.error.status_code(),
            "error": body.error,
            "message": body.message,
        });
        println!("{}", serde_json::to_string(&value).context("Failed to serialise error")?);
    } else {
        eprintln!("{}", failure_line(input, e));
    }
    Ok(())
}

fn print_report(input: &str, report: &InspectReport, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({ "input": input, "ok": true, "report": report });
        println!("{}", serde_json::to_string(&value).context("Failed to serialise report")?);
        return Ok(());
    }
    let c = &report.classification;
    println!("File:         {}", input);
    println!("Size:         {} bytes", report.len);
    println!("Type:         {} ({})", c.class, c.format);
    println!("MIME:         {}", c.mime);
    println!("Detected by:  {:?}", c.source);
    match (&report.engine, &report.default_target) {
        (Some(engine), Some(default)) => {
            println!("Engine:       {}", engine);
            println!("Default:      {}", default);
            println!("Targets:      {}", report.targets.join(" "));
        }
        _ => println!("Targets:      {}", cyan("none (unsupported)")),
    }
    println!();
    Ok(())
}

fn check_engines(config: &ConversionConfig, json: bool) -> Result<()> {
    let infos = EngineTools::discover(config).check_all();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&infos).context("Failed to serialise engine report")?
        );
    } else {
        for info in &infos {
            if info.available {
                println!(
                    "{} {:<8} {}  {}",
                    green("✓"),
                    info.name,
                    info.path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    dim(info.version.as_deref().unwrap_or("version unknown")),
                );
            } else {
                println!("{} {:<8} {}", red("✗"), info.name, dim("not found"));
            }
        }
        println!("{} images are converted in-process", green("✓"));
    }
    if infos.iter().any(|i| !i.available) {
        anyhow::bail!("some engines are missing");
    }
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, observer: Option<Arc<dyn JobObserver>>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .max_upload_mib(cli.max_upload_mb)
        .heavy_limit(cli.heavy_jobs)
        .light_limit(cli.light_jobs)
        .office_timeout_secs(cli.office_timeout)
        .media_timeout_base_secs(cli.media_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref p) = cli.soffice {
        builder = builder.soffice_path(p);
    }
    if let Some(ref p) = cli.ffmpeg {
        builder = builder.ffmpeg_path(p);
    }
    if let Some(ref p) = cli.scratch_dir {
        builder = builder.scratch_root(p);
    }
    if let Some(o) = observer {
        builder = builder.observer(o);
    }

    builder.build().context("Invalid configuration")
}
