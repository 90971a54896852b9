use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, anyhow};
use clap::Parser;
use llm_image_translator::{
    Config, ExportFormat, ImageReport, ImageState, ProgressEvent, ProgressSink, Stage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "llm-image-translator",
    version,
    about = "Detect, translate and re-render the text in images"
)]
struct Cli {
    /// Images to translate
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Directory for rendered images (default: next to each input)
    #[arg(short = 'o', long = "out-dir")]
    out_dir: Option<PathBuf>,

    /// Target language (overrides [pipeline].target_lang)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Source language. Use "auto" to detect.
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 's', long = "settings", visible_alias = "read-settings")]
    settings: Option<String>,

    /// Glossary file, one `source->target` pair per line
    #[arg(short = 'g', long = "glossary")]
    glossary: Option<PathBuf>,

    /// Images processed concurrently (0 = one per CPU)
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Output format: png, jpg, webp or bmp (default: input's format)
    #[arg(short = 'f', long = "format", value_parser = parse_format)]
    format: Option<ExportFormat>,

    /// Also write the detected blocks as JSON
    #[arg(long = "blocks-json")]
    blocks_json: bool,

    /// Print progress events as JSON lines instead of text
    #[arg(long = "json-progress")]
    json_progress: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

fn parse_format(value: &str) -> Result<ExportFormat> {
    ExportFormat::from_extension(value).ok_or_else(|| anyhow!("unsupported format '{}'", value))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    llm_image_translator::logging::init(cli.verbose)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, finishing in-flight images");
            interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let json_progress = cli.json_progress;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event, json_progress);
        }
    });

    let config = Config {
        images: cli.images,
        out_dir: cli.out_dir,
        lang: cli.lang,
        source_lang: cli.source_lang,
        settings_path: cli.settings,
        glossary: cli.glossary,
        workers: cli.workers,
        format: cli.format,
        blocks_json: cli.blocks_json,
    };
    let result = llm_image_translator::run(config, cancel, ProgressSink::new(tx)).await;
    // the sender is gone once `run` returns, so the printer drains and stops
    let _ = printer.await;

    let reports = result?;
    for report in &reports {
        print_report(report);
    }
    if reports.iter().all(|report| !report.is_done()) {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &ProgressEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{}", line);
        }
        return;
    }
    match event {
        ProgressEvent::Stage {
            image_id,
            stage: Stage::Translating,
            blocks_done,
            blocks_total,
        } => eprintln!("[{}] translating {}/{}", image_id, blocks_done, blocks_total),
        ProgressEvent::Stage {
            image_id, stage, ..
        } if *stage != Stage::Idle => eprintln!("[{}] {:?}", image_id, stage),
        ProgressEvent::Stage { .. } => {}
        ProgressEvent::Finished(summary) => match &summary.state {
            ImageState::Done => eprintln!(
                "[{}] done: {} blocks, {} failed",
                summary.image_id, summary.blocks_ok, summary.blocks_failed
            ),
            ImageState::Failed { reason } => {
                eprintln!("[{}] failed: {}", summary.image_id, reason)
            }
        },
        ProgressEvent::Batch { finished, total } => eprintln!("{}/{} images", finished, total),
    }
}

fn print_report(report: &ImageReport) {
    match (&report.output, &report.summary.state) {
        (Some(output), _) => {
            println!("{}\t{}", report.input.display(), output.display());
            for diagnostic in &report.summary.diagnostics {
                eprintln!("  {}: {}", report.input.display(), diagnostic);
            }
        }
        (None, ImageState::Failed { reason }) => {
            eprintln!("{}: {}", report.input.display(), reason);
        }
        (None, ImageState::Done) => {}
    }
}
