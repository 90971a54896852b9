use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod adapters;
pub mod block;
pub mod error;
pub mod font;
pub mod geometry;
pub mod glossary;
pub mod layout;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod render;
pub mod session;
pub mod settings;
mod text;

#[cfg(test)]
mod test_util;

pub use adapters::{
    Adapter, AdapterSpec, BuildContext, Languages, MultiModalAdapter, OcrAdapter,
    ProviderResult, RawRegion, TranslateAdapter,
};
pub use block::{BlockId, BlockStatus, Edit, Orientation, Rgba, TextBlock, TextStyle};
pub use error::Error;
pub use glossary::Glossary;
pub use pipeline::{
    AdapterChain, ImageState, ImageSummary, Pipeline, PipelineOptions, ProgressEvent,
    ProgressSink, Stage, run_batch,
};
pub use render::{Compositor, ExportFormat};
pub use session::Session;
pub use settings::Settings;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub images: Vec<PathBuf>,
    /// Defaults to each image's own directory.
    pub out_dir: Option<PathBuf>,
    pub lang: Option<String>,
    pub source_lang: Option<String>,
    pub settings_path: Option<String>,
    pub glossary: Option<PathBuf>,
    pub workers: Option<usize>,
    pub format: Option<ExportFormat>,
    pub blocks_json: bool,
}

/// One image's outcome plus whatever was written for it.
#[derive(Debug, Clone)]
pub struct ImageReport {
    pub input: PathBuf,
    pub summary: ImageSummary,
    pub output: Option<PathBuf>,
    pub blocks_json: Option<PathBuf>,
}

impl ImageReport {
    pub fn is_done(&self) -> bool {
        self.summary.state.is_done()
    }
}

/// Translate every image in `config`, writing one rendered file per finished image.
pub async fn run(
    config: Config,
    cancel: CancellationToken,
    progress: ProgressSink,
) -> Result<Vec<ImageReport>> {
    if config.images.is_empty() {
        bail!("no input images");
    }
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    if let Some(lang) = config.lang.as_deref() {
        settings.target_lang = lang.to_string();
    }
    if let Some(source) = config.source_lang.as_deref() {
        settings.source_lang = source.to_string();
    }
    if let Some(path) = &config.glossary {
        settings.glossary_path = Some(path.clone());
    }
    if let Some(workers) = config.workers {
        settings.workers = workers;
    }

    let options = settings.pipeline_options()?;
    let chain = options.build_adapters(&settings.build_context())?;
    let pipeline = Arc::new(
        Pipeline::new(chain)
            .with_timeouts(options.timeouts_ms)
            .with_merge(settings.merge.clone())
            .with_default_style(settings.style.clone())
            .with_translate_concurrency(settings.translate_concurrency),
    );
    let glossary = Arc::new(settings.load_glossary()?);

    let opened = open_images(&config.images, &progress);
    let sessions: Vec<Arc<Session>> = opened
        .iter()
        .filter_map(|image| image.as_ref().ok().cloned())
        .collect();
    let summaries = run_batch(
        pipeline,
        sessions,
        glossary,
        settings.worker_count(),
        cancel,
        progress.clone(),
    )
    .await;

    let compositor = Arc::new(Compositor::new(settings.layout.clone()));
    let output = OutputOptions {
        out_dir: config.out_dir,
        lang: settings.target_lang.clone(),
        format: config.format,
        blocks_json: config.blocks_json,
        auto_fit: settings.auto_fit,
    };
    let mut summaries = summaries.into_iter();
    let mut reports = Vec::with_capacity(config.images.len());
    for (input, image) in config.images.into_iter().zip(opened) {
        let report = match image {
            Err(summary) => ImageReport {
                input,
                summary,
                output: None,
                blocks_json: None,
            },
            Ok(session) => {
                let summary = summaries
                    .next()
                    .ok_or_else(|| anyhow!("batch returned fewer summaries than images"))?;
                finish_image(input, session, summary, &compositor, &output, &progress).await?
            }
        };
        reports.push(report);
    }
    Ok(reports)
}

/// Decode every input. An unreadable one is reported as failed right away
/// and left out of the batch.
fn open_images(paths: &[PathBuf], progress: &ProgressSink) -> Vec<Result<Arc<Session>, ImageSummary>> {
    paths
        .iter()
        .map(|path| match Session::open(path) {
            Ok(session) => {
                info!(image = %path.display(), session = %session.id(), "opened image");
                Ok(Arc::new(session))
            }
            Err(err) => {
                let reason = Error::UnreadableImage(format!("{:#}", err));
                warn!(image = %path.display(), error = %reason, "skipping image");
                let summary = ImageSummary::failed(Uuid::new_v4(), reason, Vec::new());
                progress.finished(&summary);
                Err(summary)
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct OutputOptions {
    out_dir: Option<PathBuf>,
    lang: String,
    format: Option<ExportFormat>,
    blocks_json: bool,
    auto_fit: bool,
}

/// Render and write a finished image. Layout advisories join the summary's
/// diagnostics; a write failure turns the image into `Failed{Render}` and is
/// announced with a second `Finished` event.
async fn finish_image(
    input: PathBuf,
    session: Arc<Session>,
    mut summary: ImageSummary,
    compositor: &Arc<Compositor>,
    options: &OutputOptions,
    progress: &ProgressSink,
) -> Result<ImageReport> {
    if !summary.state.is_done() {
        return Ok(ImageReport {
            input,
            summary,
            output: None,
            blocks_json: None,
        });
    }
    let target = OutputTarget::new(&input, options.out_dir.as_deref(), &options.lang, options.format);
    let compositor = Arc::clone(compositor);
    let (auto_fit, write_blocks) = (options.auto_fit, options.blocks_json);
    let (fit_errors, written) = tokio::task::spawn_blocking(move || {
        let fit_errors = if auto_fit {
            fit_blocks(&session, &compositor)
        } else {
            Vec::new()
        };
        (fit_errors, target.write(&session, &compositor, write_blocks))
    })
    .await
    .context("compositing task panicked")?;
    summary.diagnostics.extend(fit_errors);

    match written {
        Ok(written) => {
            summary.diagnostics.extend(written.overflows);
            Ok(ImageReport {
                input,
                summary,
                output: Some(written.image),
                blocks_json: written.blocks,
            })
        }
        Err(err) => {
            warn!(image = %input.display(), error = %err, "failed to write output");
            summary.state = ImageState::Failed {
                reason: Error::Render(format!("{:#}", err)),
            };
            progress.finished(&summary);
            Ok(ImageReport {
                input,
                summary,
                output: None,
                blocks_json: None,
            })
        }
    }
}

/// Grow every translated block to fit its text.
fn fit_blocks(session: &Session, compositor: &Compositor) -> Vec<Error> {
    session
        .blocks()
        .iter()
        .filter(|block| !block.translated_text.trim().is_empty())
        .filter_map(|block| session.fit_block_to_text(block.id, compositor).err())
        .collect()
}

struct Written {
    image: PathBuf,
    blocks: Option<PathBuf>,
    overflows: Vec<Error>,
}

#[derive(Debug, Clone)]
struct OutputTarget {
    image: PathBuf,
    blocks: PathBuf,
    format: ExportFormat,
}

impl OutputTarget {
    fn new(input: &Path, out_dir: Option<&Path>, lang: &str, format: Option<ExportFormat>) -> Self {
        let format = format
            .or_else(|| {
                input
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .and_then(ExportFormat::from_extension)
            })
            .unwrap_or_default();
        let dir = out_dir
            .map(Path::to_path_buf)
            .or_else(|| input.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image");
        Self {
            image: dir.join(format!("{}.{}.{}", stem, lang, format.extension())),
            blocks: dir.join(format!("{}.{}.blocks.json", stem, lang)),
            format,
        }
    }

    fn write(&self, session: &Session, compositor: &Compositor, blocks_json: bool) -> Result<Written> {
        if let Some(parent) = self.image.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let (_, overflows) = session.render_with_overflows(compositor)?;
        let bytes = session.export(compositor, self.format)?;
        std::fs::write(&self.image, bytes)
            .with_context(|| format!("failed to write {}", self.image.display()))?;
        let blocks = if blocks_json {
            std::fs::write(&self.blocks, session.blocks_json()?)
                .with_context(|| format!("failed to write {}", self.blocks.display()))?;
            Some(self.blocks.clone())
        } else {
            None
        };
        Ok(Written {
            image: self.image.clone(),
            blocks,
            overflows,
        })
    }
}
