//! Drives one image, or a batch of images, through detection, translation
//! and merging, degrading per block instead of per image wherever possible.

use anyhow::{Context, Result, bail};
use futures_util::{StreamExt, stream};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{Adapter, AdapterSpec, BuildContext, RawRegion, build_adapter};
use crate::block::{FontSize, TextBlock, TextStyle};
use crate::error::Error;
use crate::glossary::Glossary;
use crate::providers::{HttpOptions, build_client};
use crate::session::Session;

mod batch;
mod merge;
mod progress;

pub use batch::run_batch;
pub use merge::{MergeConfig, TieBreak};
pub use progress::{ImageState, ImageSummary, ProgressEvent, ProgressSink, Stage};

use merge::{Candidate, dedup, join_fragments};

/// Per-call budgets. A fallback gets its own budget, not what the primary left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsMs {
    pub ocr: u64,
    pub translate: u64,
}

impl Default for TimeoutsMs {
    fn default() -> Self {
        Self {
            ocr: 120_000,
            translate: 60_000,
        }
    }
}

impl TimeoutsMs {
    fn ocr(&self) -> Duration {
        Duration::from_millis(self.ocr)
    }

    fn translate(&self) -> Duration {
        Duration::from_millis(self.translate)
    }
}

/// Explicit provider selection for a pipeline. Nothing is picked up from globals.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub primary_ocr: AdapterSpec,
    pub fallback_ocr: Option<AdapterSpec>,
    pub primary_translate: Option<AdapterSpec>,
    pub fallback_translate: Option<AdapterSpec>,
    pub timeouts_ms: TimeoutsMs,
    pub proxy: Option<String>,
}

impl PipelineOptions {
    pub fn build_adapters(&self, context: &BuildContext) -> Result<AdapterChain> {
        let client = build_client(&HttpOptions {
            proxy: self.proxy.clone(),
            request_timeout: None,
        })?;
        let build = |spec: &AdapterSpec| {
            build_adapter(spec, context, &client)
                .with_context(|| format!("failed to configure adapter '{}'", spec))
        };
        let optional = |spec: &Option<AdapterSpec>| spec.as_ref().map(&build).transpose();

        let chain = AdapterChain {
            primary_ocr: build(&self.primary_ocr)?,
            fallback_ocr: optional(&self.fallback_ocr)?,
            primary_translate: optional(&self.primary_translate)?,
            fallback_translate: optional(&self.fallback_translate)?,
        };
        chain.validate()?;
        Ok(chain)
    }
}

/// The adapters one pipeline runs with.
#[derive(Debug, Clone)]
pub struct AdapterChain {
    pub primary_ocr: Adapter,
    pub fallback_ocr: Option<Adapter>,
    pub primary_translate: Option<Adapter>,
    pub fallback_translate: Option<Adapter>,
}

impl AdapterChain {
    pub fn new(primary_ocr: Adapter) -> Self {
        Self {
            primary_ocr,
            fallback_ocr: None,
            primary_translate: None,
            fallback_translate: None,
        }
    }

    pub fn with_fallback_ocr(mut self, adapter: Adapter) -> Self {
        self.fallback_ocr = Some(adapter);
        self
    }

    pub fn with_translate(mut self, adapter: Adapter) -> Self {
        self.primary_translate = Some(adapter);
        self
    }

    pub fn with_fallback_translate(mut self, adapter: Adapter) -> Self {
        self.fallback_translate = Some(adapter);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.primary_ocr.can_detect() {
            bail!("'{}' cannot be used for OCR", self.primary_ocr.name());
        }
        if let Some(fallback) = &self.fallback_ocr
            && !fallback.can_detect()
        {
            bail!("'{}' cannot be used for OCR", fallback.name());
        }
        for adapter in [&self.primary_translate, &self.fallback_translate]
            .into_iter()
            .flatten()
        {
            if !adapter.can_translate() {
                bail!("'{}' cannot be used for translation", adapter.name());
            }
        }
        Ok(())
    }

    /// Explicit translator first, then a primary OCR adapter that can also translate.
    fn translator(&self) -> Option<&Adapter> {
        self.primary_translate
            .as_ref()
            .or_else(|| Some(&self.primary_ocr).filter(|a| a.can_translate()))
    }
}

enum Detection {
    /// Multi-modal output, already translated.
    Blocks(Vec<TextBlock>),
    Regions(Vec<RawRegion>),
}

pub struct Pipeline {
    adapters: AdapterChain,
    timeouts: TimeoutsMs,
    merge: MergeConfig,
    style: TextStyle,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(adapters: AdapterChain) -> Self {
        Self {
            adapters,
            timeouts: TimeoutsMs::default(),
            merge: MergeConfig::default(),
            style: TextStyle::default(),
            concurrency: 4,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutsMs) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_default_style(mut self, style: TextStyle) -> Self {
        self.style = style;
        self
    }

    /// How many blocks of one image are translated at the same time.
    pub fn with_translate_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn adapters(&self) -> &AdapterChain {
        &self.adapters
    }

    /// Run one image to a terminal state. The session's blocks are replaced
    /// only when the image reaches `Done`.
    pub async fn process(
        &self,
        session: &Session,
        glossary: &Glossary,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> ImageSummary {
        let image_id = session.id();
        let mut diagnostics = Vec::new();
        let summary = match self
            .run(session, glossary, cancel, progress, &mut diagnostics)
            .await
        {
            Ok((blocks_ok, blocks_failed)) => {
                info!(%image_id, blocks_ok, blocks_failed, "image done");
                ImageSummary {
                    image_id,
                    state: ImageState::Done,
                    blocks_ok,
                    blocks_failed,
                    diagnostics,
                }
            }
            Err(reason) => {
                warn!(%image_id, error = %reason, "image failed");
                ImageSummary::failed(image_id, reason, diagnostics)
            }
        };
        progress.finished(&summary);
        summary
    }

    async fn run(
        &self,
        session: &Session,
        glossary: &Glossary,
        cancel: &CancellationToken,
        progress: &ProgressSink,
        diagnostics: &mut Vec<Error>,
    ) -> Result<(usize, usize), Error> {
        let image_id = session.id();
        ensure_live(cancel)?;
        progress.stage(image_id, Stage::Detecting, 0, 0);
        let detection = self
            .detect(image_id, session.shared_source(), glossary, cancel, diagnostics)
            .await?;
        // results of calls that were already in flight are discarded
        ensure_live(cancel)?;

        let regions = match detection {
            Detection::Blocks(blocks) => {
                let total = blocks.len();
                progress.stage(image_id, Stage::Merging, total, total);
                let blocks = blocks
                    .into_iter()
                    .map(|mut block| {
                        let detected_size = block.style.font_size;
                        block.style = self.style.clone().with_orientation(block.style.orientation);
                        if let FontSize::Fixed(_) = detected_size {
                            block.style.font_size = detected_size;
                        }
                        block
                    })
                    .collect();
                return Ok(commit(session, blocks));
            }
            Detection::Regions(regions) => regions,
        };

        // fragments of one line are joined before translation so the line
        // is translated as a whole
        let candidates: Vec<Candidate> = regions
            .into_iter()
            .filter(|region| !region.text.trim().is_empty())
            .enumerate()
            .map(|(order, region)| Candidate::from_region(order, region))
            .collect();
        let candidates = if self.merge.join_fragments {
            join_fragments(candidates)
        } else {
            candidates
        };

        let total = candidates.len();
        progress.stage(image_id, Stage::Translating, 0, total);
        let candidates = self
            .translate_all(image_id, candidates, glossary, cancel, progress, diagnostics)
            .await?;
        ensure_live(cancel)?;

        progress.stage(image_id, Stage::Merging, total, total);
        let mut blocks = Vec::new();
        for candidate in dedup(candidates, &self.merge) {
            match candidate.into_block(&self.style) {
                Ok(block) => blocks.push(block),
                Err(error) => {
                    warn!(%image_id, %error, "region skipped");
                    diagnostics.push(error);
                }
            }
        }
        Ok(commit(session, blocks))
    }

    async fn detect(
        &self,
        image_id: Uuid,
        image: Arc<RgbaImage>,
        glossary: &Glossary,
        cancel: &CancellationToken,
        diagnostics: &mut Vec<Error>,
    ) -> Result<Detection, Error> {
        let primary = &self.adapters.primary_ocr;
        let first = match self.detect_with(primary, Arc::clone(&image), glossary, diagnostics).await {
            Ok(detection) => return Ok(detection),
            Err(error) => error,
        };
        warn!(%image_id, provider = primary.name(), error = %first, "OCR failed");
        diagnostics.push(first.clone());

        let Some(fallback) = &self.adapters.fallback_ocr else {
            return Err(first);
        };
        ensure_live(cancel)?;
        info!(%image_id, provider = fallback.name(), "falling back to secondary OCR");
        match self.detect_with(fallback, image, glossary, diagnostics).await {
            Ok(detection) => Ok(detection),
            Err(second) => {
                warn!(%image_id, provider = fallback.name(), error = %second, "fallback OCR failed");
                diagnostics.push(second.clone());
                Err(Error::adapter(
                    format!("{} -> {}", primary.name(), fallback.name()),
                    format!("{}; {}", first, second),
                ))
            }
        }
    }

    async fn detect_with(
        &self,
        adapter: &Adapter,
        image: Arc<RgbaImage>,
        glossary: &Glossary,
        diagnostics: &mut Vec<Error>,
    ) -> Result<Detection, Error> {
        let timeout = self.timeouts.ocr();
        if adapter.is_multimodal() {
            let (blocks, errors) = adapter
                .detect_and_translate(image, None, glossary, timeout)
                .await
                .into_parts()?;
            diagnostics.extend(errors.into_iter().map(|item| item.error));
            Ok(Detection::Blocks(blocks))
        } else {
            let (regions, errors) = adapter.detect(image, timeout).await.into_parts()?;
            diagnostics.extend(errors.into_iter().map(|item| item.error));
            Ok(Detection::Regions(regions))
        }
    }

    async fn translate_all(
        &self,
        image_id: Uuid,
        candidates: Vec<Candidate>,
        glossary: &Glossary,
        cancel: &CancellationToken,
        progress: &ProgressSink,
        diagnostics: &mut Vec<Error>,
    ) -> Result<Vec<Candidate>, Error> {
        let total = candidates.len();
        let mut results = stream::iter(candidates)
            .map(|candidate| self.translate_candidate(image_id, candidate, glossary, cancel))
            .buffered(self.concurrency);

        let mut translated = Vec::with_capacity(total);
        let mut cancelled = false;
        while let Some(result) = results.next().await {
            match result {
                Ok((candidate, errors)) => {
                    diagnostics.extend(errors);
                    translated.push(candidate);
                    progress.stage(image_id, Stage::Translating, translated.len(), total);
                }
                Err(error) if error.is_cancelled() => cancelled = true,
                Err(error) => diagnostics.push(error),
            }
        }
        if cancelled {
            return Err(Error::Cancelled);
        }
        Ok(translated)
    }

    /// Translate one line. Failures stay on the line; only cancellation escapes.
    async fn translate_candidate(
        &self,
        image_id: Uuid,
        mut candidate: Candidate,
        glossary: &Glossary,
        cancel: &CancellationToken,
    ) -> Result<(Candidate, Vec<Error>), Error> {
        ensure_live(cancel)?;
        if !candidate.translated.is_empty() {
            return Ok((candidate, Vec::new()));
        }

        let order = candidate.order;
        let fallback = self.adapters.fallback_translate.as_ref();
        let mut errors = Vec::new();
        match (self.adapters.translator(), fallback) {
            (Some(adapter), _) => {
                match self.translate_with(adapter, &candidate.original, glossary).await {
                    Ok(text) => {
                        candidate.translated = text;
                        return Ok((candidate, errors));
                    }
                    Err(error) => errors.push(error),
                }
            }
            // only a fallback translator is configured; using it is no failure
            (None, Some(_)) => {}
            (None, None) => {
                errors.push(Error::adapter("pipeline", "no translation adapter configured"))
            }
        }

        if let Some(fallback) = fallback {
            ensure_live(cancel)?;
            debug!(%image_id, block = order, provider = fallback.name(), "translating block with fallback translator");
            match self.translate_with(fallback, &candidate.original, glossary).await {
                Ok(text) => {
                    candidate.translated = text;
                    return Ok((candidate, errors));
                }
                Err(error) => errors.push(error),
            }
        }

        let detail = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!(%image_id, block = order, error = %detail, "block left untranslated");
        candidate.failure = Some(detail);
        Ok((candidate, errors))
    }

    async fn translate_with(
        &self,
        adapter: &Adapter,
        text: &str,
        glossary: &Glossary,
    ) -> Result<String, Error> {
        let (translation, _) = adapter
            .translate(text, glossary, self.timeouts.translate())
            .await
            .into_parts()?;
        let translation = translation.trim();
        if translation.is_empty() {
            return Err(Error::adapter(adapter.name(), "empty translation"));
        }
        Ok(translation.to_string())
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn commit(session: &Session, blocks: Vec<TextBlock>) -> (usize, usize) {
    let failed = blocks.iter().filter(|block| !block.status.is_ok()).count();
    let ok = blocks.len() - failed;
    session.replace_blocks(blocks);
    (ok, failed)
}
