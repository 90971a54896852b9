//! Uniform capability interface over concrete OCR and translation backends.
//!
//! Adapters never return raw errors: every failure mode comes back as a
//! [`ProviderResult::Failure`] attributed to the adapter's name.

use image::RgbaImage;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::block::{Orientation, TextBlock};
use crate::error::Error;
use crate::geometry::BBoxPx;
use crate::glossary::Glossary;

mod llm;
mod local;
mod prompts;
mod spec;
mod tesseract;

pub use llm::{LlmText, LlmVision};
pub use local::LocalLlm;
pub use prompts::Languages;
pub use spec::{AdapterSpec, BuildContext, build_adapter};
pub use tesseract::Tesseract;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub index: usize,
    pub error: Error,
}

/// Outcome of one adapter call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderResult<T> {
    Success { value: T, confidence: Option<f32> },
    /// Some items came back, others failed; `value` holds the usable part.
    PartialFailure { value: T, errors: Vec<ItemError> },
    Failure { reason: Error },
}

impl<T> ProviderResult<T> {
    pub fn success(value: T) -> Self {
        ProviderResult::Success {
            value,
            confidence: None,
        }
    }

    pub fn failure(reason: Error) -> Self {
        ProviderResult::Failure { reason }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ProviderResult::Failure { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProviderResult<U> {
        match self {
            ProviderResult::Success { value, confidence } => ProviderResult::Success {
                value: f(value),
                confidence,
            },
            ProviderResult::PartialFailure { value, errors } => ProviderResult::PartialFailure {
                value: f(value),
                errors,
            },
            ProviderResult::Failure { reason } => ProviderResult::Failure { reason },
        }
    }

    /// Usable value plus any per-item errors, or the failure reason.
    pub fn into_parts(self) -> Result<(T, Vec<ItemError>), Error> {
        match self {
            ProviderResult::Success { value, .. } => Ok((value, Vec::new())),
            ProviderResult::PartialFailure { value, errors } => Ok((value, errors)),
            ProviderResult::Failure { reason } => Err(reason),
        }
    }
}

impl<T> From<Result<T, Error>> for ProviderResult<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => ProviderResult::success(value),
            Err(reason) => ProviderResult::failure(reason),
        }
    }
}

/// A detected text region before it becomes a block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRegion {
    pub text: String,
    pub bbox: BBoxPx,
    pub confidence: Option<f32>,
    pub orientation: Option<Orientation>,
    /// Clockwise degrees, as reported by the backend.
    pub angle: f32,
    /// Present when the backend translated while detecting.
    pub translation: Option<String>,
    /// Pixel size for the size class the backend reported, if any.
    pub font_size: Option<u32>,
}

impl RawRegion {
    pub fn new(text: impl Into<String>, bbox: BBoxPx) -> Self {
        Self {
            text: text.into(),
            bbox,
            confidence: None,
            orientation: None,
            angle: 0.0,
            translation: None,
            font_size: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

pub trait OcrAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>>;
}

pub trait TranslateAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn translate<'a>(&'a self, text: &'a str, glossary: &'a Glossary) -> AdapterFuture<'a, String>;
}

/// Detects and translates in one call.
pub trait MultiModalAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>>;
    fn translate<'a>(&'a self, text: &'a str, glossary: &'a Glossary) -> AdapterFuture<'a, String>;
    fn detect_and_translate<'a>(
        &'a self,
        image: Arc<RgbaImage>,
        region_hint: Option<BBoxPx>,
        glossary: &'a Glossary,
    ) -> AdapterFuture<'a, Vec<TextBlock>>;
}

/// An adapter tagged with what it can do, chosen at configuration time.
#[derive(Clone)]
pub enum Adapter {
    MultiModal(Arc<dyn MultiModalAdapter>),
    OcrOnly(Arc<dyn OcrAdapter>),
    TranslateOnly(Arc<dyn TranslateAdapter>),
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Adapter::MultiModal(_) => "MultiModal",
            Adapter::OcrOnly(_) => "OcrOnly",
            Adapter::TranslateOnly(_) => "TranslateOnly",
        };
        write!(f, "{}({})", kind, self.name())
    }
}

impl Adapter {
    pub fn name(&self) -> &str {
        match self {
            Adapter::MultiModal(adapter) => adapter.name(),
            Adapter::OcrOnly(adapter) => adapter.name(),
            Adapter::TranslateOnly(adapter) => adapter.name(),
        }
    }

    pub fn can_detect(&self) -> bool {
        !matches!(self, Adapter::TranslateOnly(_))
    }

    pub fn can_translate(&self) -> bool {
        !matches!(self, Adapter::OcrOnly(_))
    }

    pub fn is_multimodal(&self) -> bool {
        matches!(self, Adapter::MultiModal(_))
    }

    pub async fn detect(
        &self,
        image: Arc<RgbaImage>,
        timeout: Duration,
    ) -> ProviderResult<Vec<RawRegion>> {
        let call = match self {
            Adapter::MultiModal(adapter) => adapter.detect(image),
            Adapter::OcrOnly(adapter) => adapter.detect(image),
            Adapter::TranslateOnly(adapter) => {
                return ProviderResult::failure(Error::adapter(
                    adapter.name(),
                    "adapter cannot detect text",
                ));
            }
        };
        with_timeout(self.name(), timeout, call).await
    }

    pub async fn translate(
        &self,
        text: &str,
        glossary: &Glossary,
        timeout: Duration,
    ) -> ProviderResult<String> {
        if text.trim().is_empty() {
            return ProviderResult::failure(Error::EmptyContent);
        }
        let call = match self {
            Adapter::MultiModal(adapter) => adapter.translate(text, glossary),
            Adapter::TranslateOnly(adapter) => adapter.translate(text, glossary),
            Adapter::OcrOnly(adapter) => {
                return ProviderResult::failure(Error::adapter(
                    adapter.name(),
                    "adapter cannot translate",
                ));
            }
        };
        with_timeout(self.name(), timeout, call).await
    }

    pub async fn detect_and_translate(
        &self,
        image: Arc<RgbaImage>,
        region_hint: Option<BBoxPx>,
        glossary: &Glossary,
        timeout: Duration,
    ) -> ProviderResult<Vec<TextBlock>> {
        match self {
            Adapter::MultiModal(adapter) => {
                let call = adapter.detect_and_translate(image, region_hint, glossary);
                with_timeout(self.name(), timeout, call).await
            }
            _ => ProviderResult::failure(Error::adapter(
                self.name(),
                "adapter is not multi-modal",
            )),
        }
    }
}

/// Bound one adapter call. The budget covers only this call.
pub async fn with_timeout<T>(
    provider: &str,
    timeout: Duration,
    call: AdapterFuture<'_, T>,
) -> ProviderResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => ProviderResult::failure(Error::AdapterTimeout {
            provider: provider.to_string(),
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
        }),
    }
}

/// PNG bytes for sending an image to a remote backend.
pub(crate) fn encode_png(image: &RgbaImage) -> anyhow::Result<Vec<u8>> {
    crate::render::encode_image(image, crate::render::ExportFormat::Png)
}
