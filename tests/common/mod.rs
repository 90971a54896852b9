#![allow(dead_code)]

use image::RgbaImage;
use llm_image_translator::adapters::AdapterFuture;
use llm_image_translator::geometry::BBoxPx;
use llm_image_translator::{
    Error, Glossary, OcrAdapter, ProviderResult, RawRegion, Session, TranslateAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn region(text: &str, x: u32, y: u32, w: u32, h: u32) -> RawRegion {
    RawRegion::new(text, BBoxPx { x, y, w, h }).with_confidence(0.9)
}

pub fn session(width: u32, height: u32) -> Arc<Session> {
    Arc::new(Session::new(RgbaImage::new(width, height)))
}

/// Detects the same regions on every image, except images whose width is in `fail_widths`.
pub struct FixedOcr {
    name: String,
    regions: Vec<RawRegion>,
    fail_widths: Vec<u32>,
    calls: AtomicUsize,
}

impl FixedOcr {
    pub fn new(name: &str, regions: Vec<RawRegion>) -> Self {
        Self {
            name: name.to_string(),
            regions,
            fail_widths: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on_width(mut self, width: u32) -> Self {
        self.fail_widths.push(width);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrAdapter for FixedOcr {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_widths.contains(&image.width()) {
            ProviderResult::failure(Error::adapter(&self.name, "unreadable image"))
        } else {
            ProviderResult::success(self.regions.clone())
        };
        Box::pin(async move { result })
    }
}

pub struct BrokenOcr(pub &'static str);

impl OcrAdapter for BrokenOcr {
    fn name(&self) -> &str {
        self.0
    }

    fn detect(&self, _image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        let reason = Error::adapter(self.0, "503 service unavailable");
        Box::pin(async move { ProviderResult::failure(reason) })
    }
}

/// Looks text up in the glossary first, then in its own table; anything else fails.
pub struct TableTranslate {
    name: String,
    table: HashMap<String, String>,
}

impl TableTranslate {
    pub fn new(name: &str, pairs: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            table: pairs
                .iter()
                .map(|(source, target)| (source.to_string(), target.to_string()))
                .collect(),
        }
    }
}

impl TranslateAdapter for TableTranslate {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate<'a>(&'a self, text: &'a str, glossary: &'a Glossary) -> AdapterFuture<'a, String> {
        Box::pin(async move {
            match glossary
                .get(text)
                .or_else(|| self.table.get(text).map(String::as_str))
            {
                Some(target) => ProviderResult::success(target.to_string()),
                None => ProviderResult::failure(Error::adapter(
                    &self.name,
                    format!("no translation for '{}'", text),
                )),
            }
        })
    }
}
