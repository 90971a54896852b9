use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::prompts::{
    DETECT_TOOL, DetectPrompt, Languages, TRANSLATE_TOOL, detect_tool_spec, render_detect_prompt,
    render_translate_prompt, translate_tool_spec,
};
use super::{
    AdapterFuture, ItemError, MultiModalAdapter, OcrAdapter, ProviderResult, RawRegion,
    TranslateAdapter, encode_png,
};
use crate::block::{BlockStatus, FontSize, Orientation, TextBlock, TextStyle};
use crate::error::{Error, from_anyhow};
use crate::geometry::{BBoxPx, Geometry, horizontal_overlap_ratio, vertical_overlap_ratio};
use crate::glossary::Glossary;
use crate::providers::{DataAttachment, Provider, ProviderImpl};

/// Vision-capable chat model used for detection, translation, or both at once.
pub struct LlmVision {
    name: String,
    provider: ProviderImpl,
    languages: Languages,
    font_sizes: BTreeMap<String, u32>,
}

impl LlmVision {
    pub fn new(name: impl Into<String>, provider: ProviderImpl, languages: Languages) -> Self {
        Self {
            name: name.into(),
            provider,
            languages,
            font_sizes: BTreeMap::new(),
        }
    }

    /// Pixel sizes for the size classes the model reports. Unmapped classes are ignored.
    pub fn with_font_sizes(mut self, font_sizes: BTreeMap<String, u32>) -> Self {
        self.font_sizes = font_sizes;
        self
    }

    async fn run_detection(
        &self,
        image: Arc<RgbaImage>,
        region_hint: Option<BBoxPx>,
        translate: bool,
        glossary: &Glossary,
    ) -> Result<Vec<RawRegion>> {
        let (width, height) = image.dimensions();
        let png = encode_png(&image)?;
        let prompt = render_detect_prompt(&DetectPrompt {
            languages: &self.languages,
            translate,
            glossary,
            width,
            height,
            region_hint,
        })?;
        let response = self
            .provider
            .clone()
            .register_tool(detect_tool_spec(translate))
            .append_system_input(prompt)
            .append_user_data(DataAttachment {
                bytes: png,
                mime: "image/png".to_string(),
                name: Some("image.png".to_string()),
            })
            .append_user_input("Report the text regions in this image.".to_string())
            .call_tool(DETECT_TOOL)
            .await?;
        debug!(provider = %self.name, model = ?response.model, "detection response received");
        parse_detection(response.args, width, height, region_hint, &self.font_sizes)
    }

    fn detect_only(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        Box::pin(async move {
            let glossary = Glossary::new();
            self.run_detection(image, None, false, &glossary)
                .await
                .map_err(|err| from_anyhow(&self.name, err))
                .into()
        })
    }
}

/// Detection-only use of a vision model, as an OCR backend.
impl OcrAdapter for LlmVision {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        self.detect_only(image)
    }
}

impl MultiModalAdapter for LlmVision {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        self.detect_only(image)
    }

    fn translate<'a>(&'a self, text: &'a str, glossary: &'a Glossary) -> AdapterFuture<'a, String> {
        Box::pin(async move {
            translate_with(&self.provider, &self.languages, text, glossary)
                .await
                .map_err(|err| from_anyhow(&self.name, err))
                .into()
        })
    }

    fn detect_and_translate<'a>(
        &'a self,
        image: Arc<RgbaImage>,
        region_hint: Option<BBoxPx>,
        glossary: &'a Glossary,
    ) -> AdapterFuture<'a, Vec<TextBlock>> {
        Box::pin(async move {
            let regions = match self.run_detection(image, region_hint, true, glossary).await {
                Ok(regions) => regions,
                Err(err) => return ProviderResult::failure(from_anyhow(&self.name, err)),
            };
            regions_to_blocks(&self.name, regions)
        })
    }
}

/// Build blocks from regions that carry translations. Regions whose
/// translation is missing still become blocks, flagged as partial failures.
pub(crate) fn regions_to_blocks(provider: &str, regions: Vec<RawRegion>) -> ProviderResult<Vec<TextBlock>> {
    let mut blocks = Vec::with_capacity(regions.len());
    let mut errors = Vec::new();
    for (index, region) in regions.into_iter().enumerate() {
        let geometry = match Geometry::from_bbox(&region.bbox).and_then(|g| g.rotated(region.angle)) {
            Ok(geometry) => geometry,
            Err(error) => {
                errors.push(ItemError { index, error });
                continue;
            }
        };
        let orientation = region.orientation.unwrap_or(Orientation::Horizontal);
        let mut style = TextStyle::default().with_orientation(orientation);
        if let Some(size) = region.font_size {
            style.font_size = FontSize::Fixed(size);
        }
        let translation = region
            .translation
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        let mut block =
            TextBlock::detected(geometry, region.text, translation, style, region.confidence);
        if block.translated_text.is_empty() {
            let error = Error::adapter(provider, "no translation returned for region");
            block = block.with_status(BlockStatus::PartialFailure {
                detail: error.to_string(),
            });
            errors.push(ItemError { index, error });
        }
        blocks.push(block);
    }
    if errors.is_empty() {
        ProviderResult::success(blocks)
    } else {
        ProviderResult::PartialFailure {
            value: blocks,
            errors,
        }
    }
}

/// Text-only chat model used as a translation backend.
pub struct LlmText {
    name: String,
    provider: ProviderImpl,
    languages: Languages,
}

impl LlmText {
    pub fn new(name: impl Into<String>, provider: ProviderImpl, languages: Languages) -> Self {
        Self {
            name: name.into(),
            provider,
            languages,
        }
    }
}

impl TranslateAdapter for LlmText {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate<'a>(&'a self, text: &'a str, glossary: &'a Glossary) -> AdapterFuture<'a, String> {
        Box::pin(async move {
            translate_with(&self.provider, &self.languages, text, glossary)
                .await
                .map_err(|err| from_anyhow(&self.name, err))
                .into()
        })
    }
}

async fn translate_with(
    provider: &ProviderImpl,
    languages: &Languages,
    text: &str,
    glossary: &Glossary,
) -> Result<String> {
    let prompt = render_translate_prompt(languages, &glossary.matching(text))?;
    let response = provider
        .clone()
        .register_tool(translate_tool_spec())
        .append_system_input(prompt)
        .append_user_input(text.to_string())
        .call_tool(TRANSLATE_TOOL)
        .await?;
    let args: TranslateArgs = serde_json::from_value(response.args)
        .with_context(|| "failed to parse translation tool arguments")?;
    let translation = args.translation.trim();
    if translation.is_empty() {
        return Err(anyhow!("translation is empty"));
    }
    Ok(translation.to_string())
}

#[derive(Debug, Deserialize)]
struct TranslateArgs {
    translation: String,
}

#[derive(Debug, Deserialize)]
struct DetectArgs {
    #[serde(default)]
    blocks: Vec<DetectedBlock>,
}

#[derive(Debug, Deserialize)]
struct DetectedBlock {
    bbox: Vec<f64>,
    #[serde(default)]
    text: String,
    translation: Option<String>,
    orientation: Option<String>,
    angle: Option<f32>,
    confidence: Option<f32>,
    font_size_category: Option<String>,
}

fn parse_detection(
    args: serde_json::Value,
    width: u32,
    height: u32,
    region_hint: Option<BBoxPx>,
    font_sizes: &BTreeMap<String, u32>,
) -> Result<Vec<RawRegion>> {
    let args: DetectArgs =
        serde_json::from_value(args).with_context(|| "failed to parse detection tool arguments")?;
    let mut regions = Vec::new();
    for block in args.blocks {
        let text = block.text.trim();
        if text.is_empty() {
            continue;
        }
        let Some(bbox) = clamp_bbox(&block.bbox, width, height) else {
            debug!(text, bbox = ?block.bbox, "dropping region with unusable bbox");
            continue;
        };
        if let Some(hint) = region_hint
            && (horizontal_overlap_ratio(&bbox, &hint) == 0.0
                || vertical_overlap_ratio(&bbox, &hint) == 0.0)
        {
            continue;
        }
        let mut region = RawRegion::new(text, bbox);
        if let Some(confidence) = block.confidence.filter(|c| c.is_finite()) {
            region = region.with_confidence(confidence);
        }
        region.orientation = block.orientation.as_deref().and_then(parse_orientation);
        region.angle = block.angle.filter(|a| a.is_finite()).unwrap_or(0.0);
        region.translation = block.translation;
        region.font_size = block
            .font_size_category
            .and_then(|class| font_sizes.get(&class.trim().to_ascii_lowercase()).copied())
            .filter(|size| *size > 0);
        regions.push(region);
    }
    Ok(regions)
}

fn clamp_bbox(values: &[f64], width: u32, height: u32) -> Option<BBoxPx> {
    let [x0, y0, x1, y1] = values else {
        return None;
    };
    if ![x0, y0, x1, y1].iter().all(|value| value.is_finite()) {
        return None;
    }
    let clamp = |value: f64, max: u32| value.round().clamp(0.0, max as f64) as u32;
    let (x0, x1) = (clamp(x0.min(*x1), width), clamp(x0.max(*x1), width));
    let (y0, y1) = (clamp(y0.min(*y1), height), clamp(y0.max(*y1), height));
    BBoxPx::from_corners(x0, y0, x1, y1)
}

fn parse_orientation(value: &str) -> Option<Orientation> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "horizontal" => Some(Orientation::Horizontal),
        "vertical" | "vertical_rtl" => Some(Orientation::VerticalRtl),
        "vertical_ltr" => Some(Orientation::VerticalLtr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detection_clamps_and_filters_regions() {
        let args = json!({
            "blocks": [
                {"bbox": [-5, 10, 120, 60], "text": " 猫 ", "orientation": "vertical", "confidence": 1.4},
                {"bbox": [10, 10, 10, 50], "text": "degenerate"},
                {"bbox": [1, 2, 3], "text": "short bbox"},
                {"bbox": [5, 5, 40, 40], "text": "   "},
                {"bbox": [90, 70, 30, 20], "text": "swapped", "angle": 12.5}
            ]
        });
        let regions = parse_detection(args, 100, 80, None, &BTreeMap::new()).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].text, "猫");
        assert_eq!(regions[0].bbox, BBoxPx { x: 0, y: 10, w: 100, h: 50 });
        assert_eq!(regions[0].orientation, Some(Orientation::VerticalRtl));
        assert_eq!(regions[0].confidence, Some(1.0));
        assert_eq!(regions[1].bbox, BBoxPx { x: 30, y: 20, w: 60, h: 50 });
        assert_eq!(regions[1].angle, 12.5);
    }

    #[test]
    fn region_hint_drops_outside_regions() {
        let args = json!({
            "blocks": [
                {"bbox": [0, 0, 10, 10], "text": "inside"},
                {"bbox": [50, 50, 60, 60], "text": "outside"}
            ]
        });
        let hint = BBoxPx::from_corners(0, 0, 20, 20);
        let regions = parse_detection(args, 100, 100, hint, &BTreeMap::new()).unwrap();
        let texts: Vec<_> = regions.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["inside"]);
    }

    #[test]
    fn size_class_maps_to_fixed_font_size() {
        let args = json!({
            "blocks": [
                {"bbox": [0, 0, 80, 20], "text": "タイトル", "translation": "Title", "font_size_category": "Large"},
                {"bbox": [0, 30, 80, 40], "text": "注釈", "translation": "Note", "font_size_category": "tiny"},
                {"bbox": [0, 50, 80, 60], "text": "本文", "translation": "Body"}
            ]
        });
        let font_sizes = BTreeMap::from([("large".to_string(), 28), ("small".to_string(), 16)]);
        let regions = parse_detection(args, 100, 100, None, &font_sizes).unwrap();
        let sizes: Vec<_> = regions.iter().map(|r| r.font_size).collect();
        assert_eq!(sizes, [Some(28), None, None]);

        let ProviderResult::Success { value, .. } = regions_to_blocks("vision", regions) else {
            panic!("expected success");
        };
        assert_eq!(value[0].style.font_size, FontSize::Fixed(28));
        assert_eq!(value[2].style.font_size, FontSize::Auto);
    }

    #[test]
    fn missing_translation_is_partial_failure() {
        let bbox = BBoxPx { x: 0, y: 0, w: 20, h: 10 };
        let mut translated = RawRegion::new("猫", bbox);
        translated.translation = Some("cat".to_string());
        let untranslated = RawRegion::new("犬", bbox);
        let result = regions_to_blocks("vision", vec![translated, untranslated]);
        let ProviderResult::PartialFailure { value, errors } = result else {
            panic!("expected partial failure");
        };
        assert_eq!(value.len(), 2);
        assert_eq!(errors[0].index, 1);
        assert!(value[0].status.is_ok());
        assert!(!value[1].status.is_ok());
        assert!(value[1].translated_text.is_empty());
    }
}
