use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::adapters::{AdapterSpec, BuildContext, Languages};
use crate::block::{Alignment, FontSize, Orientation, Rgba, TextStyle};
use crate::glossary::Glossary;
use crate::layout::LayoutConfig;
use crate::pipeline::{MergeConfig, PipelineOptions, TieBreak, TimeoutsMs};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub primary_ocr: String,
    pub fallback_ocr: Option<String>,
    pub primary_translate: Option<String>,
    pub fallback_translate: Option<String>,
    pub timeouts: TimeoutsMs,
    pub tesseract_languages: String,
    pub proxy: Option<String>,
    pub local_base_url: String,
    pub local_model: String,
    pub style: TextStyle,
    /// Raw `[style].size`, resolved against `font_size_mapping` after all layers merge.
    pub style_size: String,
    pub layout: LayoutConfig,
    pub font_size_mapping: BTreeMap<String, u32>,
    pub source_lang: String,
    pub target_lang: String,
    pub merge: MergeConfig,
    pub workers: usize,
    pub translate_concurrency: usize,
    /// Grow each finished block until its translation fits before rendering.
    pub auto_fit: bool,
    pub glossary_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            primary_ocr: "gemini".to_string(),
            fallback_ocr: None,
            primary_translate: None,
            fallback_translate: None,
            timeouts: TimeoutsMs::default(),
            tesseract_languages: "eng".to_string(),
            proxy: None,
            local_base_url: "http://127.0.0.1:8080/v1".to_string(),
            local_model: "local-model".to_string(),
            style: TextStyle::default(),
            style_size: "auto".to_string(),
            layout: LayoutConfig::default(),
            font_size_mapping: BTreeMap::new(),
            source_lang: "auto".to_string(),
            target_lang: "en".to_string(),
            merge: MergeConfig::default(),
            workers: 0,
            translate_concurrency: 4,
            auto_fit: true,
            glossary_path: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    providers: Option<ProviderSettings>,
    local_llm: Option<LocalLlmSettings>,
    style: Option<StyleSettings>,
    font_size_mapping: Option<BTreeMap<String, u32>>,
    pipeline: Option<PipelineSettings>,
    glossary: Option<GlossarySettings>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSettings {
    primary_ocr: Option<String>,
    fallback_ocr: Option<String>,
    primary_translate: Option<String>,
    fallback_translate: Option<String>,
    ocr_timeout_ms: Option<u64>,
    translate_timeout_ms: Option<u64>,
    tesseract_languages: Option<String>,
    proxy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LocalLlmSettings {
    base_url: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StyleSettings {
    font: Option<String>,
    size: Option<SizeSetting>,
    color: Option<String>,
    outline_color: Option<String>,
    background_color: Option<String>,
    outline_thickness: Option<f32>,
    h_spacing: Option<f32>,
    v_spacing: Option<f32>,
    char_spacing: Option<f32>,
    padding: Option<f32>,
    orientation: Option<Orientation>,
    alignment: Option<Alignment>,
    min_font_size: Option<u32>,
    max_font_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeSetting {
    Pixels(u32),
    Name(String),
}

#[derive(Debug, Default, Deserialize)]
struct PipelineSettings {
    source_lang: Option<String>,
    target_lang: Option<String>,
    iou_threshold: Option<f32>,
    tie_break: Option<TieBreak>,
    join_fragments: Option<bool>,
    auto_fit: Option<bool>,
    workers: Option<usize>,
    translate_concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GlossarySettings {
    path: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let home = home_dir();
    if let Some(home) = &home {
        ensure_home_settings_file(home)?;
    }
    load_settings_from(home.as_deref(), extra_path)
}

/// Merge `./settings.toml`, `./settings.local.toml`, the two files under
/// `home`, then `extra_path`. Later layers win key by key.
pub fn load_settings_from(home: Option<&Path>, extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings
                .merge(parsed)
                .with_context(|| format!("invalid settings: {}", path.display()))?;
        }
    }

    settings.style.font_size = settings.resolve_font_size(&settings.style_size)?;
    settings.style.validate()?;
    Ok(settings)
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(providers) = incoming.providers {
            if let Some(name) = providers.primary_ocr.and_then(slot_name) {
                self.primary_ocr = name;
            }
            if let Some(name) = providers.fallback_ocr {
                self.fallback_ocr = slot_name(name);
            }
            if let Some(name) = providers.primary_translate {
                self.primary_translate = slot_name(name);
            }
            if let Some(name) = providers.fallback_translate {
                self.fallback_translate = slot_name(name);
            }
            if let Some(ms) = providers.ocr_timeout_ms.filter(|ms| *ms > 0) {
                self.timeouts.ocr = ms;
            }
            if let Some(ms) = providers.translate_timeout_ms.filter(|ms| *ms > 0) {
                self.timeouts.translate = ms;
            }
            if let Some(languages) = providers.tesseract_languages.and_then(non_empty) {
                self.tesseract_languages = languages;
            }
            if let Some(proxy) = providers.proxy {
                self.proxy = non_empty(proxy);
            }
        }
        if let Some(local) = incoming.local_llm {
            if let Some(url) = local.base_url.and_then(non_empty) {
                self.local_base_url = url;
            }
            if let Some(model) = local.model.and_then(non_empty) {
                self.local_model = model;
            }
        }
        if let Some(mapping) = incoming.font_size_mapping {
            for (name, size) in mapping {
                if size == 0 {
                    bail!("font size '{}' must be positive", name);
                }
                self.font_size_mapping.insert(name.to_lowercase(), size);
            }
        }
        if let Some(style) = incoming.style {
            self.merge_style(style)?;
        }
        if let Some(pipeline) = incoming.pipeline {
            if let Some(lang) = pipeline.source_lang.and_then(non_empty) {
                self.source_lang = lang;
            }
            if let Some(lang) = pipeline.target_lang.and_then(non_empty) {
                self.target_lang = lang;
            }
            if let Some(threshold) = pipeline.iou_threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    bail!("iou_threshold must be within 0..=1 (got {})", threshold);
                }
                self.merge.iou_threshold = threshold;
            }
            if let Some(tie_break) = pipeline.tie_break {
                self.merge.tie_break = tie_break;
            }
            if let Some(join) = pipeline.join_fragments {
                self.merge.join_fragments = join;
            }
            if let Some(auto_fit) = pipeline.auto_fit {
                self.auto_fit = auto_fit;
            }
            if let Some(workers) = pipeline.workers {
                self.workers = workers;
            }
            if let Some(concurrency) = pipeline.translate_concurrency.filter(|c| *c > 0) {
                self.translate_concurrency = concurrency;
            }
        }
        if let Some(glossary) = incoming.glossary
            && let Some(path) = glossary.path
        {
            self.glossary_path = non_empty(path).map(PathBuf::from);
        }
        Ok(())
    }

    fn merge_style(&mut self, style: StyleSettings) -> Result<()> {
        if let Some(font) = style.font.and_then(non_empty) {
            self.style.font = font;
        }
        if let Some(size) = style.size {
            self.style_size = match size {
                SizeSetting::Pixels(px) => px.to_string(),
                SizeSetting::Name(name) => name,
            };
        }
        for (value, slot) in [
            (style.color, &mut self.style.color),
            (style.outline_color, &mut self.style.outline_color),
            (style.background_color, &mut self.style.background_color),
        ] {
            if let Some(value) = value {
                *slot = Rgba::from_hex(&value)
                    .ok_or_else(|| anyhow!("invalid color '{}'", value))?;
            }
        }
        if let Some(value) = style.outline_thickness {
            self.style.outline_thickness = value;
        }
        if let Some(value) = style.h_spacing {
            self.style.h_spacing = value;
        }
        if let Some(value) = style.v_spacing {
            self.style.v_spacing = value;
        }
        if let Some(value) = style.char_spacing {
            self.style.char_spacing = value;
        }
        if let Some(value) = style.padding {
            self.style.padding = value;
        }
        if let Some(orientation) = style.orientation {
            self.style = self.style.clone().with_orientation(orientation);
        }
        if let Some(alignment) = style.alignment {
            self.style.alignment = alignment;
        }
        if let Some(size) = style.min_font_size.filter(|s| *s > 0) {
            self.layout.min_font_size = size;
        }
        if let Some(size) = style.max_font_size.filter(|s| *s > 0) {
            self.layout.max_font_size = size;
        }
        Ok(())
    }

    /// `auto`, a pixel count, or a category from `[font_size_mapping]`.
    pub fn resolve_font_size(&self, value: &str) -> Result<FontSize> {
        let value = value.trim().to_lowercase();
        if value == "auto" {
            return Ok(FontSize::Auto);
        }
        if let Ok(px) = value.trim_end_matches("px").parse::<u32>() {
            if px == 0 {
                bail!("font size must be positive");
            }
            return Ok(FontSize::Fixed(px));
        }
        self.font_size_mapping
            .get(&value)
            .map(|px| FontSize::Fixed(*px))
            .ok_or_else(|| anyhow!("unknown font size '{}'", value))
    }

    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        let parse = |name: &str| {
            name.parse::<AdapterSpec>()
                .with_context(|| format!("invalid adapter in settings: {}", name))
        };
        let optional = |name: &Option<String>| name.as_deref().map(parse).transpose();
        Ok(PipelineOptions {
            primary_ocr: parse(&self.primary_ocr)?,
            fallback_ocr: optional(&self.fallback_ocr)?,
            primary_translate: optional(&self.primary_translate)?,
            fallback_translate: optional(&self.fallback_translate)?,
            timeouts_ms: self.timeouts,
            proxy: self.proxy.clone(),
        })
    }

    pub fn build_context(&self) -> BuildContext {
        let mut context =
            BuildContext::new(Languages::new(&self.source_lang, &self.target_lang));
        context.local_base_url = self.local_base_url.clone();
        context.local_model = self.local_model.clone();
        context.tesseract_languages = self.tesseract_languages.clone();
        context.font_sizes = self.font_size_mapping.clone();
        context
    }

    pub fn load_glossary(&self) -> Result<Glossary> {
        match &self.glossary_path {
            Some(path) => Glossary::load(path),
            None => Ok(Glossary::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Adapter slot value; empty or `none` clears the slot.
fn slot_name(value: String) -> Option<String> {
    non_empty(value).filter(|name| !name.eq_ignore_ascii_case("none"))
}

fn ensure_home_settings_file(home: &Path) -> Result<()> {
    fs::create_dir_all(home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".llm-image-translator"))
        }
    })
}
