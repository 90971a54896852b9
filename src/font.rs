use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use ttf_parser::Face;
use ttf_parser::name_id;
use usvg::fontdb;

/// Parsed metrics for one font face, shared between layout and compositing.
#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    face_index: u32,
    units_per_em: u16,
    space_advance: u16,
    ascender: i16,
    descender: i16,
    line_gap: i16,
    family: Option<String>,
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("face_index", &self.face_index)
            .field("units_per_em", &self.units_per_em)
            .finish()
    }
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn scale(&self, font_size: f32) -> f32 {
        font_size / self.units_per_em.max(1) as f32
    }
}

/// A font reference resolved to a family name usable by the rasterizer.
#[derive(Debug, Clone)]
pub struct ResolvedFont {
    pub family: String,
    pub metrics: Option<FontMetrics>,
}

impl ResolvedFont {
    /// Family-only font with estimated metrics.
    pub fn estimated(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            metrics: None,
        }
    }

    pub fn metrics(&self) -> Option<&FontMetrics> {
        self.metrics.as_ref()
    }
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(&data, None)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

/// Resolve a style's font reference: a path to a font file, or a family name
/// looked up in `db`.
pub fn resolve_font(db: &fontdb::Database, reference: &str) -> Result<ResolvedFont> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(anyhow!("font reference is empty"));
    }
    if looks_like_path(reference) {
        let metrics = load_font_metrics(Path::new(reference))?;
        let family = metrics
            .family()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "sans-serif".to_string());
        return Ok(ResolvedFont {
            family,
            metrics: Some(metrics),
        });
    }
    load_font_metrics_from_family(db, reference)
}

fn looks_like_path(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    reference.contains('/')
        || reference.contains('\\')
        || [".ttf", ".otf", ".ttc", ".otc"]
            .iter()
            .any(|ext| lower.ends_with(ext))
}

/// Memoizes font resolution per reference. Failed lookups fall back to
/// estimated metrics under the requested family name.
#[derive(Default)]
pub struct FontCache {
    resolved: Mutex<HashMap<String, ResolvedFont>>,
}

impl FontCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, db: &fontdb::Database, reference: &str) -> ResolvedFont {
        let mut resolved = self
            .resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(font) = resolved.get(reference) {
            return font.clone();
        }
        let font = match resolve_font(db, reference) {
            Ok(font) => font,
            Err(err) => {
                tracing::warn!(font = reference, "font lookup failed, estimating metrics: {:#}", err);
                let family = if looks_like_path(reference) {
                    "sans-serif".to_string()
                } else {
                    reference.to_string()
                };
                ResolvedFont::estimated(family)
            }
        };
        resolved.insert(reference.to_string(), font.clone());
        font
    }

    /// Raw font files referenced by path, for loading into the rasterizer's database.
    pub fn file_fonts(&self) -> Vec<Arc<Vec<u8>>> {
        let resolved = self
            .resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut seen = Vec::new();
        let mut keys: Vec<_> = resolved.keys().collect();
        keys.sort();
        for key in keys {
            if !looks_like_path(key) {
                continue;
            }
            if let Some(metrics) = resolved.get(key).and_then(|font| font.metrics.as_ref()) {
                seen.push(metrics.data.clone());
            }
        }
        seen
    }
}

pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font
        && let Ok(face) = Face::parse(&font.data, font.face_index)
    {
        let mut advance = 0u32;
        for ch in text.chars() {
            if ch == '\n' {
                continue;
            }
            if ch == ' ' {
                advance = advance.saturating_add(font.space_advance as u32);
                continue;
            }
            let glyph_advance = face
                .glyph_index(ch)
                .and_then(|glyph| face.glyph_hor_advance(glyph))
                .unwrap_or(font.space_advance);
            advance = advance.saturating_add(glyph_advance as u32);
        }
        return advance as f32 * font.scale(font_size);
    }
    estimate_text_width_units(text) * font_size
}

/// Distance between consecutive baselines before spacing deltas.
pub(crate) fn line_height_px(font_size: f32, font: Option<&FontMetrics>) -> f32 {
    match font {
        Some(font) => {
            let units = font.ascender as f32 - font.descender as f32 + font.line_gap as f32;
            (units * font.scale(font_size)).max(font_size)
        }
        None => font_size * 1.2,
    }
}

/// Baseline offset from the top of a line box.
pub(crate) fn ascent_px(font_size: f32, font: Option<&FontMetrics>) -> f32 {
    match font {
        Some(font) => {
            let scale = font.scale(font_size);
            let natural =
                (font.ascender as f32 - font.descender as f32 + font.line_gap as f32) * scale;
            // centre the glyphs when the line box was padded up to the font size
            let slack = (line_height_px(font_size, Some(font)) - natural).max(0.0);
            font.ascender as f32 * scale + slack / 2.0
        }
        None => font_size * 0.95,
    }
}

fn estimate_char_units_for_width(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if is_wide_char(ch) {
        1.0
    } else {
        0.9
    }
}

pub(crate) fn is_wide_char(ch: char) -> bool {
    matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3000..=0x30FF | 0x31F0..=0x31FF | 0xAC00..=0xD7AF | 0xFF00..=0xFFEF
    )
}

fn estimate_text_width_units(text: &str) -> f32 {
    text.chars()
        .filter(|ch| *ch != '\n')
        .map(estimate_char_units_for_width)
        .sum()
}

fn load_font_metrics_from_data(data: &[u8], preferred_family: Option<&str>) -> Result<FontMetrics> {
    let shared = Arc::new(data.to_vec());
    let mut fallback = None;
    let count = ttf_parser::fonts_in_collection(data).unwrap_or(1);
    for index in 0..count {
        let Ok(face) = Face::parse(data, index) else {
            continue;
        };
        let family = extract_family_name(&face);
        let units_per_em = face.units_per_em().max(1);
        let space_advance = face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 2);
        let metrics = FontMetrics {
            data: shared.clone(),
            face_index: index,
            units_per_em,
            space_advance,
            ascender: face.ascender(),
            descender: face.descender(),
            line_gap: face.line_gap(),
            family: family.clone(),
        };
        if let (Some(preferred), Some(found)) = (preferred_family, &family)
            && found.eq_ignore_ascii_case(preferred)
        {
            return Ok(metrics);
        }
        if fallback.is_none() {
            fallback = Some(metrics);
        }
    }
    fallback.ok_or_else(|| anyhow!("failed to parse font data"))
}

fn load_font_metrics_from_family(db: &fontdb::Database, family: &str) -> Result<ResolvedFont> {
    let families = match family.to_ascii_lowercase().as_str() {
        "sans-serif" | "sans" => vec![fontdb::Family::SansSerif],
        "serif" => vec![fontdb::Family::Serif],
        "monospace" => vec![fontdb::Family::Monospace],
        _ => vec![fontdb::Family::Name(family)],
    };
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let data = db
        .with_face_data(id, |data, _index| data.to_vec())
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    let metrics = load_font_metrics_from_data(&data, Some(family))?;
    let resolved_family = metrics
        .family()
        .map(|name| name.to_string())
        .unwrap_or_else(|| family.to_string());
    Ok(ResolvedFont {
        family: resolved_family,
        metrics: Some(metrics),
    })
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
