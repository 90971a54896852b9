use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::geometry::{Anchor, Geometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FontSize {
    Fixed(u32),
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    VerticalLtr,
    VerticalRtl,
}

impl Orientation {
    pub fn is_vertical(self) -> bool {
        !matches!(self, Orientation::Horizontal)
    }

    pub fn default_alignment(self) -> Alignment {
        if self.is_vertical() {
            Alignment::Right
        } else {
            Alignment::Left
        }
    }
}

/// Line placement inside the block. For vertical text it places each column's
/// characters at the top, middle or bottom of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);

    pub fn alpha(self) -> u8 {
        self.0[3]
    }

    pub(crate) fn svg_rgb(self) -> String {
        let [r, g, b, _] = self.0;
        format!("rgb({},{},{})", r, g, b)
    }

    pub(crate) fn svg_opacity(self) -> f32 {
        self.alpha() as f32 / 255.0
    }

    /// `#rrggbb` or `#rrggbbaa`; the leading `#` is optional.
    pub fn from_hex(value: &str) -> Option<Self> {
        let hex = value.trim().trim_start_matches('#');
        if !matches!(hex.len(), 6 | 8) || !hex.is_ascii() {
            return None;
        }
        let channel = |idx: usize| u8::from_str_radix(&hex[idx * 2..idx * 2 + 2], 16).ok();
        let alpha = if hex.len() == 8 { channel(3)? } else { 255 };
        Some(Rgba([channel(0)?, channel(1)?, channel(2)?, alpha]))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    /// System family name or path to a font file.
    pub font: String,
    pub font_size: FontSize,
    pub color: Rgba,
    pub outline_color: Rgba,
    pub background_color: Rgba,
    pub outline_thickness: f32,
    /// Added to the column step of vertical text.
    pub h_spacing: f32,
    /// Added to the line step of horizontal text.
    pub v_spacing: f32,
    /// Extra space between glyphs along a line or column.
    pub char_spacing: f32,
    pub padding: f32,
    pub orientation: Orientation,
    pub alignment: Alignment,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font: "sans-serif".to_string(),
            font_size: FontSize::Auto,
            color: Rgba([255, 255, 255, 255]),
            outline_color: Rgba([0, 0, 0, 255]),
            background_color: Rgba([0, 0, 0, 128]),
            outline_thickness: 2.0,
            h_spacing: 0.0,
            v_spacing: 0.0,
            char_spacing: 0.0,
            padding: 3.0,
            orientation: Orientation::Horizontal,
            alignment: Alignment::Left,
        }
    }
}

impl TextStyle {
    pub fn validate(&self) -> Result<(), Error> {
        if self.font.trim().is_empty() {
            return Err(Error::EmptyFont);
        }
        if let FontSize::Fixed(0) = self.font_size {
            return Err(Error::geometry("font size must be positive"));
        }
        if !self.outline_thickness.is_finite() || self.outline_thickness < 0.0 {
            return Err(Error::geometry("outline thickness must be >= 0"));
        }
        if !self.padding.is_finite() || self.padding < 0.0 {
            return Err(Error::geometry("padding must be >= 0"));
        }
        for value in [self.h_spacing, self.v_spacing, self.char_spacing] {
            if !value.is_finite() {
                return Err(Error::geometry("spacing must be finite"));
            }
        }
        Ok(())
    }

    /// Same style with orientation changed and alignment reset to that orientation's default.
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self.alignment = orientation.default_alignment();
        self
    }

    pub fn patched(&self, patch: &StylePatch) -> Result<Self, Error> {
        let mut next = self.clone();
        if let Some(font) = &patch.font {
            next.font = font.clone();
        }
        if let Some(size) = patch.font_size {
            next.font_size = size;
        }
        if let Some(color) = patch.color {
            next.color = color;
        }
        if let Some(color) = patch.outline_color {
            next.outline_color = color;
        }
        if let Some(color) = patch.background_color {
            next.background_color = color;
        }
        if let Some(value) = patch.outline_thickness {
            next.outline_thickness = value;
        }
        if let Some(value) = patch.h_spacing {
            next.h_spacing = value;
        }
        if let Some(value) = patch.v_spacing {
            next.v_spacing = value;
        }
        if let Some(value) = patch.char_spacing {
            next.char_spacing = value;
        }
        if let Some(value) = patch.padding {
            next.padding = value;
        }
        if let Some(orientation) = patch.orientation {
            next.orientation = orientation;
        }
        if let Some(alignment) = patch.alignment {
            next.alignment = alignment;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial style update. Unknown keys are rejected when parsed from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StylePatch {
    pub font: Option<String>,
    pub font_size: Option<FontSize>,
    pub color: Option<Rgba>,
    pub outline_color: Option<Rgba>,
    pub background_color: Option<Rgba>,
    pub outline_thickness: Option<f32>,
    pub h_spacing: Option<f32>,
    pub v_spacing: Option<f32>,
    pub char_spacing: Option<f32>,
    pub padding: Option<f32>,
    pub orientation: Option<Orientation>,
    pub alignment: Option<Alignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlockStatus {
    Ok,
    PartialFailure { detail: String },
}

impl BlockStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BlockStatus::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub id: BlockId,
    pub geometry: Geometry,
    pub original_text: String,
    pub translated_text: String,
    pub style: TextStyle,
    pub confidence: Option<f32>,
    pub status: BlockStatus,
}

/// A single-block edit. Multi-select edits are applied one block at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    Move { dx: i32, dy: i32 },
    Resize { width: i64, height: i64, anchor: Anchor },
    Rotate { delta_degrees: f32 },
    SetText(String),
    SetStyle(StylePatch),
}

impl TextBlock {
    /// A block added by hand: no text, the given style.
    pub fn empty(geometry: Geometry, style: TextStyle) -> Self {
        Self {
            id: BlockId::new(),
            geometry,
            original_text: String::new(),
            translated_text: String::new(),
            style,
            confidence: None,
            status: BlockStatus::Ok,
        }
    }

    pub fn detected(
        geometry: Geometry,
        original_text: impl Into<String>,
        translated_text: impl Into<String>,
        style: TextStyle,
        confidence: Option<f32>,
    ) -> Self {
        Self {
            id: BlockId::new(),
            geometry,
            original_text: original_text.into(),
            translated_text: translated_text.into(),
            style,
            confidence,
            status: BlockStatus::Ok,
        }
    }

    pub fn with_status(mut self, status: BlockStatus) -> Self {
        self.status = status;
        self
    }

    pub fn moved(&self, dx: i32, dy: i32) -> Result<Self, Error> {
        Ok(Self {
            geometry: self.geometry.translated(dx, dy)?,
            ..self.clone()
        })
    }

    pub fn resized(&self, width: i64, height: i64, anchor: Anchor) -> Result<Self, Error> {
        Ok(Self {
            geometry: self.geometry.resized(width, height, anchor)?,
            ..self.clone()
        })
    }

    pub fn rotated(&self, delta_degrees: f32) -> Result<Self, Error> {
        Ok(Self {
            geometry: self.geometry.rotated(delta_degrees)?,
            ..self.clone()
        })
    }

    /// Replace the translated text. A successful manual fill clears a failure status.
    pub fn with_text(&self, text: impl Into<String>) -> Result<Self, Error> {
        let text = text.into();
        let status = if text.trim().is_empty() {
            self.status.clone()
        } else {
            BlockStatus::Ok
        };
        Ok(Self {
            translated_text: text,
            status,
            ..self.clone()
        })
    }

    pub fn with_style(&self, patch: &StylePatch) -> Result<Self, Error> {
        Ok(Self {
            style: self.style.patched(patch)?,
            ..self.clone()
        })
    }

    pub fn apply(&self, edit: &Edit) -> Result<Self, Error> {
        match edit {
            Edit::Move { dx, dy } => self.moved(*dx, *dy),
            Edit::Resize {
                width,
                height,
                anchor,
            } => self.resized(*width, *height, *anchor),
            Edit::Rotate { delta_degrees } => self.rotated(*delta_degrees),
            Edit::SetText(text) => self.with_text(text.clone()),
            Edit::SetStyle(patch) => self.with_style(patch),
        }
    }
}
