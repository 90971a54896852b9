mod wrap;

use serde::{Deserialize, Serialize};

use crate::block::{Alignment, FontSize, Orientation, TextBlock};
use crate::error::Error;
use crate::font::{FontMetrics, ResolvedFont, ascent_px, line_height_px};
use wrap::{Measure, rotates_in_vertical, split_columns, wrap_lines};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub min_font_size: u32,
    pub max_font_size: u32,
    /// Slack kept free on each axis when deciding whether text fits.
    pub fit_margin: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            min_font_size: 12,
            max_font_size: 96,
            fit_margin: 2.0,
        }
    }
}

impl LayoutConfig {
    fn size_range(&self) -> (u32, u32) {
        let min = self.min_font_size.max(1);
        (min, self.max_font_size.max(min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAnchor {
    Start,
    Middle,
}

/// One positioned piece of text in the block's local frame: origin at the
/// top-left corner of the unrotated block, y pointing down, `y` on the baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlyphRun {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub anchor: TextAnchor,
    /// Extra rotation in degrees around `pivot`, used for turned punctuation.
    pub rotation: f32,
    pub pivot: (f32, f32),
}

/// Everything the compositor needs to draw one block's text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapingPlan {
    pub font_family: String,
    pub font_size: u32,
    pub letter_spacing: f32,
    pub runs: Vec<GlyphRun>,
    pub content_width: f32,
    pub content_height: f32,
    pub overflowed: bool,
}

impl ShapingPlan {
    /// The advisory overflow flag as an error value, for diagnostics.
    pub fn overflow(&self) -> Option<Error> {
        self.overflowed.then_some(Error::Overflowed {
            font_size: self.font_size,
        })
    }
}

/// Lines or columns at one candidate size, before positioning.
struct Shaped {
    font_size: u32,
    pieces: Vec<Piece>,
    content_width: f32,
    content_height: f32,
}

enum Piece {
    Line(String, f32),
    Column(Vec<char>),
}

struct Frame {
    width: f32,
    height: f32,
    padding: f32,
    margin: f32,
}

impl Frame {
    fn of(block: &TextBlock, config: &LayoutConfig) -> Self {
        Self {
            width: block.geometry.width as f32,
            height: block.geometry.height as f32,
            padding: block.style.padding,
            margin: config.fit_margin.max(0.0),
        }
    }

    fn inner_width(&self) -> f32 {
        self.width - 2.0 * self.padding
    }

    fn inner_height(&self) -> f32 {
        self.height - 2.0 * self.padding
    }

    fn avail_width(&self) -> f32 {
        self.inner_width() - self.margin
    }

    fn avail_height(&self) -> f32 {
        self.inner_height() - self.margin
    }

    fn fits(&self, shaped: &Shaped) -> bool {
        shaped.content_width <= self.avail_width() && shaped.content_height <= self.avail_height()
    }
}

/// Shape a block's translated text. Pure: the same block, font and config
/// always give the same plan.
pub fn layout_block(block: &TextBlock, font: &ResolvedFont, config: &LayoutConfig) -> ShapingPlan {
    let frame = Frame::of(block, config);
    let metrics = font.metrics();
    let text = block.translated_text.as_str();
    let (min_size, max_size) = config.size_range();

    let (shaped, overflowed) = match block.style.font_size {
        FontSize::Fixed(size) => {
            let shaped = shape(block, text, size.max(1), metrics, &frame);
            let fits = frame.fits(&shaped);
            (shaped, !fits)
        }
        FontSize::Auto if text.trim().is_empty() => {
            (shape(block, text, min_size, metrics, &frame), false)
        }
        FontSize::Auto => {
            let smallest = shape(block, text, min_size, metrics, &frame);
            if !frame.fits(&smallest) {
                (smallest, true)
            } else {
                // fitting is monotone in size, so the largest fit is found by bisection
                let mut best = smallest;
                let (mut lo, mut hi) = (min_size + 1, max_size);
                while lo <= hi {
                    let mid = lo + (hi - lo) / 2;
                    let candidate = shape(block, text, mid, metrics, &frame);
                    if frame.fits(&candidate) {
                        best = candidate;
                        lo = mid + 1;
                    } else {
                        hi = mid - 1;
                    }
                }
                (best, false)
            }
        }
    };

    let runs = position(block, &shaped, metrics, &frame);
    ShapingPlan {
        font_family: font.family.clone(),
        font_size: shaped.font_size,
        letter_spacing: if block.style.orientation.is_vertical() {
            0.0
        } else {
            block.style.char_spacing
        },
        runs,
        content_width: shaped.content_width,
        content_height: shaped.content_height,
        overflowed,
    }
}

/// Block size needed to show the whole text at the block's font size (the
/// minimum size for auto), never smaller than the current size.
pub fn required_size(block: &TextBlock, font: &ResolvedFont, config: &LayoutConfig) -> (u32, u32) {
    let frame = Frame::of(block, config);
    let size = match block.style.font_size {
        FontSize::Fixed(size) => size.max(1),
        FontSize::Auto => config.size_range().0,
    };
    let shaped = shape(block, &block.translated_text, size, font.metrics(), &frame);
    let chrome = 2.0 * frame.padding + frame.margin;
    let width = (shaped.content_width + chrome).ceil() as u32;
    let height = (shaped.content_height + chrome).ceil() as u32;
    (
        width.max(block.geometry.width),
        height.max(block.geometry.height),
    )
}

fn shape(
    block: &TextBlock,
    text: &str,
    font_size: u32,
    metrics: Option<&FontMetrics>,
    frame: &Frame,
) -> Shaped {
    let style = &block.style;
    let size = font_size as f32;
    let line_height = line_height_px(size, metrics);

    if style.orientation.is_vertical() {
        let cell = line_height + style.char_spacing;
        let capacity = ((frame.avail_height() + style.char_spacing) / cell).floor();
        let capacity = if capacity.is_finite() && capacity >= 1.0 {
            capacity as usize
        } else {
            1
        };
        let columns = split_columns(text, capacity);
        let count = columns.len();
        let longest = columns.iter().map(Vec::len).max().unwrap_or(0);
        let content_width = stacked(count, size, style.h_spacing);
        let content_height = stacked(longest, line_height, style.char_spacing);
        return Shaped {
            font_size,
            pieces: columns.into_iter().map(Piece::Column).collect(),
            content_width,
            content_height,
        };
    }

    let measure = Measure {
        font: metrics,
        font_size: size,
        char_spacing: style.char_spacing,
    };
    let lines = wrap_lines(text, frame.avail_width(), &measure);
    let pieces: Vec<Piece> = lines
        .into_iter()
        .map(|line| {
            let width = measure.width(&line);
            Piece::Line(line, width)
        })
        .collect();
    let content_width = pieces
        .iter()
        .map(|piece| match piece {
            Piece::Line(_, width) => *width,
            Piece::Column(_) => 0.0,
        })
        .fold(0.0, f32::max);
    let content_height = stacked(pieces.len(), line_height, style.v_spacing);
    Shaped {
        font_size,
        pieces,
        content_width,
        content_height,
    }
}

fn stacked(count: usize, extent: f32, gap: f32) -> f32 {
    if count == 0 {
        return 0.0;
    }
    count as f32 * extent + (count - 1) as f32 * gap
}

fn position(
    block: &TextBlock,
    shaped: &Shaped,
    metrics: Option<&FontMetrics>,
    frame: &Frame,
) -> Vec<GlyphRun> {
    let style = &block.style;
    let size = shaped.font_size as f32;
    let line_height = line_height_px(size, metrics);
    let ascent = ascent_px(size, metrics);
    let inner_w = frame.inner_width();
    let inner_h = frame.inner_height();
    let mut runs = Vec::new();

    if style.orientation.is_vertical() {
        let column_step = size + style.h_spacing;
        let cell_step = line_height + style.char_spacing;
        let left = frame.padding + ((inner_w - shaped.content_width) / 2.0).max(0.0);
        for (index, piece) in shaped.pieces.iter().enumerate() {
            let Piece::Column(chars) = piece else {
                continue;
            };
            let column_left = match style.orientation {
                Orientation::VerticalLtr => left + index as f32 * column_step,
                _ => left + shaped.content_width - size - index as f32 * column_step,
            };
            let column_height = stacked(chars.len(), line_height, style.char_spacing);
            let offset = match style.alignment {
                Alignment::Left => 0.0,
                Alignment::Center => ((inner_h - column_height) / 2.0).max(0.0),
                Alignment::Right => (inner_h - column_height).max(0.0),
            };
            let x = column_left + size / 2.0;
            for (row, ch) in chars.iter().enumerate() {
                let top = frame.padding + offset + row as f32 * cell_step;
                runs.push(GlyphRun {
                    text: ch.to_string(),
                    x,
                    y: top + ascent,
                    anchor: TextAnchor::Middle,
                    rotation: if rotates_in_vertical(*ch) { 90.0 } else { 0.0 },
                    pivot: (x, top + line_height / 2.0),
                });
            }
        }
        return runs;
    }

    let line_step = line_height + style.v_spacing;
    let top = frame.padding + ((inner_h - shaped.content_height) / 2.0).max(0.0);
    for (index, piece) in shaped.pieces.iter().enumerate() {
        let Piece::Line(text, width) = piece else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        let x = match style.alignment {
            Alignment::Left => frame.padding,
            Alignment::Center => frame.padding + (inner_w - width) / 2.0,
            Alignment::Right => frame.padding + inner_w - width,
        };
        let line_top = top + index as f32 * line_step;
        runs.push(GlyphRun {
            text: text.clone(),
            x,
            y: line_top + ascent,
            anchor: TextAnchor::Start,
            rotation: 0.0,
            pivot: (x, line_top + line_height / 2.0),
        });
    }
    runs
}
