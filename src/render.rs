use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use resvg::render;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use crate::block::{Rgba, TextBlock};
use crate::error::Error;
use crate::font::{FontCache, ResolvedFont};
use crate::layout::{LayoutConfig, ShapingPlan, TextAnchor, layout_block};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Bmp,
}

impl ExportFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ExportFormat::Png),
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg),
            "webp" => Some(ExportFormat::Webp),
            "bmp" => Some(ExportFormat::Bmp),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Webp => "webp",
            ExportFormat::Bmp => "bmp",
        }
    }

    fn image_format(self) -> image::ImageFormat {
        match self {
            ExportFormat::Png => image::ImageFormat::Png,
            ExportFormat::Jpeg => image::ImageFormat::Jpeg,
            ExportFormat::Webp => image::ImageFormat::WebP,
            ExportFormat::Bmp => image::ImageFormat::Bmp,
        }
    }
}

/// A composited image plus one advisory per block whose text did not fit.
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: RgbaImage,
    pub overflows: Vec<Error>,
}

/// Paints laid-out blocks over a source image.
///
/// The overlay for all blocks is built as one SVG document, rasterized into a
/// transparent pixmap and blended onto a copy of the source, so pixels no
/// block touches come out bit-identical.
pub struct Compositor {
    db: Arc<fontdb::Database>,
    fonts: FontCache,
    layout: LayoutConfig,
}

impl Compositor {
    pub fn new(layout: LayoutConfig) -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        Self::with_database(db, layout)
    }

    pub fn with_database(db: fontdb::Database, layout: LayoutConfig) -> Self {
        Self {
            db: Arc::new(db),
            fonts: FontCache::new(),
            layout,
        }
    }

    pub fn layout_config(&self) -> &LayoutConfig {
        &self.layout
    }

    pub fn resolve_font(&self, reference: &str) -> ResolvedFont {
        self.fonts.get(&self.db, reference)
    }

    pub fn plan(&self, block: &TextBlock) -> ShapingPlan {
        let font = self.resolve_font(&block.style.font);
        layout_block(block, &font, &self.layout)
    }

    /// Composite `blocks` in order over `source`. The source is never modified.
    pub fn compose(&self, source: &RgbaImage, blocks: &[TextBlock]) -> Result<Composite> {
        let (width, height) = source.dimensions();
        let mut image = source.clone();
        if blocks.is_empty() || width == 0 || height == 0 {
            return Ok(Composite {
                image,
                overflows: Vec::new(),
            });
        }
        let plans: Vec<ShapingPlan> = blocks.iter().map(|block| self.plan(block)).collect();
        let mut overflows = Vec::new();
        for (block, plan) in blocks.iter().zip(&plans) {
            if let Some(overflow) = plan.overflow() {
                tracing::debug!(block = %block.id, font_size = plan.font_size, "text overflows block");
                overflows.push(overflow);
            }
        }
        let svg = overlay_svg(width, height, blocks, &plans);
        let overlay = self.rasterize(&svg)?;
        blend_over(&mut image, &overlay);
        Ok(Composite { image, overflows })
    }

    fn rasterize(&self, svg: &str) -> Result<Pixmap> {
        let file_fonts = self.fonts.file_fonts();
        let fontdb = if file_fonts.is_empty() {
            self.db.clone()
        } else {
            let mut db = (*self.db).clone();
            for data in file_fonts {
                db.load_font_data(data.as_ref().clone());
            }
            Arc::new(db)
        };
        let options = Options {
            fontdb,
            ..Options::default()
        };
        let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse overlay SVG")?;
        let size = tree.size().to_int_size();
        let mut pixmap =
            Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
        let mut pixmap_mut = pixmap.as_mut();
        render(&tree, tiny_skia::Transform::identity(), &mut pixmap_mut);
        Ok(pixmap)
    }
}

pub fn encode_image(image: &RgbaImage, format: ExportFormat) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    let dynamic = image::DynamicImage::ImageRgba8(image.clone());
    // jpeg has no alpha channel
    let dynamic = match format {
        ExportFormat::Jpeg => image::DynamicImage::ImageRgb8(dynamic.to_rgb8()),
        _ => dynamic,
    };
    dynamic
        .write_to(&mut cursor, format.image_format())
        .with_context(|| format!("failed to encode {} image", format.extension()))?;
    Ok(bytes)
}

pub(crate) fn overlay_svg(
    width: u32,
    height: u32,
    blocks: &[TextBlock],
    plans: &[ShapingPlan],
) -> String {
    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    ));
    for (block, plan) in blocks.iter().zip(plans) {
        push_block(&mut svg, block, plan);
    }
    svg.push_str("</svg>");
    svg
}

fn push_block(svg: &mut String, block: &TextBlock, plan: &ShapingPlan) {
    let geometry = &block.geometry;
    let style = &block.style;
    let (left, top) = geometry.origin();
    svg.push_str(&format!(
        r#"<g transform="rotate({angle} {cx} {cy}) translate({left} {top})">"#,
        angle = geometry.angle,
        cx = geometry.cx,
        cy = geometry.cy,
        left = left,
        top = top
    ));

    if style.background_color.alpha() > 0 {
        svg.push_str(&format!(
            r#"<rect x="0" y="0" width="{w}" height="{h}" {fill}/>"#,
            w = geometry.width,
            h = geometry.height,
            fill = paint("fill", style.background_color)
        ));
    }

    if style.outline_thickness > 0.0 && style.outline_color.alpha() > 0 {
        let stroke = format!(
            r#"{fill} {stroke} stroke-width="{width}" stroke-linejoin="round""#,
            fill = paint("fill", style.outline_color),
            stroke = paint("stroke", style.outline_color),
            width = style.outline_thickness * 2.0
        );
        push_runs(svg, plan, &stroke);
    }
    if style.color.alpha() > 0 {
        push_runs(svg, plan, &paint("fill", style.color));
    }
    svg.push_str("</g>");
}

fn push_runs(svg: &mut String, plan: &ShapingPlan, paint_attrs: &str) {
    for run in &plan.runs {
        let anchor = match run.anchor {
            TextAnchor::Start => "start",
            TextAnchor::Middle => "middle",
        };
        let transform = if run.rotation != 0.0 {
            format!(
                r#" transform="rotate({r} {px} {py})""#,
                r = run.rotation,
                px = run.pivot.0,
                py = run.pivot.1
            )
        } else {
            String::new()
        };
        let spacing = if plan.letter_spacing != 0.0 {
            format!(r#" letter-spacing="{}""#, plan.letter_spacing)
        } else {
            String::new()
        };
        svg.push_str(&format!(
            r#"<text x="{x}" y="{y}" font-size="{size}" font-family="{family}" text-anchor="{anchor}" xml:space="preserve" {paint}{spacing}{transform}>{text}</text>"#,
            x = run.x,
            y = run.y,
            size = plan.font_size,
            family = escape_xml(&plan.font_family),
            anchor = anchor,
            paint = paint_attrs,
            spacing = spacing,
            transform = transform,
            text = escape_xml(&run.text)
        ));
    }
}

fn paint(attr: &str, color: Rgba) -> String {
    format!(
        r#"{attr}="{rgb}" {attr}-opacity="{opacity}""#,
        attr = attr,
        rgb = color.svg_rgb(),
        opacity = color.svg_opacity()
    )
}

/// Source-over blend of a premultiplied overlay onto a straight-alpha image.
fn blend_over(target: &mut RgbaImage, overlay: &Pixmap) {
    let width = target.width().min(overlay.width()) as usize;
    let height = target.height().min(overlay.height()) as usize;
    let stride = overlay.width() as usize;
    let data = overlay.data();
    for y in 0..height {
        for x in 0..width {
            let offset = (y * stride + x) * 4;
            let src = &data[offset..offset + 4];
            let src_a = src[3] as f32 / 255.0;
            if src[3] == 0 {
                continue;
            }
            let pixel = target.get_pixel_mut(x as u32, y as u32);
            let dst_a = pixel[3] as f32 / 255.0;
            let out_a = src_a + dst_a * (1.0 - src_a);
            if out_a <= 0.0 {
                continue;
            }
            for channel in 0..3 {
                let src_c = src[channel] as f32 / 255.0;
                let dst_c = pixel[channel] as f32 / 255.0 * dst_a;
                let out_c = (src_c + dst_c * (1.0 - src_a)) / out_a;
                pixel[channel] = (out_c * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            pixel[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FontSize, TextStyle};
    use crate::geometry::Geometry;

    fn compositor() -> Compositor {
        Compositor::with_database(fontdb::Database::new(), LayoutConfig::default())
    }

    fn source() -> RgbaImage {
        RgbaImage::from_pixel(64, 48, image::Rgba([10, 200, 30, 255]))
    }

    fn filled_block(cx: i32, cy: i32, color: [u8; 4]) -> TextBlock {
        let style = TextStyle {
            background_color: Rgba(color),
            ..TextStyle::default()
        };
        TextBlock::empty(Geometry::new(cx, cy, 20, 10, 0.0).unwrap(), style)
    }

    #[test]
    fn opaque_background_is_painted_exactly() {
        let block = filled_block(20, 20, [200, 10, 10, 255]);
        let output = compositor().compose(&source(), &[block]).unwrap().image;
        assert_eq!(output.get_pixel(20, 20).0, [200, 10, 10, 255]);
        assert_eq!(output.get_pixel(2, 2).0, [10, 200, 30, 255]);
    }

    #[test]
    fn later_blocks_draw_over_earlier_ones() {
        let first = filled_block(20, 20, [200, 10, 10, 255]);
        let second = filled_block(24, 20, [0, 0, 250, 255]);
        let output = compositor().compose(&source(), &[first, second]).unwrap().image;
        assert_eq!(output.get_pixel(22, 20).0, [0, 0, 250, 255]);
        assert_eq!(output.get_pixel(12, 20).0, [200, 10, 10, 255]);
    }

    #[test]
    fn compose_leaves_source_untouched_and_is_repeatable() {
        let src = source();
        let block = filled_block(30, 30, [0, 0, 0, 128]);
        let compositor = compositor();
        let first = compositor.compose(&src, std::slice::from_ref(&block)).unwrap().image;
        let second = compositor.compose(&src, std::slice::from_ref(&block)).unwrap().image;
        assert_eq!(first.as_raw(), second.as_raw());
        assert_eq!(src, source());
        let encoded_a = encode_image(&first, ExportFormat::Png).unwrap();
        let encoded_b = encode_image(&second, ExportFormat::Png).unwrap();
        assert_eq!(encoded_a, encoded_b);
    }

    #[test]
    fn overflowing_block_is_reported() {
        let style = TextStyle {
            font_size: FontSize::Fixed(20),
            ..TextStyle::default()
        };
        let cramped = TextBlock::detected(
            Geometry::new(20, 20, 24, 12, 0.0).unwrap(),
            "",
            "far too many words for this box",
            style,
            None,
        );
        let roomy = filled_block(40, 36, [0, 0, 0, 128]);
        let composite = compositor().compose(&source(), &[cramped, roomy]).unwrap();
        assert_eq!(composite.overflows, vec![Error::Overflowed { font_size: 20 }]);
    }

    #[test]
    fn svg_orders_background_outline_fill() {
        let style = TextStyle {
            font_size: FontSize::Fixed(12),
            ..TextStyle::default()
        };
        let block = TextBlock::detected(
            Geometry::new(40, 40, 60, 30, 30.0).unwrap(),
            "",
            "a<b",
            style,
            None,
        );
        let plan = compositor().plan(&block);
        let svg = overlay_svg(80, 80, std::slice::from_ref(&block), &[plan]);
        let rect = svg.find("<rect").unwrap();
        let outline = svg.find("stroke-width").unwrap();
        let fill = svg.rfind("<text").unwrap();
        assert!(rect < outline && outline < fill);
        assert!(svg.contains("rotate(30 40 40)"));
        assert!(svg.contains("a&lt;b"));
    }

    #[test]
    fn export_format_lookup() {
        assert_eq!(ExportFormat::from_extension("JPG"), Some(ExportFormat::Jpeg));
        assert_eq!(ExportFormat::from_extension("gif"), None);
    }
}
