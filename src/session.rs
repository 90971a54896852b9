use anyhow::{Context, Result};
use image::RgbaImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::block::{BlockId, Edit, TextBlock, TextStyle};
use crate::error::Error;
use crate::geometry::{Anchor, Geometry};
use crate::layout::required_size;
use crate::render::{Compositor, ExportFormat, encode_image};

#[derive(Default)]
struct SessionState {
    blocks: Vec<TextBlock>,
    /// Last composite; dropped whenever a block changes.
    working: Option<Rendered>,
}

#[derive(Clone)]
struct Rendered {
    image: Arc<RgbaImage>,
    overflows: Vec<Error>,
}

/// One source image and its editable text blocks.
///
/// All mutation goes through a short-lived lock that is never held across an
/// await point.
pub struct Session {
    id: Uuid,
    source: Arc<RgbaImage>,
    state: Mutex<SessionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionExport<'a> {
    pub session: Uuid,
    pub width: u32,
    pub height: u32,
    pub blocks: &'a [TextBlock],
}

impl Session {
    pub fn new(source: RgbaImage) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: Arc::new(source),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn open(path: &std::path::Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to open image: {}", path.display()))?;
        Ok(Self::new(image.to_rgba8()))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &RgbaImage {
        &self.source
    }

    pub(crate) fn shared_source(&self) -> Arc<RgbaImage> {
        Arc::clone(&self.source)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn blocks(&self) -> Vec<TextBlock> {
        self.lock().blocks.clone()
    }

    pub fn block(&self, id: BlockId) -> Option<TextBlock> {
        self.lock().blocks.iter().find(|block| block.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().blocks.is_empty()
    }

    /// Add an empty block with the default style at `geometry`.
    pub fn add_block(&self, geometry: Geometry) -> BlockId {
        let block = TextBlock::empty(geometry, TextStyle::default());
        let id = block.id;
        self.push(block);
        id
    }

    pub fn add_block_with_style(&self, geometry: Geometry, style: TextStyle) -> Result<BlockId, Error> {
        style.validate()?;
        let block = TextBlock::empty(geometry, style);
        let id = block.id;
        self.push(block);
        Ok(id)
    }

    pub(crate) fn push(&self, block: TextBlock) {
        let mut state = self.lock();
        state.blocks.push(block);
        state.working = None;
    }

    /// Replace every block at once, as a finished pipeline run does.
    pub(crate) fn replace_blocks(&self, blocks: Vec<TextBlock>) {
        let mut state = self.lock();
        state.blocks = blocks;
        state.working = None;
    }

    pub fn delete_block(&self, id: BlockId) -> Option<TextBlock> {
        let mut state = self.lock();
        let index = state.blocks.iter().position(|block| block.id == id)?;
        state.working = None;
        Some(state.blocks.remove(index))
    }

    /// Apply one edit to one block. A rejected edit leaves the block unchanged.
    pub fn edit(&self, id: BlockId, edit: &Edit) -> Result<TextBlock, Error> {
        let mut state = self.lock();
        let index = state
            .blocks
            .iter()
            .position(|block| block.id == id)
            .ok_or_else(|| Error::geometry(format!("unknown block {}", id)))?;
        let updated = state.blocks[index].apply(edit)?;
        state.blocks[index] = updated.clone();
        state.working = None;
        Ok(updated)
    }

    /// Apply one edit to several blocks in order. Each block is validated on
    /// its own; a rejection for one block does not undo the others.
    pub fn apply_to_many(&self, ids: &[BlockId], edit: &Edit) -> Vec<Result<TextBlock, Error>> {
        ids.iter().map(|id| self.edit(*id, edit)).collect()
    }

    /// Grow a block about its centre until its text fits at the current font size.
    pub fn fit_block_to_text(&self, id: BlockId, compositor: &Compositor) -> Result<TextBlock, Error> {
        let block = self
            .block(id)
            .ok_or_else(|| Error::geometry(format!("unknown block {}", id)))?;
        if block.translated_text.trim().is_empty() {
            return Err(Error::EmptyContent);
        }
        let font = compositor.resolve_font(&block.style.font);
        let (width, height) = required_size(&block, &font, compositor.layout_config());
        if (width, height) == (block.geometry.width, block.geometry.height) {
            return Ok(block);
        }
        self.edit(
            id,
            &Edit::Resize {
                width: width as i64,
                height: height as i64,
                anchor: Anchor::Center,
            },
        )
    }

    /// Composite the current blocks, reusing the cached result when nothing changed.
    pub fn render(&self, compositor: &Compositor) -> Result<Arc<RgbaImage>> {
        self.render_with_overflows(compositor).map(|(image, _)| image)
    }

    /// Like [`Session::render`], plus an `Overflowed` advisory for every block
    /// whose text does not fit.
    pub fn render_with_overflows(&self, compositor: &Compositor) -> Result<(Arc<RgbaImage>, Vec<Error>)> {
        let blocks = {
            let state = self.lock();
            if let Some(working) = &state.working {
                return Ok((working.image.clone(), working.overflows.clone()));
            }
            state.blocks.clone()
        };
        let composite = compositor.compose(&self.source, &blocks)?;
        let rendered = Rendered {
            image: Arc::new(composite.image),
            overflows: composite.overflows,
        };
        let mut state = self.lock();
        // keep the result only if no edit landed while compositing
        if state.working.is_none() && state.blocks == blocks {
            state.working = Some(rendered.clone());
        }
        Ok((rendered.image, rendered.overflows))
    }

    pub fn export(&self, compositor: &Compositor, format: ExportFormat) -> Result<Vec<u8>> {
        let rendered = self.render(compositor)?;
        encode_image(&rendered, format)
    }

    pub fn export_png(&self, compositor: &Compositor) -> Result<Vec<u8>> {
        self.export(compositor, ExportFormat::Png)
    }

    pub fn blocks_json(&self) -> Result<String> {
        let blocks = self.blocks();
        let export = SessionExport {
            session: self.id,
            width: self.source.width(),
            height: self.source.height(),
            blocks: &blocks,
        };
        serde_json::to_string_pretty(&export).with_context(|| "failed to serialize blocks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FontSize, StylePatch};
    use crate::layout::LayoutConfig;
    use usvg::fontdb;

    fn session() -> Session {
        Session::new(RgbaImage::from_pixel(80, 60, image::Rgba([255, 255, 255, 255])))
    }

    fn compositor() -> Compositor {
        Compositor::with_database(fontdb::Database::new(), LayoutConfig::default())
    }

    fn geometry() -> Geometry {
        Geometry::new(20, 20, 16, 12, 0.0).unwrap()
    }

    #[test]
    fn add_then_delete_restores_blocks() {
        let session = session();
        let keep = session.add_block(geometry());
        let before = session.blocks();
        let added = session.add_block(geometry());
        assert_eq!(session.len(), 2);
        session.delete_block(added).unwrap();
        assert_eq!(session.blocks(), before);
        assert!(session.block(keep).is_some());
    }

    #[test]
    fn multi_edit_results_are_independent() {
        let session = session();
        let a = session.add_block(geometry());
        let edge = session.add_block(Geometry::new(i32::MAX - 2, 20, 4, 4, 0.0).unwrap());
        let c = session.add_block(geometry());
        let results = session.apply_to_many(&[a, edge, c, BlockId::new()], &Edit::Move { dx: 5, dy: -2 });

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::InvalidGeometry(_))));
        assert!(results[2].is_ok());
        assert!(results[3].is_err());
        // the earlier success is kept despite the later rejection
        assert_eq!(session.block(a).unwrap().geometry.cx, 25);
        assert_eq!(session.block(edge).unwrap().geometry.cx, i32::MAX - 2);
        assert_eq!(session.block(c).unwrap().geometry.cy, 18);
    }

    #[test]
    fn empty_font_style_is_rejected() {
        let session = session();
        let style = TextStyle {
            font: String::new(),
            ..TextStyle::default()
        };
        assert_eq!(
            session.add_block_with_style(geometry(), style),
            Err(Error::EmptyFont)
        );
        assert!(session.is_empty());
    }

    #[test]
    fn render_cache_is_invalidated_by_edits() {
        let session = session();
        let compositor = compositor();
        let id = session.add_block(geometry());
        let first = session.render(&compositor).unwrap();
        let cached = session.render(&compositor).unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        let patch = StylePatch {
            background_color: Some(crate::block::Rgba([0, 0, 255, 255])),
            ..StylePatch::default()
        };
        session.edit(id, &Edit::SetStyle(patch)).unwrap();
        let updated = session.render(&compositor).unwrap();
        assert!(!Arc::ptr_eq(&first, &updated));
        assert_eq!(updated.get_pixel(20, 20).0, [0, 0, 255, 255]);
    }

    #[test]
    fn export_twice_is_byte_identical() {
        let session = session();
        let compositor = compositor();
        session.add_block(geometry());
        let first = session.export_png(&compositor).unwrap();
        session.replace_blocks(session.blocks());
        let second = session.export_png(&compositor).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fit_grows_about_centre() {
        let session = session();
        let compositor = compositor();
        let style = TextStyle {
            font_size: FontSize::Fixed(20),
            ..TextStyle::default()
        };
        let id = session.add_block_with_style(geometry(), style).unwrap();
        assert_eq!(
            session.fit_block_to_text(id, &compositor),
            Err(Error::EmptyContent)
        );
        session
            .edit(id, &Edit::SetText("wide translated words".to_string()))
            .unwrap();
        let fitted = session.fit_block_to_text(id, &compositor).unwrap();
        assert!(fitted.geometry.width > 16 && fitted.geometry.height > 12);
        assert!((fitted.geometry.cx - 20).abs() <= 1 && (fitted.geometry.cy - 20).abs() <= 1);
    }

    #[test]
    fn overflow_advisories_come_with_the_render() {
        let session = session();
        let compositor = compositor();
        let style = TextStyle {
            font_size: FontSize::Fixed(20),
            ..TextStyle::default()
        };
        let id = session.add_block_with_style(geometry(), style).unwrap();
        session.add_block(geometry());
        session
            .edit(id, &Edit::SetText("wide translated words".to_string()))
            .unwrap();
        let (first, overflows) = session.render_with_overflows(&compositor).unwrap();
        assert_eq!(overflows, vec![Error::Overflowed { font_size: 20 }]);
        let (cached, again) = session.render_with_overflows(&compositor).unwrap();
        assert!(Arc::ptr_eq(&first, &cached));
        assert_eq!(again, overflows);
    }

    #[test]
    fn blocks_json_lists_blocks() {
        let session = session();
        session.add_block(geometry());
        let json: serde_json::Value = serde_json::from_str(&session.blocks_json().unwrap()).unwrap();
        assert_eq!(json["width"], 80);
        assert_eq!(json["blocks"].as_array().unwrap().len(), 1);
    }
}
