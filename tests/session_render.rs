use image::{Rgba as Pixel, RgbaImage};
use llm_image_translator::geometry::Geometry;
use llm_image_translator::layout::LayoutConfig;
use llm_image_translator::{Compositor, Edit, ExportFormat, Session};
use std::sync::Arc;
use usvg::fontdb;

fn compositor() -> Compositor {
    Compositor::with_database(fontdb::Database::new(), LayoutConfig::default())
}

fn checkerboard() -> RgbaImage {
    RgbaImage::from_fn(120, 80, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            Pixel([230, 230, 230, 255])
        } else {
            Pixel([40, 40, 40, 255])
        }
    })
}

#[test]
fn rendering_twice_reuses_the_cached_image() {
    let session = Session::new(checkerboard());
    let id = session.add_block(Geometry::new(60, 40, 80, 30, 0.0).unwrap());
    session.edit(id, &Edit::SetText("Hello".to_string())).unwrap();
    let compositor = compositor();

    let first = session.render(&compositor).unwrap();
    let second = session.render(&compositor).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let png_a = session.export(&compositor, ExportFormat::Png).unwrap();
    let png_b = session.export(&compositor, ExportFormat::Png).unwrap();
    assert_eq!(png_a, png_b);
}

#[test]
fn edits_invalidate_the_cache_but_never_touch_the_source() {
    let source = checkerboard();
    let session = Session::new(source.clone());
    let id = session.add_block(Geometry::new(60, 40, 80, 30, 0.0).unwrap());
    let compositor = compositor();

    let before = session.render(&compositor).unwrap();
    session.edit(id, &Edit::Move { dx: 5, dy: -3 }).unwrap();
    let after = session.render(&compositor).unwrap();

    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(session.source(), &source);
    assert_eq!(session.block(id).unwrap().geometry.cx, 65);
}

#[test]
fn pixels_outside_every_block_are_unchanged() {
    let source = checkerboard();
    let session = Session::new(source.clone());
    let id = session.add_block(Geometry::new(30, 20, 20, 10, 0.0).unwrap());
    session.edit(id, &Edit::SetText("x".to_string())).unwrap();

    let rendered = session.render(&compositor()).unwrap();
    for (x, y) in [(0, 0), (119, 79), (100, 60), (60, 70)] {
        assert_eq!(rendered.get_pixel(x, y), source.get_pixel(x, y));
    }
}

#[test]
fn block_json_lists_blocks_in_z_order() {
    let session = Session::new(RgbaImage::new(64, 64));
    let first = session.add_block(Geometry::new(10, 10, 10, 10, 0.0).unwrap());
    let second = session.add_block(Geometry::new(30, 30, 10, 10, 0.0).unwrap());
    session
        .edit(second, &Edit::SetText("top".to_string()))
        .unwrap();

    let value: serde_json::Value = serde_json::from_str(&session.blocks_json().unwrap()).unwrap();
    let blocks = value["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["id"], serde_json::to_value(first).unwrap());
    assert_eq!(blocks[1]["translated_text"], "top");
    assert_eq!(value["width"], 64);
}
