use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;

use super::{AdapterFuture, OcrAdapter, RawRegion, encode_png};
use crate::error::from_anyhow;
use crate::geometry::{BBoxPx, union_bbox};
use crate::text::join_inline;

/// Sparse text: find as much text as possible in no particular order.
const PAGE_SEGMENTATION: &str = "11";

/// Local OCR through the `tesseract` command line tool.
pub struct Tesseract {
    name: String,
    program: String,
    languages: String,
}

impl Tesseract {
    pub fn new(languages: impl Into<String>) -> Self {
        let languages = languages.into();
        Self {
            name: format!("tesseract:{}", languages),
            program: "tesseract".to_string(),
            languages,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, image: &RgbaImage) -> Result<Vec<RawRegion>> {
        let png = encode_png(image)?;
        let file = tempfile::Builder::new()
            .prefix("ocr-")
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temporary image file")?;
        tokio::fs::write(file.path(), &png)
            .await
            .with_context(|| "failed to write temporary image file")?;

        let output = Command::new(&self.program)
            .arg(file.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .arg("--psm")
            .arg(PAGE_SEGMENTATION)
            .arg("tsv")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {} (is it installed?)", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tesseract failed: {}", stderr.trim()));
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl OcrAdapter for Tesseract {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: Arc<RgbaImage>) -> AdapterFuture<'_, Vec<RawRegion>> {
        Box::pin(async move {
            self.run(&image)
                .await
                .map_err(|err| from_anyhow(&self.name, err))
                .into()
        })
    }
}

struct Word {
    text: String,
    bbox: BBoxPx,
    conf: f32,
}

/// Group word rows (level 5) by their line and join them left to right.
/// Line confidence is the length-weighted mean word confidence, scaled to 0..1.
fn parse_tsv(tsv: &str) -> Vec<RawRegion> {
    let mut lines: BTreeMap<(u32, u32, u32, u32), Vec<Word>> = BTreeMap::new();
    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let num = |idx: usize| cols[idx].trim().parse::<u32>().unwrap_or(0);
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        let Some(bbox) = BBoxPx::from_corners(num(6), num(7), num(6) + num(8), num(7) + num(9))
        else {
            continue;
        };
        lines
            .entry((num(1), num(2), num(3), num(4)))
            .or_default()
            .push(Word {
                text: text.to_string(),
                bbox,
                conf,
            });
    }

    let mut regions = Vec::new();
    for (_, mut words) in lines {
        words.sort_by_key(|word| word.bbox.x);
        let mut text = String::new();
        let mut bbox: Option<BBoxPx> = None;
        let mut conf_sum = 0.0;
        let mut weight_sum = 0.0;
        for word in &words {
            text = if text.is_empty() {
                word.text.clone()
            } else {
                join_inline(&text, &word.text)
            };
            bbox = Some(match bbox {
                Some(current) => union_bbox(&current, &word.bbox),
                None => word.bbox,
            });
            let weight = word.text.chars().count().max(1) as f32;
            conf_sum += word.conf * weight;
            weight_sum += weight;
        }
        let Some(bbox) = bbox else {
            continue;
        };
        let confidence = if weight_sum > 0.0 {
            conf_sum / weight_sum / 100.0
        } else {
            0.0
        };
        regions.push(RawRegion::new(text, bbox).with_confidence(confidence));
    }
    regions
}
