use serde::Deserialize;
use std::cmp::Ordering;

use crate::adapters::RawRegion;
use crate::block::{BlockStatus, FontSize, Orientation, TextBlock, TextStyle};
use crate::error::Error;
use crate::geometry::{BBoxPx, Geometry, iou, union_bbox};
use crate::text::{ends_sentence, is_mostly_cjk, join_inline};

/// Which of two overlapping detections survives deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the more confident region; equal confidence keeps the earlier one.
    #[default]
    HigherConfidence,
    /// Keep whichever region was detected first.
    Earlier,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub iou_threshold: f32,
    pub tie_break: TieBreak,
    /// Join fragments of one visual line before deduplication.
    pub join_fragments: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            tie_break: TieBreak::HigherConfidence,
            join_fragments: true,
        }
    }
}

/// A detected region together with its translation outcome.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub(crate) order: usize,
    pub(crate) bbox: BBoxPx,
    pub(crate) angle: f32,
    pub(crate) orientation: Option<Orientation>,
    pub(crate) confidence: Option<f32>,
    pub(crate) font_size: Option<u32>,
    pub(crate) original: String,
    pub(crate) translated: String,
    pub(crate) failure: Option<String>,
}

impl Candidate {
    /// A translation the detector already supplied is carried over.
    pub(crate) fn from_region(order: usize, region: RawRegion) -> Self {
        let translated = region
            .translation
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        Self {
            order,
            bbox: region.bbox,
            angle: region.angle,
            orientation: region.orientation,
            confidence: region.confidence,
            font_size: region.font_size,
            original: region.text.trim().to_string(),
            translated,
            failure: None,
        }
    }

    fn is_horizontal(&self) -> bool {
        self.angle == 0.0 && !self.orientation.is_some_and(Orientation::is_vertical)
    }

    fn weight(&self) -> f32 {
        self.original.chars().count().max(1) as f32
    }

    fn score(&self) -> f32 {
        self.confidence.unwrap_or(0.0)
    }

    /// Append `other` after this candidate in reading order.
    fn absorb(&mut self, other: Candidate, keep_bbox: bool) {
        let weight = self.weight();
        let other_weight = other.weight();
        self.confidence = match (self.confidence, other.confidence) {
            (Some(a), Some(b)) => Some((a * weight + b * other_weight) / (weight + other_weight)),
            (a, b) => a.or(b),
        };
        self.original = join_inline(&self.original, &other.original);
        self.failure = match (self.failure.take(), other.failure) {
            (Some(a), Some(b)) => Some(format!("{}; {}", a, b)),
            (a, b) => a.or(b),
        };
        self.font_size = self.font_size.or(other.font_size);
        // a half-translated line is translated again as a whole
        if self.failure.is_some() || self.translated.is_empty() || other.translated.is_empty() {
            self.translated.clear();
        } else {
            self.translated = join_inline(&self.translated, &other.translated);
        }
        if !keep_bbox {
            self.bbox = union_bbox(&self.bbox, &other.bbox);
        }
        self.order = self.order.min(other.order);
    }

    pub(crate) fn into_block(self, style: &TextStyle) -> Result<TextBlock, Error> {
        let geometry = Geometry::from_bbox(&self.bbox)?.rotated(self.angle)?;
        let orientation = self
            .orientation
            .unwrap_or_else(|| guess_orientation(&self.bbox, &self.original));
        let mut style = style.clone().with_orientation(orientation);
        if let Some(size) = self.font_size {
            style.font_size = FontSize::Fixed(size);
        }
        let block = TextBlock::detected(
            geometry,
            self.original,
            self.translated,
            style,
            self.confidence,
        );
        Ok(match self.failure {
            Some(detail) => block.with_status(BlockStatus::PartialFailure { detail }),
            None => block,
        })
    }
}

/// Tall boxes of mostly CJK text are read as vertical right-to-left columns.
pub(crate) fn guess_orientation(bbox: &BBoxPx, text: &str) -> Orientation {
    let tall = bbox.h as f32 > bbox.w as f32 * 1.5;
    if tall && text.trim().chars().count() > 1 && is_mostly_cjk(text) {
        Orientation::VerticalRtl
    } else {
        Orientation::Horizontal
    }
}

/// Join horizontal fragments of the same line, left to right.
pub(crate) fn join_fragments(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let (mut horizontal, other): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(Candidate::is_horizontal);
    horizontal.sort_by_key(|c| (c.bbox.x, c.order));

    let mut lines: Vec<Candidate> = Vec::new();
    for fragment in horizontal {
        let target = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| continues_line(line, &fragment))
            .min_by_key(|(_, line)| fragment.bbox.x.abs_diff(line.bbox.right()))
            .map(|(idx, _)| idx);
        match target {
            Some(idx) => lines[idx].absorb(fragment, false),
            None => lines.push(fragment),
        }
    }

    lines.extend(other);
    lines.sort_by_key(|c| c.order);
    lines
}

fn continues_line(line: &Candidate, next: &Candidate) -> bool {
    if ends_sentence(&line.original) {
        return false;
    }
    let avg_h = (line.bbox.h + next.bbox.h) as f32 / 2.0;
    let same_row = (line.bbox.center_y() - next.bbox.center_y()).abs() < avg_h * 0.6;
    let gap = next.bbox.x as f32 - line.bbox.right() as f32;
    same_row && gap < avg_h * 1.5 && gap > -avg_h * 0.25
}

/// Drop or fold overlapping detections. Survivors keep detection order.
pub(crate) fn dedup(candidates: Vec<Candidate>, config: &MergeConfig) -> Vec<Candidate> {
    let mut ranked = candidates;
    ranked.sort_by(|a, b| rank(a, b, config.tie_break));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in ranked {
        let Some(idx) = kept
            .iter()
            .position(|existing| iou(&existing.bbox, &candidate.bbox) > config.iou_threshold)
        else {
            kept.push(candidate);
            continue;
        };
        if disjoint_reading_order(&kept[idx], &candidate) {
            let existing = &mut kept[idx];
            if reads_before(&candidate, existing) {
                let bbox = existing.bbox;
                let mut first = candidate;
                first.absorb(existing.clone(), true);
                first.bbox = bbox;
                first.angle = existing.angle;
                first.orientation = existing.orientation;
                *existing = first;
            } else {
                existing.absorb(candidate, true);
            }
        }
    }
    kept.sort_by_key(|c| c.order);
    kept
}

fn rank(a: &Candidate, b: &Candidate, tie_break: TieBreak) -> Ordering {
    match tie_break {
        TieBreak::HigherConfidence => b
            .score()
            .partial_cmp(&a.score())
            .unwrap_or(Ordering::Equal)
            .then(a.order.cmp(&b.order)),
        TieBreak::Earlier => a.order.cmp(&b.order),
    }
}

fn is_vertical(candidate: &Candidate) -> bool {
    candidate
        .orientation
        .unwrap_or_else(|| guess_orientation(&candidate.bbox, &candidate.original))
        .is_vertical()
}

/// Projections on the reading axis overlap by less than half the smaller extent.
fn disjoint_reading_order(a: &Candidate, b: &Candidate) -> bool {
    let (a0, a1, b0, b1) = if is_vertical(a) {
        (a.bbox.y, a.bbox.bottom(), b.bbox.y, b.bbox.bottom())
    } else {
        (a.bbox.x, a.bbox.right(), b.bbox.x, b.bbox.right())
    };
    let overlap = a1.min(b1).saturating_sub(a0.max(b0)) as f32;
    let smaller = (a1 - a0).min(b1 - b0) as f32;
    overlap < smaller / 2.0
}

fn reads_before(a: &Candidate, b: &Candidate) -> bool {
    if is_vertical(b) {
        a.bbox.y < b.bbox.y
    } else {
        a.bbox.x < b.bbox.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(order: usize, text: &str, bbox: (u32, u32, u32, u32), conf: f32) -> Candidate {
        Candidate {
            order,
            bbox: BBoxPx {
                x: bbox.0,
                y: bbox.1,
                w: bbox.2,
                h: bbox.3,
            },
            angle: 0.0,
            orientation: None,
            confidence: Some(conf),
            font_size: None,
            original: text.to_string(),
            translated: format!("<{}>", text),
            failure: None,
        }
    }

    #[test]
    fn joins_fragments_on_one_line() {
        let merged = join_fragments(vec![
            candidate(1, "world", (70, 12, 50, 20), 0.8),
            candidate(0, "Hello", (10, 10, 50, 20), 0.9),
            candidate(2, "Next line", (10, 60, 90, 20), 0.9),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].original, "Hello world");
        assert_eq!(merged[0].translated, "<Hello> <world>");
        assert_eq!(merged[0].bbox, BBoxPx { x: 10, y: 10, w: 110, h: 22 });
        assert_eq!(merged[0].order, 0);
        assert_eq!(merged[1].original, "Next line");
    }

    #[test]
    fn sentence_end_stops_joining() {
        let merged = join_fragments(vec![
            candidate(0, "終わり。", (10, 10, 80, 20), 0.9),
            candidate(1, "次", (100, 10, 20, 20), 0.9),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn cjk_fragments_join_without_space() {
        let merged = join_fragments(vec![
            candidate(0, "吾輩は", (10, 10, 60, 20), 0.9),
            candidate(1, "猫である", (75, 10, 80, 20), 0.9),
        ]);
        assert_eq!(merged[0].original, "吾輩は猫である");
    }

    #[test]
    fn failed_fragment_marks_joined_line() {
        let mut broken = candidate(1, "world", (70, 10, 50, 20), 0.8);
        broken.translated.clear();
        broken.failure = Some("timed out".to_string());
        let merged = join_fragments(vec![candidate(0, "Hello", (10, 10, 50, 20), 0.9), broken]);
        assert_eq!(merged[0].failure.as_deref(), Some("timed out"));
        assert!(merged[0].translated.is_empty());
    }

    #[test]
    fn untranslated_fragment_clears_joined_translation() {
        let mut pending = candidate(1, "world", (70, 10, 50, 20), 0.8);
        pending.translated.clear();
        let merged = join_fragments(vec![candidate(0, "Hello", (10, 10, 50, 20), 0.9), pending]);
        assert_eq!(merged[0].original, "Hello world");
        assert!(merged[0].translated.is_empty());
        assert!(merged[0].failure.is_none());
    }

    #[test]
    fn region_size_class_becomes_fixed_font_size() {
        let mut region = RawRegion::new(" 見出し ", BBoxPx { x: 0, y: 0, w: 120, h: 30 });
        region.font_size = Some(28);
        region.translation = Some("Heading".to_string());
        let candidate = Candidate::from_region(3, region);
        assert_eq!(candidate.original, "見出し");
        assert_eq!(candidate.translated, "Heading");
        let block = candidate.into_block(&TextStyle::default()).unwrap();
        assert_eq!(block.style.font_size, FontSize::Fixed(28));
    }

    #[test]
    fn overlapping_duplicate_keeps_higher_confidence() {
        let kept = dedup(
            vec![
                candidate(0, "Helo", (10, 10, 100, 20), 0.6),
                candidate(1, "Hello", (12, 11, 100, 20), 0.9),
                candidate(2, "Other", (10, 200, 100, 20), 0.5),
            ],
            &MergeConfig::default(),
        );
        let texts: Vec<_> = kept.iter().map(|c| c.original.as_str()).collect();
        assert_eq!(texts, ["Hello", "Other"]);
    }

    #[test]
    fn earlier_tie_break_keeps_first_detection() {
        let config = MergeConfig {
            tie_break: TieBreak::Earlier,
            ..MergeConfig::default()
        };
        let kept = dedup(
            vec![
                candidate(0, "Helo", (10, 10, 100, 20), 0.6),
                candidate(1, "Hello", (12, 11, 100, 20), 0.9),
            ],
            &config,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].original, "Helo");
    }

    #[test]
    fn equal_confidence_keeps_earlier() {
        let kept = dedup(
            vec![
                candidate(0, "first", (10, 10, 100, 20), 0.7),
                candidate(1, "second", (10, 10, 100, 20), 0.7),
            ],
            &MergeConfig::default(),
        );
        assert_eq!(kept[0].original, "first");
    }

    #[test]
    fn disjoint_reading_order_concatenates() {
        let config = MergeConfig {
            iou_threshold: 0.1,
            ..MergeConfig::default()
        };
        let kept = dedup(
            vec![
                candidate(0, "world", (55, 10, 60, 20), 0.6),
                candidate(1, "Hello", (10, 10, 60, 20), 0.9),
            ],
            &config,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].original, "Hello world");
        assert_eq!(kept[0].bbox, BBoxPx { x: 10, y: 10, w: 60, h: 20 });
    }

    #[test]
    fn guesses_vertical_for_tall_cjk() {
        let tall = BBoxPx { x: 0, y: 0, w: 20, h: 100 };
        assert_eq!(guess_orientation(&tall, "縦書きの文"), Orientation::VerticalRtl);
        assert_eq!(guess_orientation(&tall, "I"), Orientation::Horizontal);
        let wide = BBoxPx { x: 0, y: 0, w: 100, h: 20 };
        assert_eq!(guess_orientation(&wide, "横書き"), Orientation::Horizontal);
    }

    #[test]
    fn failed_candidate_becomes_partial_failure_block() {
        let mut failed = candidate(0, "猫", (0, 0, 20, 20), 0.9);
        failed.translated.clear();
        failed.failure = Some("gemini failed: boom".to_string());
        let block = failed.into_block(&TextStyle::default()).unwrap();
        assert!(!block.status.is_ok());
        assert!(block.translated_text.is_empty());
        assert_eq!(block.original_text, "猫");
    }
}
