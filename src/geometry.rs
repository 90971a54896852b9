use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Axis-aligned pixel box as reported by OCR backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBoxPx {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBoxPx {
    pub fn from_corners(x0: u32, y0: u32, x1: u32, y1: u32) -> Option<Self> {
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x: x0,
            y: y0,
            w: x1 - x0,
            h: y1 - y0,
        })
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w as f32 * self.h as f32
    }

    pub fn center_y(&self) -> f32 {
        self.y as f32 + self.h as f32 * 0.5
    }
}

pub fn iou(a: &BBoxPx, b: &BBoxPx) -> f32 {
    let ix1 = a.x.max(b.x);
    let iy1 = a.y.max(b.y);
    let ix2 = a.right().min(b.right());
    let iy2 = a.bottom().min(b.bottom());

    if ix2 <= ix1 || iy2 <= iy1 {
        return 0.0;
    }
    let inter = (ix2 - ix1) as f32 * (iy2 - iy1) as f32;
    inter / (a.area() + b.area() - inter).max(1.0)
}

/// Overlap of the two boxes along x, relative to the narrower one.
pub fn horizontal_overlap_ratio(a: &BBoxPx, b: &BBoxPx) -> f32 {
    let ix1 = a.x.max(b.x);
    let ix2 = a.right().min(b.right());
    if ix2 <= ix1 {
        return 0.0;
    }
    (ix2 - ix1) as f32 / (a.w.min(b.w) as f32).max(1.0)
}

pub fn vertical_overlap_ratio(a: &BBoxPx, b: &BBoxPx) -> f32 {
    let iy1 = a.y.max(b.y);
    let iy2 = a.bottom().min(b.bottom());
    if iy2 <= iy1 {
        return 0.0;
    }
    (iy2 - iy1) as f32 / (a.h.min(b.h) as f32).max(1.0)
}

pub fn union_bbox(a: &BBoxPx, b: &BBoxPx) -> BBoxPx {
    let x1 = a.x.min(b.x);
    let y1 = a.y.min(b.y);
    let x2 = a.right().max(b.right());
    let y2 = a.bottom().max(b.bottom());
    BBoxPx {
        x: x1,
        y: y1,
        w: x2 - x1,
        h: y2 - y1,
    }
}

/// Which point of a block stays fixed while it is resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    #[default]
    Center,
    TopLeft,
    Top,
    TopRight,
    Right,
    BottomRight,
    Bottom,
    BottomLeft,
    Left,
}

impl Anchor {
    /// Position of the anchor in half-extents of the unrotated block.
    fn unit_offset(self) -> (f64, f64) {
        match self {
            Anchor::Center => (0.0, 0.0),
            Anchor::TopLeft => (-1.0, -1.0),
            Anchor::Top => (0.0, -1.0),
            Anchor::TopRight => (1.0, -1.0),
            Anchor::Right => (1.0, 0.0),
            Anchor::BottomRight => (1.0, 1.0),
            Anchor::Bottom => (0.0, 1.0),
            Anchor::BottomLeft => (-1.0, 1.0),
            Anchor::Left => (-1.0, 0.0),
        }
    }
}

/// A rotatable rectangle in whole image pixels.
///
/// The centre and size are integers so that moves compose exactly; only the
/// angle is fractional. `angle` is in degrees, clockwise, always in `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub cx: i32,
    pub cy: i32,
    pub width: u32,
    pub height: u32,
    pub angle: f32,
}

impl Geometry {
    pub fn new(cx: i32, cy: i32, width: u32, height: u32, angle: f32) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::geometry(format!(
                "block size must be positive (got {}x{})",
                width, height
            )));
        }
        Ok(Self {
            cx,
            cy,
            width,
            height,
            angle: normalize_angle(angle)?,
        })
    }

    pub fn from_bbox(bbox: &BBoxPx) -> Result<Self, Error> {
        let cx = bbox.x as i64 + bbox.w as i64 / 2;
        let cy = bbox.y as i64 + bbox.h as i64 / 2;
        let cx = i32::try_from(cx).map_err(|_| Error::geometry("bbox outside coordinate range"))?;
        let cy = i32::try_from(cy).map_err(|_| Error::geometry("bbox outside coordinate range"))?;
        Self::new(cx, cy, bbox.w, bbox.h, 0.0)
    }

    /// Left/top corner of the unrotated rectangle.
    pub fn origin(&self) -> (f32, f32) {
        (
            self.cx as f32 - self.width as f32 / 2.0,
            self.cy as f32 - self.height as f32 / 2.0,
        )
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Result<Self, Error> {
        let cx = self
            .cx
            .checked_add(dx)
            .ok_or_else(|| Error::geometry("move leaves the coordinate range"))?;
        let cy = self
            .cy
            .checked_add(dy)
            .ok_or_else(|| Error::geometry("move leaves the coordinate range"))?;
        Ok(Self { cx, cy, ..*self })
    }

    /// Resize keeping `anchor` at the same image position, taking rotation into account.
    pub fn resized(&self, new_w: i64, new_h: i64, anchor: Anchor) -> Result<Self, Error> {
        if new_w <= 0 || new_h <= 0 {
            return Err(Error::geometry(format!(
                "block size must be positive (got {}x{})",
                new_w, new_h
            )));
        }
        let width = u32::try_from(new_w).map_err(|_| Error::geometry("width too large"))?;
        let height = u32::try_from(new_h).map_err(|_| Error::geometry("height too large"))?;

        let (ux, uy) = anchor.unit_offset();
        let local_dx = ux * (self.width as f64 - width as f64) / 2.0;
        let local_dy = uy * (self.height as f64 - height as f64) / 2.0;
        let (sin, cos) = (self.angle as f64).to_radians().sin_cos();
        let world_dx = local_dx * cos - local_dy * sin;
        let world_dy = local_dx * sin + local_dy * cos;

        let cx = self.cx as f64 + world_dx;
        let cy = self.cy as f64 + world_dy;
        if !(i32::MIN as f64..=i32::MAX as f64).contains(&cx)
            || !(i32::MIN as f64..=i32::MAX as f64).contains(&cy)
        {
            return Err(Error::geometry("resize leaves the coordinate range"));
        }
        Ok(Self {
            cx: cx.round() as i32,
            cy: cy.round() as i32,
            width,
            height,
            angle: self.angle,
        })
    }

    pub fn rotated(&self, delta_degrees: f32) -> Result<Self, Error> {
        if !delta_degrees.is_finite() {
            return Err(Error::geometry("rotation must be finite"));
        }
        Ok(Self {
            angle: normalize_angle(self.angle + delta_degrees)?,
            ..*self
        })
    }
}

pub fn normalize_angle(angle: f32) -> Result<f32, Error> {
    if !angle.is_finite() {
        return Err(Error::geometry("angle must be finite"));
    }
    let normalized = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if normalized >= 360.0 {
        Ok(0.0)
    } else {
        Ok(normalized)
    }
}
