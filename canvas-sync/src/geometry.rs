//! Points and axis-aligned bounds in canvas coordinates.

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing bounds for structural equality.
pub const BOUNDS_EPSILON: f32 = 0.01;

/// A point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// X position.
    pub x: f32,
    /// Y position.
    pub y: f32,
}

impl Point {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounds `{x, y, w, h}`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    #[serde(rename = "w", alias = "width")]
    pub width: f32,
    /// Height.
    #[serde(rename = "h", alias = "height")]
    pub height: f32,
}

impl Bounds {
    /// Zero-size bounds at the origin, used for entries whose raster has not decoded.
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    /// Create bounds from position and size.
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Bounds of the given size centred on `center`.
    #[must_use]
    pub fn centered_at(center: Point, width: f32, height: f32) -> Self {
        Self::new(center.x - width / 2.0, center.y - height / 2.0, width, height)
    }

    /// True when the bounds have no usable area (not yet measured).
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        !(self.width > BOUNDS_EPSILON && self.height > BOUNDS_EPSILON)
            || !self.x.is_finite()
            || !self.y.is_finite()
    }

    /// Right edge.
    #[must_use]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// Bottom edge.
    #[must_use]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Centre point.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Bounds shifted by `(dx, dy)`.
    #[must_use]
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Bounds grown by `amount` on every side.
    #[must_use]
    pub fn expanded(&self, amount: f32) -> Self {
        Self::new(
            self.x - amount,
            self.y - amount,
            self.width + amount * 2.0,
            self.height + amount * 2.0,
        )
    }

    /// Whether the point lies inside (edges inclusive).
    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.x <= self.right()
            && point.y >= self.y
            && point.y <= self.bottom()
    }

    /// Whether the two bounds overlap.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    /// Smallest bounds containing both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Self::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }

    /// Equality within [`BOUNDS_EPSILON`].
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        (self.x - other.x).abs() < BOUNDS_EPSILON
            && (self.y - other.y).abs() < BOUNDS_EPSILON
            && (self.width - other.width).abs() < BOUNDS_EPSILON
            && (self.height - other.height).abs() < BOUNDS_EPSILON
    }

    /// Map a point inside `self` onto the same relative spot inside `target`.
    ///
    /// Used to carry child geometry along when a group is moved or resized.
    #[must_use]
    pub fn remap(&self, child: &Self, target: &Self) -> Self {
        let sx = if self.width > BOUNDS_EPSILON {
            target.width / self.width
        } else {
            1.0
        };
        let sy = if self.height > BOUNDS_EPSILON {
            target.height / self.height
        } else {
            1.0
        };
        Self::new(
            target.x + (child.x - self.x) * sx,
            target.y + (child.y - self.y) * sy,
            child.width * sx,
            child.height * sy,
        )
    }

    /// Largest bounds with the aspect ratio `width:height` that fit inside
    /// `self`, centred.
    #[must_use]
    pub fn fit(&self, width: f32, height: f32) -> Self {
        if width <= 0.0 || height <= 0.0 {
            return *self;
        }
        let scale = (self.width / width).min(self.height / height);
        Self::centered_at(self.center(), width * scale, height * scale)
    }

    /// Union of an iterator of bounds, `None` when empty.
    pub fn union_all<I>(iter: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        iter.into_iter().reduce(|acc, b| acc.union(&b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate() {
        assert!(Bounds::ZERO.is_degenerate());
        assert!(Bounds::new(10.0, 10.0, 0.0, 50.0).is_degenerate());
        assert!(!Bounds::new(10.0, 10.0, 1.0, 1.0).is_degenerate());
        assert!(Bounds::new(f32::NAN, 0.0, 10.0, 10.0).is_degenerate());
    }

    #[test]
    fn test_contains_and_expand() {
        let b = Bounds::new(0.0, 0.0, 10.0, 10.0);
        assert!(b.contains(Point::new(10.0, 10.0)));
        assert!(!b.contains(Point::new(12.0, 5.0)));
        assert!(b.expanded(3.0).contains(Point::new(12.0, 5.0)));
    }

    #[test]
    fn test_union() {
        let a = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let b = Bounds::new(20.0, 5.0, 10.0, 20.0);
        assert_eq!(a.union(&b), Bounds::new(0.0, 0.0, 30.0, 25.0));
        assert_eq!(Bounds::union_all(Vec::new()), None);
    }

    #[test]
    fn test_remap_scales_children() {
        let group = Bounds::new(0.0, 0.0, 100.0, 100.0);
        let child = Bounds::new(50.0, 50.0, 50.0, 50.0);
        let target = Bounds::new(10.0, 10.0, 200.0, 200.0);
        assert!(group
            .remap(&child, &target)
            .approx_eq(&Bounds::new(110.0, 110.0, 100.0, 100.0)));
    }

    #[test]
    fn test_fit_keeps_aspect() {
        let frame = Bounds::new(0.0, 0.0, 512.0, 512.0);
        assert!(frame
            .fit(1024.0, 512.0)
            .approx_eq(&Bounds::new(0.0, 128.0, 512.0, 256.0)));
        assert_eq!(frame.fit(0.0, 10.0), frame);
    }

    #[test]
    fn test_serde_short_names() {
        let json = serde_json::to_string(&Bounds::new(1.0, 2.0, 3.0, 4.0)).expect("serialize");
        assert_eq!(json, r#"{"x":1.0,"y":2.0,"w":3.0,"h":4.0}"#);
        let parsed: Bounds =
            serde_json::from_str(r#"{"x":1,"y":2,"width":3,"height":4}"#).expect("parse");
        assert!(parsed.approx_eq(&Bounds::new(1.0, 2.0, 3.0, 4.0)));
    }
}
