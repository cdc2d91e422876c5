//! Geometry primitives
//!
//! Integer (database unit) points, closed rectangles and Manhattan
//! transforms. Polygons, texts and the rectangle-set boolean engine live in
//! the submodules.
//!
//! All containment and contact tests are *closed*: two shapes that only
//! share an edge or a corner touch, a point on a boundary is inside.

pub mod boolean;
pub mod polygon;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use polygon::{Polygon, Shape, Text};

/// Coordinate type, in database units
pub type Coord = i64;

/// A point in database units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: Coord,
    pub y: Coord,
}

impl Point {
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Axis-aligned rectangle with closed boundary
///
/// `left <= right` and `bottom <= top` always hold. Degenerate (zero width
/// or height) rectangles are allowed; they are what the closed intersection
/// of two abutting rectangles looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: Coord,
    pub bottom: Coord,
    pub right: Coord,
    pub top: Coord,
}

impl Rect {
    /// Create a rectangle from two opposite corners in any order
    pub fn new(x1: Coord, y1: Coord, x2: Coord, y2: Coord) -> Self {
        Self {
            left: x1.min(x2),
            bottom: y1.min(y2),
            right: x1.max(x2),
            top: y1.max(y2),
        }
    }

    pub fn from_points(a: Point, b: Point) -> Self {
        Self::new(a.x, a.y, b.x, b.y)
    }

    /// Degenerate rectangle covering a single point
    pub fn at(p: Point) -> Self {
        Self::new(p.x, p.y, p.x, p.y)
    }

    pub fn width(&self) -> Coord {
        self.right - self.left
    }

    pub fn height(&self) -> Coord {
        self.top - self.bottom
    }

    pub fn area(&self) -> i128 {
        self.width() as i128 * self.height() as i128
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.left + self.width() / 2,
            self.bottom + self.height() / 2,
        )
    }

    pub fn lower_left(&self) -> Point {
        Point::new(self.left, self.bottom)
    }

    pub fn upper_right(&self) -> Point {
        Point::new(self.right, self.top)
    }

    /// Closed containment
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.left && p.x <= self.right && p.y >= self.bottom && p.y <= self.top
    }

    /// Closed contact: overlapping, abutting along an edge or touching at a corner
    pub fn touches(&self, other: &Rect) -> bool {
        self.left <= other.right
            && other.left <= self.right
            && self.bottom <= other.top
            && other.bottom <= self.top
    }

    /// Overlap with positive area
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.bottom < other.top
            && other.bottom < self.top
    }

    /// Closed intersection, possibly degenerate
    pub fn clipped(&self, other: &Rect) -> Option<Rect> {
        if !self.touches(other) {
            return None;
        }
        Some(Rect {
            left: self.left.max(other.left),
            bottom: self.bottom.max(other.bottom),
            right: self.right.min(other.right),
            top: self.top.min(other.top),
        })
    }

    /// Intersection with positive area, as used by the boolean engine
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.overlaps(other) {
            return None;
        }
        self.clipped(other)
    }

    /// Bounding box of both rectangles
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            bottom: self.bottom.min(other.bottom),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
        }
    }

    /// `self` minus `other`, as up to four disjoint rectangles
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(4);
        if other.bottom > self.bottom {
            pieces.push(Rect::new(self.left, self.bottom, self.right, other.bottom));
        }
        if other.top < self.top {
            pieces.push(Rect::new(self.left, other.top, self.right, self.top));
        }
        let band_bottom = self.bottom.max(other.bottom);
        let band_top = self.top.min(other.top);
        if other.left > self.left {
            pieces.push(Rect::new(self.left, band_bottom, other.left, band_top));
        }
        if other.right < self.right {
            pieces.push(Rect::new(other.right, band_bottom, self.right, band_top));
        }
        pieces
    }

    pub fn transformed(&self, trans: &Trans) -> Rect {
        Rect::from_points(
            trans.apply(self.lower_left()),
            trans.apply(self.upper_right()),
        )
    }

    /// Bounding box of a set of rectangles
    pub fn bounding<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Option<Rect> {
        rects
            .into_iter()
            .fold(None, |acc: Option<Rect>, r| Some(acc.map_or(*r, |a| a.union(r))))
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({};{})",
            self.lower_left(),
            self.upper_right()
        )
    }
}

/// Manhattan transformation
///
/// Mirror at the x axis (optional), then rotate counter-clockwise by
/// `rotation` quarter turns, then displace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Trans {
    rotation: u8,
    mirror: bool,
    disp: Point,
}

impl Trans {
    pub const IDENTITY: Trans = Trans {
        rotation: 0,
        mirror: false,
        disp: Point::new(0, 0),
    };

    pub fn new(rotation: u8, mirror: bool, disp: Point) -> Self {
        Self {
            rotation: rotation % 4,
            mirror,
            disp,
        }
    }

    /// Pure displacement
    pub fn shift(dx: Coord, dy: Coord) -> Self {
        Self::new(0, false, Point::new(dx, dy))
    }

    pub fn rotation(&self) -> u8 {
        self.rotation
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror
    }

    pub fn disp(&self) -> Point {
        self.disp
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    fn linear(&self, p: Point) -> Point {
        let (x, y) = if self.mirror { (p.x, -p.y) } else { (p.x, p.y) };
        match self.rotation {
            0 => Point::new(x, y),
            1 => Point::new(-y, x),
            2 => Point::new(-x, -y),
            _ => Point::new(y, -x),
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        let q = self.linear(p);
        Point::new(q.x + self.disp.x, q.y + self.disp.y)
    }

    /// `self * other`: applies `other` first, then `self`
    pub fn concat(&self, other: &Trans) -> Trans {
        let rotation = if self.mirror {
            (self.rotation + 4 - other.rotation) % 4
        } else {
            (self.rotation + other.rotation) % 4
        };
        Trans {
            rotation,
            mirror: self.mirror ^ other.mirror,
            disp: self.apply(other.disp),
        }
    }

    pub fn inverted(&self) -> Trans {
        let rotation = if self.mirror {
            self.rotation
        } else {
            (4 - self.rotation) % 4
        };
        let linear = Trans::new(rotation, self.mirror, Point::default());
        let d = linear.apply(self.disp);
        Trans::new(rotation, self.mirror, Point::new(-d.x, -d.y))
    }
}

impl fmt::Display for Trans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mirror = if self.mirror { "m" } else { "r" };
        write!(f, "{}{} {}", mirror, self.rotation as u32 * 90, self.disp)
    }
}
