//! Polygons, texts and shapes

use serde::{Deserialize, Serialize};

use super::{Coord, Point, Rect, Trans};

/// Manhattan polygon (hull only, no holes)
///
/// Edges are expected to be horizontal or vertical. The slab decomposition
/// used for all area tests ignores diagonal edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn from_rect(r: Rect) -> Self {
        Self {
            points: vec![
                Point::new(r.left, r.bottom),
                Point::new(r.left, r.top),
                Point::new(r.right, r.top),
                Point::new(r.right, r.bottom),
            ],
        }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn vertex_count(&self) -> usize {
        self.points.len()
    }

    pub fn bbox(&self) -> Rect {
        let mut it = self.points.iter();
        let Some(first) = it.next() else {
            return Rect::at(Point::default());
        };
        it.fold(Rect::at(*first), |acc, p| acc.union(&Rect::at(*p)))
    }

    pub fn is_manhattan(&self) -> bool {
        self.edges().all(|(a, b)| a.x == b.x || a.y == b.y)
    }

    /// True if the polygon is exactly its bounding box
    pub fn is_box(&self) -> bool {
        self.points.len() == 4 && self.is_manhattan() && self.area() == self.bbox().area()
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }

    /// Enclosed area (shoelace formula)
    pub fn area(&self) -> i128 {
        let twice: i128 = self
            .edges()
            .map(|(a, b)| a.x as i128 * b.y as i128 - b.x as i128 * a.y as i128)
            .sum();
        twice.abs() / 2
    }

    /// Decompose into horizontal slabs of disjoint rectangles
    pub fn rects(&self) -> Vec<Rect> {
        if self.points.len() < 3 {
            return Vec::new();
        }
        if self.is_box() {
            return vec![self.bbox()];
        }

        let mut ys: Vec<Coord> = self.points.iter().map(|p| p.y).collect();
        ys.sort_unstable();
        ys.dedup();

        let verticals: Vec<(Coord, Coord, Coord)> = self
            .edges()
            .filter(|(a, b)| a.x == b.x && a.y != b.y)
            .map(|(a, b)| (a.x, a.y.min(b.y), a.y.max(b.y)))
            .collect();

        let mut rects = Vec::new();
        for slab in ys.windows(2) {
            let (y0, y1) = (slab[0], slab[1]);
            let mut xs: Vec<Coord> = verticals
                .iter()
                .filter(|(_, lo, hi)| *lo <= y0 && *hi >= y1)
                .map(|(x, _, _)| *x)
                .collect();
            xs.sort_unstable();
            for pair in xs.chunks_exact(2) {
                if pair[0] < pair[1] {
                    rects.push(Rect::new(pair[0], y0, pair[1], y1));
                }
            }
        }
        rects
    }

    /// Closed point containment
    pub fn contains(&self, p: Point) -> bool {
        self.bbox().contains(p) && self.rects().iter().any(|r| r.contains(p))
    }

    /// Closed contact with another polygon
    pub fn interacts(&self, other: &Polygon) -> bool {
        if !self.bbox().touches(&other.bbox()) {
            return false;
        }
        let theirs = other.rects();
        self.rects()
            .iter()
            .any(|a| theirs.iter().any(|b| a.touches(b)))
    }

    pub fn transformed(&self, trans: &Trans) -> Polygon {
        Polygon {
            points: self.points.iter().map(|p| trans.apply(*p)).collect(),
        }
    }
}

impl From<Rect> for Polygon {
    fn from(r: Rect) -> Self {
        Polygon::from_rect(r)
    }
}

/// A text label at a point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Text {
    pub string: String,
    pub position: Point,
}

impl Text {
    pub fn new(string: impl Into<String>, position: Point) -> Self {
        Self {
            string: string.into(),
            position,
        }
    }

    pub fn transformed(&self, trans: &Trans) -> Text {
        Text {
            string: self.string.clone(),
            position: trans.apply(self.position),
        }
    }
}

/// A shape stored on a layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Polygon(Polygon),
    Text(Text),
}

impl Shape {
    pub fn bbox(&self) -> Rect {
        match self {
            Shape::Polygon(p) => p.bbox(),
            Shape::Text(t) => Rect::at(t.position),
        }
    }

    pub fn transformed(&self, trans: &Trans) -> Shape {
        match self {
            Shape::Polygon(p) => Shape::Polygon(p.transformed(trans)),
            Shape::Text(t) => Shape::Text(t.transformed(trans)),
        }
    }

    pub fn as_polygon(&self) -> Option<&Polygon> {
        match self {
            Shape::Polygon(p) => Some(p),
            Shape::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Shape::Text(t) => Some(t),
            Shape::Polygon(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Shape::Text(_))
    }

    /// Closed point containment; a text contains only its own position
    pub fn contains(&self, p: Point) -> bool {
        match self {
            Shape::Polygon(poly) => poly.contains(p),
            Shape::Text(t) => t.position == p,
        }
    }
}

impl From<Rect> for Shape {
    fn from(r: Rect) -> Self {
        Shape::Polygon(Polygon::from_rect(r))
    }
}

impl From<Polygon> for Shape {
    fn from(p: Polygon) -> Self {
        Shape::Polygon(p)
    }
}

impl From<Text> for Shape {
    fn from(t: Text) -> Self {
        Shape::Text(t)
    }
}
