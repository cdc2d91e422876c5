//! Rectangle-set boolean engine
//!
//! Operands are decomposed into rectangles, combined, and the result is
//! coalesced and returned as box polygons. Texts never take part in
//! boolean operations.

use super::{Polygon, Rect};

/// Boolean operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolOp {
    And,
    Not,
    Or,
}

impl BoolOp {
    pub fn apply(self, a: &[Polygon], b: &[Polygon]) -> Vec<Polygon> {
        match self {
            BoolOp::And => and(a, b),
            BoolOp::Not => not(a, b),
            BoolOp::Or => or(a, b),
        }
    }
}

impl std::fmt::Display for BoolOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BoolOp::And => "and",
            BoolOp::Not => "not",
            BoolOp::Or => "or",
        };
        f.write_str(s)
    }
}

fn decompose(polygons: &[Polygon]) -> Vec<Rect> {
    polygons.iter().flat_map(|p| p.rects()).collect()
}

fn to_polygons(rects: Vec<Rect>) -> Vec<Polygon> {
    coalesce(rects).into_iter().map(Polygon::from_rect).collect()
}

pub fn and_rects(a: &[Rect], b: &[Rect]) -> Vec<Rect> {
    let mut out = Vec::new();
    for ra in a {
        for rb in b {
            if let Some(r) = ra.intersection(rb) {
                out.push(r);
            }
        }
    }
    out
}

pub fn not_rects(a: &[Rect], b: &[Rect]) -> Vec<Rect> {
    let mut out = Vec::new();
    for ra in a {
        let mut pieces = vec![*ra];
        for rb in b.iter().filter(|rb| rb.overlaps(ra)) {
            pieces = pieces.iter().flat_map(|p| p.subtract(rb)).collect();
            if pieces.is_empty() {
                break;
            }
        }
        out.extend(pieces);
    }
    out
}

pub fn and(a: &[Polygon], b: &[Polygon]) -> Vec<Polygon> {
    to_polygons(and_rects(&decompose(a), &decompose(b)))
}

pub fn not(a: &[Polygon], b: &[Polygon]) -> Vec<Polygon> {
    to_polygons(not_rects(&decompose(a), &decompose(b)))
}

pub fn or(a: &[Polygon], b: &[Polygon]) -> Vec<Polygon> {
    a.iter().chain(b.iter()).cloned().collect()
}

/// Merge rectangles sharing a full edge until nothing changes
pub fn coalesce(mut rects: Vec<Rect>) -> Vec<Rect> {
    rects.sort();
    rects.dedup();
    loop {
        let mut merged = false;
        'outer: for i in 0..rects.len() {
            for j in (i + 1)..rects.len() {
                if let Some(m) = merge_pair(&rects[i], &rects[j]) {
                    rects[i] = m;
                    rects.remove(j);
                    merged = true;
                    break 'outer;
                }
            }
        }
        if !merged {
            break;
        }
    }
    rects.sort();
    rects
}

fn merge_pair(a: &Rect, b: &Rect) -> Option<Rect> {
    let same_rows = a.bottom == b.bottom && a.top == b.top;
    if same_rows && (a.right == b.left || b.right == a.left) {
        return Some(a.union(b));
    }
    let same_cols = a.left == b.left && a.right == b.right;
    if same_cols && (a.top == b.bottom || b.top == a.bottom) {
        return Some(a.union(b));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes(rects: &[Rect]) -> Vec<Polygon> {
        rects.iter().copied().map(Polygon::from_rect).collect()
    }

    #[test]
    fn test_gate_split() {
        let active = boxes(&[Rect::new(0, 0, 300, 100)]);
        let poly = boxes(&[Rect::new(100, -50, 200, 150)]);

        let gate = and(&active, &poly);
        assert_eq!(gate, boxes(&[Rect::new(100, 0, 200, 100)]));

        let sd = not(&active, &gate);
        assert_eq!(
            sd,
            boxes(&[Rect::new(0, 0, 100, 100), Rect::new(200, 0, 300, 100)])
        );
    }

    #[test]
    fn test_not_without_overlap_keeps_operand() {
        let a = boxes(&[Rect::new(0, 0, 10, 10)]);
        let b = boxes(&[Rect::new(10, 0, 20, 10)]);
        assert_eq!(not(&a, &b), a);
        assert!(and(&a, &b).is_empty());
    }

    #[test]
    fn test_coalesce_restores_rectangle() {
        let pieces = vec![
            Rect::new(0, 0, 10, 10),
            Rect::new(10, 0, 20, 10),
            Rect::new(0, 10, 20, 20),
        ];
        assert_eq!(coalesce(pieces), vec![Rect::new(0, 0, 20, 20)]);
    }
}
