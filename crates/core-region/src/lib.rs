//! Integer rectangle and region algebra for the display pipeline.
//!
//! A [`Region`] is a canonical, y-x banded list of disjoint non-empty
//! rectangles. Every operation returns the same canonical shape, so region
//! equality reduces to element-wise rectangle comparison. The whole occlusion
//! machinery in the draw-item tree leans on that property: two regions that
//! cover the same pixels are `==`, full stop.
//!
//! Invariants of the canonical form:
//! * Rectangles are non-empty (`left < right`, `top < bottom`).
//! * Rectangles are grouped into horizontal bands: rects in a band share
//!   `top` and `bottom`, are sorted by `left`, and are pairwise disjoint
//!   with at least one empty pixel column between them (touching rects are
//!   merged).
//! * Bands are sorted by `top` and never overlap vertically. Two vertically
//!   adjacent bands with identical x-spans are merged into one.
//!
//! Coordinates are `i32`, rectangles half-open (`right`/`bottom` exclusive).

mod rect;

pub use rect::{Point, Rect};

use smallvec::SmallVec;

/// Classification of how two regions relate, produced by [`Region::test`].
///
/// `SHARED` — some pixel is in both; `LEFT_EXCLUSIVE` — some pixel is only in
/// `self`; `RIGHT_EXCLUSIVE` — some pixel is only in `other`. An empty result
/// means both regions are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionTest(u8);

impl RegionTest {
    pub const EMPTY: RegionTest = RegionTest(0);
    pub const SHARED: u8 = 0b001;
    pub const LEFT_EXCLUSIVE: u8 = 0b010;
    pub const RIGHT_EXCLUSIVE: u8 = 0b100;
    const ALL: u8 = 0b111;

    pub fn shared(self) -> bool {
        self.0 & Self::SHARED != 0
    }
    pub fn left_exclusive(self) -> bool {
        self.0 & Self::LEFT_EXCLUSIVE != 0
    }
    pub fn right_exclusive(self) -> bool {
        self.0 & Self::RIGHT_EXCLUSIVE != 0
    }
    /// True when both regions cover exactly the same pixels (and are
    /// non-empty).
    pub fn shared_only(self) -> bool {
        self.0 == Self::SHARED
    }
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Canonical set of disjoint rectangles. See the module docs for the exact
/// shape invariants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: SmallVec<[Rect; 4]>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    /// Region covering exactly one rectangle (empty input yields the empty
    /// region).
    pub fn from_rect(r: Rect) -> Self {
        let mut rects = SmallVec::new();
        if !r.is_empty() {
            rects.push(r);
        }
        Self { rects }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn rect_count(&self) -> usize {
        self.rects.len()
    }

    /// Canonical rectangle list, band order.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Smallest rectangle covering the whole region; empty rect for the
    /// empty region.
    pub fn bounds(&self) -> Rect {
        let mut it = self.rects.iter();
        let Some(first) = it.next() else {
            return Rect::EMPTY;
        };
        let mut b = *first;
        for r in it {
            b.left = b.left.min(r.left);
            b.top = b.top.min(r.top);
            b.right = b.right.max(r.right);
            b.bottom = b.bottom.max(r.bottom);
        }
        b
    }

    /// Translate every rectangle by (dx, dy). Translation preserves the
    /// canonical form, so this is a plain per-rect offset.
    pub fn offset(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            r.left += dx;
            r.right += dx;
            r.top += dy;
            r.bottom += dy;
        }
    }

    pub fn add(&mut self, r: Rect) {
        if r.is_empty() {
            return;
        }
        *self = combine(self, &Region::from_rect(r), |a, b| a || b);
    }

    pub fn union(&mut self, other: &Region) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        *self = combine(self, other, |a, b| a || b);
    }

    pub fn intersect(&mut self, other: &Region) {
        if self.is_empty() {
            return;
        }
        if other.is_empty() {
            self.clear();
            return;
        }
        if !self.bounds().intersects(&other.bounds()) {
            self.clear();
            return;
        }
        *self = combine(self, other, |a, b| a && b);
    }

    pub fn intersect_rect(&mut self, r: Rect) {
        self.intersect(&Region::from_rect(r));
    }

    pub fn subtract(&mut self, other: &Region) {
        if self.is_empty() || other.is_empty() {
            return;
        }
        if !self.bounds().intersects(&other.bounds()) {
            return;
        }
        *self = combine(self, other, |a, b| a && !b);
    }

    pub fn subtract_rect(&mut self, r: Rect) {
        self.subtract(&Region::from_rect(r));
    }

    /// True when some pixel is covered by both regions.
    pub fn intersects(&self, other: &Region) -> bool {
        if self.is_empty() || other.is_empty() || !self.bounds().intersects(&other.bounds()) {
            return false;
        }
        self.test(other).shared()
    }

    pub fn intersects_rect(&self, r: Rect) -> bool {
        self.intersects(&Region::from_rect(r))
    }

    /// True when `other` is fully inside `self`.
    pub fn contains(&self, other: &Region) -> bool {
        if other.is_empty() {
            return true;
        }
        !self.test(other).right_exclusive()
    }

    pub fn contains_point(&self, p: Point) -> bool {
        self.rects.iter().any(|r| r.contains_point(p))
    }

    /// Classify the relation between `self` (left) and `other` (right) in a
    /// single sweep: which of {shared, left-only, right-only} pixels exist.
    pub fn test(&self, other: &Region) -> RegionTest {
        let mut bits = 0u8;
        if self.is_empty() {
            if !other.is_empty() {
                bits |= RegionTest::RIGHT_EXCLUSIVE;
            }
            return RegionTest(bits);
        }
        if other.is_empty() {
            return RegionTest(RegionTest::LEFT_EXCLUSIVE);
        }
        sweep(self, other, |in_a, in_b| {
            match (in_a, in_b) {
                (true, true) => bits |= RegionTest::SHARED,
                (true, false) => bits |= RegionTest::LEFT_EXCLUSIVE,
                (false, true) => bits |= RegionTest::RIGHT_EXCLUSIVE,
                (false, false) => {}
            }
            bits == RegionTest::ALL
        });
        RegionTest(bits)
    }

    /// Total covered area in pixels.
    pub fn area(&self) -> u64 {
        self.rects.iter().map(|r| r.area()).sum()
    }

    #[cfg(debug_assertions)]
    fn check_canonical(&self) {
        for w in self.rects.windows(2) {
            let (a, b) = (&w[0], &w[1]);
            assert!(!a.is_empty() && !b.is_empty());
            if a.top == b.top {
                assert_eq!(a.bottom, b.bottom, "band with ragged bottom");
                assert!(a.right < b.left, "band rects touching or out of order");
            } else {
                assert!(a.bottom <= b.top, "bands overlap vertically");
            }
        }
    }
}

impl From<Rect> for Region {
    fn from(r: Rect) -> Self {
        Region::from_rect(r)
    }
}

/// One elementary x-span with membership flags, used by the sweep.
#[derive(Clone, Copy)]
struct Edge {
    x: i32,
    /// +1 opening / -1 closing, per source region.
    a: i8,
    b: i8,
}

/// Sweep the elementary bands of `a` and `b`, reporting membership of every
/// elementary cell to `visit(in_a, in_b)`. `visit` returns `true` to stop
/// early. Cells outside both regions are only reported between covered
/// spans, which is sufficient for relation classification.
fn sweep(a: &Region, b: &Region, mut visit: impl FnMut(bool, bool) -> bool) {
    let mut ys: Vec<i32> = Vec::with_capacity(a.rects.len() * 2 + b.rects.len() * 2);
    for r in a.rects.iter().chain(b.rects.iter()) {
        ys.push(r.top);
        ys.push(r.bottom);
    }
    ys.sort_unstable();
    ys.dedup();

    let mut edges: Vec<Edge> = Vec::new();
    for band in ys.windows(2) {
        let (y0, y1) = (band[0], band[1]);
        if y0 == y1 {
            continue;
        }
        edges.clear();
        for r in &a.rects {
            if r.top <= y0 && r.bottom >= y1 {
                edges.push(Edge { x: r.left, a: 1, b: 0 });
                edges.push(Edge { x: r.right, a: -1, b: 0 });
            }
        }
        for r in &b.rects {
            if r.top <= y0 && r.bottom >= y1 {
                edges.push(Edge { x: r.left, a: 0, b: 1 });
                edges.push(Edge { x: r.right, a: 0, b: -1 });
            }
        }
        if edges.is_empty() {
            continue;
        }
        edges.sort_unstable_by_key(|e| e.x);
        let mut in_a = 0i32;
        let mut in_b = 0i32;
        let mut i = 0;
        while i < edges.len() {
            let x = edges[i].x;
            while i < edges.len() && edges[i].x == x {
                in_a += edges[i].a as i32;
                in_b += edges[i].b as i32;
                i += 1;
            }
            // Span from x to the next edge (or nothing if this closed all).
            if i < edges.len() && visit(in_a > 0, in_b > 0) {
                return;
            }
        }
    }
}

/// Combine two canonical regions with a boolean span operator, producing a
/// canonical result. Shared backbone of union / intersect / subtract.
fn combine(a: &Region, b: &Region, mut keep: impl FnMut(bool, bool) -> bool) -> Region {
    let mut ys: Vec<i32> = Vec::with_capacity((a.rects.len() + b.rects.len()) * 2);
    for r in a.rects.iter().chain(b.rects.iter()) {
        ys.push(r.top);
        ys.push(r.bottom);
    }
    ys.sort_unstable();
    ys.dedup();

    let mut out: SmallVec<[Rect; 4]> = SmallVec::new();
    // Start of the band group currently open for vertical coalescing, and
    // the number of rects it produced.
    let mut prev_band: Option<(usize, i32)> = None; // (first rect index, bottom)
    let mut edges: Vec<Edge> = Vec::new();

    for band in ys.windows(2) {
        let (y0, y1) = (band[0], band[1]);
        if y0 == y1 {
            continue;
        }
        edges.clear();
        for r in &a.rects {
            if r.top <= y0 && r.bottom >= y1 {
                edges.push(Edge { x: r.left, a: 1, b: 0 });
                edges.push(Edge { x: r.right, a: -1, b: 0 });
            }
        }
        for r in &b.rects {
            if r.top <= y0 && r.bottom >= y1 {
                edges.push(Edge { x: r.left, a: 0, b: 1 });
                edges.push(Edge { x: r.right, a: 0, b: -1 });
            }
        }
        edges.sort_unstable_by_key(|e| e.x);

        let band_start = out.len();
        let mut in_a = 0i32;
        let mut in_b = 0i32;
        let mut open: Option<i32> = None;
        let mut i = 0;
        while i < edges.len() {
            let x = edges[i].x;
            while i < edges.len() && edges[i].x == x {
                in_a += edges[i].a as i32;
                in_b += edges[i].b as i32;
                i += 1;
            }
            let covered = keep(in_a > 0, in_b > 0);
            match (open, covered) {
                (None, true) => open = Some(x),
                (Some(start), false) => {
                    push_span(&mut out, start, x, y0, y1);
                    open = None;
                }
                _ => {}
            }
        }
        debug_assert!(open.is_none(), "unbalanced span edges");

        if out.len() == band_start {
            // Band produced nothing: close any open group.
            prev_band = None;
            continue;
        }
        // Vertical coalescing: merge with the previous band when contiguous
        // and x-identical.
        if let Some((prev_start, prev_bottom)) = prev_band {
            let prev_len = band_start - prev_start;
            let cur_len = out.len() - band_start;
            let same = prev_bottom == y0
                && prev_len == cur_len
                && (0..cur_len).all(|k| {
                    let p = out[prev_start + k];
                    let c = out[band_start + k];
                    p.left == c.left && p.right == c.right
                });
            if same {
                for k in 0..prev_len {
                    out[prev_start + k].bottom = y1;
                }
                out.truncate(band_start);
                prev_band = Some((prev_start, y1));
                continue;
            }
        }
        prev_band = Some((band_start, y1));
    }

    let region = Region { rects: out };
    #[cfg(debug_assertions)]
    region.check_canonical();
    region
}

fn push_span(out: &mut SmallVec<[Rect; 4]>, left: i32, right: i32, top: i32, bottom: i32) {
    if left >= right {
        return;
    }
    // Horizontal coalescing with the last rect of the same band.
    if let Some(last) = out.last_mut()
        && last.top == top
        && last.right == left
    {
        last.right = right;
        return;
    }
    out.push(Rect {
        left,
        top,
        right,
        bottom,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(l: i32, t: i32, r: i32, b: i32) -> Rect {
        Rect::new(l, t, r, b)
    }

    #[test]
    fn empty_region_basics() {
        let r = Region::new();
        assert!(r.is_empty());
        assert_eq!(r.rect_count(), 0);
        assert_eq!(r.bounds(), Rect::EMPTY);
    }

    #[test]
    fn add_disjoint_keeps_both() {
        let mut reg = Region::from_rect(rect(0, 0, 10, 10));
        reg.add(rect(20, 20, 30, 30));
        assert_eq!(reg.rect_count(), 2);
        assert_eq!(reg.area(), 200);
    }

    #[test]
    fn add_touching_merges() {
        let mut reg = Region::from_rect(rect(0, 0, 10, 10));
        reg.add(rect(10, 0, 20, 10));
        assert_eq!(reg.rect_count(), 1);
        assert_eq!(reg.rects()[0], rect(0, 0, 20, 10));
        // Vertically adjacent with identical spans merges too.
        reg.add(rect(0, 10, 20, 20));
        assert_eq!(reg.rect_count(), 1);
        assert_eq!(reg.rects()[0], rect(0, 0, 20, 20));
    }

    #[test]
    fn subtract_center_leaves_frame() {
        let mut reg = Region::from_rect(rect(0, 0, 30, 30));
        reg.subtract_rect(rect(10, 10, 20, 20));
        assert_eq!(reg.area(), 900 - 100);
        assert!(!reg.contains_point(Point::new(15, 15)));
        assert!(reg.contains_point(Point::new(5, 15)));
        assert!(reg.contains_point(Point::new(15, 5)));
        // Frame shape: top band, two side rects, bottom band.
        assert_eq!(reg.rect_count(), 4);
    }

    #[test]
    fn overlapping_fills_canonical_split() {
        // Fill-then-overlap shape: the old fill keeps everything minus
        // the new fill's overlap.
        let mut first = Region::from_rect(rect(0, 0, 100, 100));
        first.subtract_rect(rect(50, 50, 150, 150));
        assert_eq!(first.area(), 100 * 100 - 50 * 50);
        assert!(first.contains_point(Point::new(25, 25)));
        assert!(!first.contains_point(Point::new(75, 75)));
    }

    #[test]
    fn intersect_basics() {
        let mut a = Region::from_rect(rect(0, 0, 100, 100));
        let b = Region::from_rect(rect(50, 50, 150, 150));
        a.intersect(&b);
        assert_eq!(a.rects(), &[rect(50, 50, 100, 100)]);
    }

    #[test]
    fn test_classification() {
        let a = Region::from_rect(rect(0, 0, 10, 10));
        let same = Region::from_rect(rect(0, 0, 10, 10));
        let inside = Region::from_rect(rect(2, 2, 8, 8));
        let outside = Region::from_rect(rect(20, 0, 30, 10));
        let overlap = Region::from_rect(rect(5, 0, 15, 10));

        assert!(a.test(&same).shared_only());
        let t = a.test(&inside);
        assert!(t.shared() && t.left_exclusive() && !t.right_exclusive());
        let t = inside.test(&a);
        assert!(t.shared() && !t.left_exclusive() && t.right_exclusive());
        let t = a.test(&outside);
        assert!(!t.shared() && t.left_exclusive() && t.right_exclusive());
        let t = a.test(&overlap);
        assert!(t.shared() && t.left_exclusive() && t.right_exclusive());
        assert!(a.test(&Region::new()).left_exclusive());
        assert!(Region::new().test(&a).right_exclusive());
        assert!(Region::new().test(&Region::new()).is_empty());
    }

    #[test]
    fn contains_and_intersects() {
        let a = Region::from_rect(rect(0, 0, 100, 100));
        let inner = Region::from_rect(rect(10, 10, 20, 20));
        assert!(a.contains(&inner));
        assert!(!inner.contains(&a));
        assert!(a.intersects(&inner));
        assert!(!a.intersects(&Region::from_rect(rect(200, 200, 300, 300))));
        assert!(a.contains(&Region::new()));
    }

    #[test]
    fn offset_moves_all() {
        let mut reg = Region::from_rect(rect(0, 0, 10, 10));
        reg.add(rect(20, 0, 30, 10));
        reg.offset(5, 7);
        assert_eq!(reg.rects()[0], rect(5, 7, 15, 17));
        assert_eq!(reg.rects()[1], rect(25, 7, 35, 17));
    }

    #[test]
    fn union_of_cross_shape() {
        let mut reg = Region::from_rect(rect(10, 0, 20, 30));
        reg.add(rect(0, 10, 30, 20));
        assert_eq!(reg.area(), 10 * 30 + 30 * 10 - 10 * 10);
        // Canonical: three bands.
        assert_eq!(reg.rect_count(), 3);
        assert_eq!(reg.rects()[0], rect(10, 0, 20, 10));
        assert_eq!(reg.rects()[1], rect(0, 10, 30, 20));
        assert_eq!(reg.rects()[2], rect(10, 20, 20, 30));
    }

    #[test]
    fn add_then_subtract_round_trip() {
        let mut reg = Region::from_rect(rect(0, 0, 40, 40));
        reg.subtract_rect(rect(10, 10, 30, 30));
        let before = reg.clone();
        let probe = rect(100, 5, 140, 45);
        reg.add(probe);
        reg.subtract_rect(probe);
        assert_eq!(reg, before);
    }
}
